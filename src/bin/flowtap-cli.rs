//! flowtap demo CLI — ambient tooling around the `flowtap` library, not part
//! of its core contract. Mirrors the teacher's `netsentinel-capture` binary:
//! `clap` argument parsing, `tracing-subscriber` setup, a `ctrlc` shutdown
//! handler, and a stdout-printing `Observer` implementation standing in for
//! whatever real transport a deployment would wire up (§1: the transport is
//! an external collaborator).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flowtap::engine::observer::{Event, EventKind};
use flowtap::{CaptureConfig, Engine, EngineConfig, Observer};

#[derive(Parser, Debug)]
#[command(name = "flowtap")]
#[command(author = "flowtap contributors")]
#[command(version)]
#[command(about = "Live network packet-analysis engine", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose (debug) logging.
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capturable network interfaces.
    ListInterfaces,
    /// Capture live from an interface until Ctrl-C.
    Capture {
        /// Interface name (as reported by list-interfaces).
        interface: String,
        /// Optional BPF filter, libpcap syntax.
        #[arg(long)]
        bpf: Option<String>,
        /// Capture snaplen.
        #[arg(long, default_value_t = 65535)]
        snaplen: i32,
    },
    /// Replay a PCAP file through the pipeline.
    LoadPcap {
        path: PathBuf,
        /// Export the retained frames back out after loading, for a
        /// round-trip check (§8 scenario 6).
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

struct StdoutObserver;

impl Observer for StdoutObserver {
    fn send(&self, event: Event) {
        match event.kind {
            EventKind::Packet => {
                if let Some(summary) = event.payload.as_object() {
                    println!(
                        "#{} {:>8.3}s {} {} bytes {}",
                        summary.get("index").and_then(|v| v.as_u64()).unwrap_or(0),
                        summary.get("time_offset").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        summary.get("protocol").and_then(|v| v.as_str()).unwrap_or("?"),
                        summary.get("length").and_then(|v| v.as_u64()).unwrap_or(0),
                        summary.get("info").and_then(|v| v.as_str()).unwrap_or(""),
                    );
                }
            }
            EventKind::CaptureStats => println!("stats: {}", event.payload),
            EventKind::CaptureStarted => println!("-- capture started --"),
            EventKind::CaptureStopped => println!("-- capture stopped --"),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.debug)?;

    match args.command {
        Command::ListInterfaces => {
            let engine = Arc::new(Engine::new(EngineConfig::default()));
            for iface in engine.list_interfaces()? {
                println!("{}  {}  {:?}", iface.name, iface.description, iface.addresses);
            }
        }
        Command::Capture { interface, bpf, snaplen } => {
            let engine = Arc::new(Engine::new(EngineConfig::default()));
            let observer: Arc<dyn Observer> = Arc::new(StdoutObserver);
            engine.register_observer(&observer);

            let mut request = CaptureConfig::new(interface).with_snaplen(snaplen);
            if let Some(filter) = bpf {
                request = request.with_bpf(filter);
            }
            engine.start_capture(request).context("failed to start capture")?;

            let running = Arc::new(AtomicBool::new(true));
            let r = Arc::clone(&running);
            ctrlc::set_handler(move || {
                info!("received shutdown signal");
                r.store(false, Ordering::SeqCst);
            })
            .context("failed to install Ctrl+C handler")?;

            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }

            engine.stop_capture().await;
            info!("packet_count={}", engine.packet_count());
        }
        Command::LoadPcap { path, export } => {
            let engine = Arc::new(Engine::new(EngineConfig::default()));
            let observer: Arc<dyn Observer> = Arc::new(StdoutObserver);
            engine.register_observer(&observer);

            engine.load_pcap(&path).await.with_context(|| format!("failed to load {:?}", path))?;
            info!("loaded {} packets from {:?}", engine.packet_count(), path);

            if let Some(export_path) = export {
                let file = std::fs::File::create(&export_path)
                    .with_context(|| format!("failed to create {:?}", export_path))?;
                engine.export_pcap(file)?;
                info!("exported to {:?}", export_path);
            }
        }
    }

    Ok(())
}

fn setup_logging(debug: bool) -> Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(format!("flowtap={}", level).parse().unwrap());

    tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(true)).init();
    Ok(())
}
