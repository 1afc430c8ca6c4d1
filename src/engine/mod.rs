//! Engine / Orchestrator (C7, §4.7): owns the session lifecycle and fans a
//! frame from C1 through the parser into C3/C4/C5/C6, then to observers.
//!
//! Grounded in the teacher's `aggregator::pipeline::Pipeline` (shared state
//! behind `Arc`, tasks spawned with `tokio::spawn`, shutdown via
//! `tokio::sync::broadcast`) and `capture::main` (a blocking capture thread
//! bridged into the rest of the system, a `ctrlc` handler at the binary
//! boundary). Unlike the teacher, per-packet processing here is entirely
//! synchronous (parsing, flow tracking, stats, retention are all in-memory),
//! so the capture thread performs that work directly rather than handing
//! frames across a channel to a second async task.

pub mod observer;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capture::{self, file::FileCapture, live::LiveCapture, CaptureSource, InterfaceDescriptor, ReadOutcome};
use crate::config::{CaptureConfig, EngineConfig};
use crate::decode::{self, PacketSummary};
use crate::error::{EngineError, Result};
use crate::flow::{Flow, FlowTracker};
use crate::frame::{Frame, LinkType};
use crate::retention::RawRetention;
use crate::stats::{ProtocolStat, ProtocolStats};
use crate::stream::{StreamData, StreamManager};
use observer::{Event, EventKind, Observer, ObserverRegistry};

struct Session {
    cancel: Arc<AtomicBool>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    flow_task: Option<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
}

struct EngineState {
    capturing: bool,
    session_start: Option<DateTime<Utc>>,
    pkt_count: u64,
    link_type: LinkType,
    session: Option<Session>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self { capturing: false, session_start: None, pkt_count: 0, link_type: LinkType::Ethernet, session: None }
    }
}

/// The C7 orchestrator. Construct with [`Engine::new`], wrap in `Arc`, then
/// call `start_capture`/`stop_capture` (which need to hand clones of the
/// `Arc` to spawned tasks, mirroring [`StreamManager::start`](crate::stream::StreamManager::start)).
pub struct Engine {
    config: EngineConfig,
    observers: ObserverRegistry,
    flow: FlowTracker,
    stats: ProtocolStats,
    retention: RawRetention,
    stream: Arc<StreamManager>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let stream = Arc::new(StreamManager::new(config.stream_gap_threshold));
        let flow = FlowTracker::new(config.flow_inactivity_timeout, config.flow_inactivity_timeout_closed);
        let observers = ObserverRegistry::new(config.observer_queue_depth);
        Self {
            config,
            observers,
            flow,
            stats: ProtocolStats::new(),
            retention: RawRetention::new(),
            stream,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn register_observer(&self, observer: &Arc<dyn Observer>) {
        self.observers.register(observer);
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn Observer>) {
        self.observers.unregister(observer);
    }

    /// §6 `list_interfaces`: passes through to the OS adapter.
    pub fn list_interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        capture::list_interfaces()
    }

    /// §4.7 `start_capture`.
    pub fn start_capture(self: &Arc<Self>, request: CaptureConfig) -> Result<()> {
        let source = LiveCapture::open(&request.interface, request.bpf.as_deref(), request.snaplen)?;
        self.start_with_source(source, request.interface)
    }

    /// The guts of `start_capture`, generic over the capture source so tests
    /// can drive the engine with synthetic frames instead of a real NIC.
    pub fn start_with_source(
        self: &Arc<Self>,
        mut source: impl CaptureSource + 'static,
        label: impl Into<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.capturing {
            return Err(EngineError::AlreadyRunning);
        }

        let link_type = source.link_type();
        let label = label.into();

        self.retention.reset(link_type);
        self.flow.reset();
        self.stats.reset();
        self.stream.reset();
        self.stream.start();

        state.capturing = true;
        state.link_type = link_type;
        state.session_start = None;
        state.pkt_count = 0;

        self.observers.broadcast(Event::new(
            EventKind::CaptureStarted,
            serde_json::json!({ "interface": label, "link_type": format!("{:?}", link_type) }),
        ));

        let cancel = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, _) = broadcast::channel(1);

        let engine = Arc::clone(self);
        let thread_cancel = Arc::clone(&cancel);
        let capture_thread = std::thread::spawn(move || {
            info!("ingest loop starting");
            loop {
                if thread_cancel.load(Ordering::SeqCst) {
                    break;
                }
                match source.read() {
                    ReadOutcome::Packet(record) => engine.ingest_packet(record.raw, record.timestamp, record.wire_length),
                    ReadOutcome::Timeout => continue,
                    ReadOutcome::ReadFailed(e) => {
                        warn!("capture read failed: {}", e);
                        continue;
                    }
                    ReadOutcome::Closed | ReadOutcome::EndOfFile => break,
                }
            }
            source.close();
            info!("ingest loop stopped");
        });

        let flow_task = spawn_flow_broadcaster(Arc::clone(self), shutdown_tx.subscribe());
        let stats_task = spawn_stats_broadcaster(Arc::clone(self), shutdown_tx.subscribe());

        state.session =
            Some(Session { cancel, capture_thread: Some(capture_thread), shutdown_tx, flow_task: Some(flow_task), stats_task: Some(stats_task) });

        Ok(())
    }

    /// §4.7 `stop_capture`: idempotent, returns only after C1 is closed.
    pub async fn stop_capture(self: &Arc<Self>) {
        let session = {
            let mut state = self.state.lock();
            if !state.capturing {
                return;
            }
            state.capturing = false;
            state.session.take()
        };
        let Some(mut session) = session else { return };

        self.observers.broadcast(Event::new(EventKind::CaptureStopped, serde_json::json!({})));

        session.cancel.store(true, Ordering::SeqCst);
        let _ = session.shutdown_tx.send(());

        if let Some(handle) = session.capture_thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        if let Some(handle) = session.flow_task.take() {
            let _ = handle.await;
        }
        if let Some(handle) = session.stats_task.take() {
            let _ = handle.await;
        }

        self.stream.stop().await;
    }

    /// §4.7 `load_pcap`: resets state, then streams a file through the same
    /// per-packet pipeline as live capture. No periodic broadcasters run;
    /// terminal state is left for post-hoc querying.
    pub async fn load_pcap(self: &Arc<Self>, path: impl AsRef<std::path::Path>) -> Result<()> {
        let source = FileCapture::open(path)?;
        self.load_with_source(source).await
    }

    /// The guts of `load_pcap`, generic over the capture source so tests can
    /// replay synthetic frames instead of a real PCAP file.
    pub async fn load_with_source(self: &Arc<Self>, mut source: impl CaptureSource) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.capturing {
                return Err(EngineError::AlreadyRunning);
            }
            state.capturing = true;
        }

        let link_type = source.link_type();
        self.retention.reset(link_type);
        self.flow.reset();
        self.stats.reset();
        self.stream.reset();

        {
            let mut state = self.state.lock();
            state.link_type = link_type;
            state.session_start = None;
            state.pkt_count = 0;
        }

        let mut since_yield = 0u64;
        loop {
            match source.read() {
                ReadOutcome::Packet(record) => {
                    self.ingest_packet(record.raw, record.timestamp, record.wire_length);
                    since_yield += 1;
                    if since_yield >= self.config.pcap_replay_batch {
                        since_yield = 0;
                        tokio::task::yield_now().await;
                    }
                }
                ReadOutcome::EndOfFile | ReadOutcome::Closed => break,
                ReadOutcome::Timeout => continue,
                ReadOutcome::ReadFailed(e) => {
                    warn!("pcap replay read failed: {}", e);
                    continue;
                }
            }
        }
        source.close();

        self.state.lock().capturing = false;
        Ok(())
    }

    pub fn packet_count(&self) -> u64 {
        self.state.lock().pkt_count
    }

    pub fn protocol_stats(&self) -> std::collections::HashMap<String, ProtocolStat> {
        self.stats.snapshot()
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.flow.get_flows()
    }

    pub fn stream_data(&self, id: u64) -> Option<StreamData> {
        self.stream.get_stream_data(id)
    }

    pub fn export_pcap<W: Write>(&self, writer: W) -> Result<()> {
        self.retention.export_pcap(writer)
    }

    /// §4.7 ingest-loop per-packet work order, shared by live capture and
    /// `load_pcap`: index, retain, parse, stats, flow, stream, emit.
    fn ingest_packet(&self, raw: Vec<u8>, timestamp: DateTime<Utc>, wire_length: u32) {
        let (index, session_start, link_type) = {
            let mut state = self.state.lock();
            let session_start = *state.session_start.get_or_insert(timestamp);
            state.pkt_count += 1;
            (state.pkt_count, session_start, state.link_type)
        };

        let frame = Frame::new(raw, timestamp, wire_length, link_type);
        self.retention.append(frame.clone());

        let mut summary: PacketSummary = decode::parse(&frame, index, session_start);
        self.stats.record(&summary.protocol, summary.length as i64);

        let tuple = decode::extract_flow_tuple(&frame);
        if tuple.valid {
            let src_ip = tuple.src_ip.expect("valid tuple carries src_ip");
            let dst_ip = tuple.dst_ip.expect("valid tuple carries dst_ip");
            let src_port = tuple.src_port.unwrap_or(0);
            let dst_port = tuple.dst_port.unwrap_or(0);

            let (flow_id, _) = self.flow.track(
                src_ip,
                dst_ip,
                src_port,
                dst_port,
                tuple.l4_protocol,
                wire_length as u64,
                tuple.tcp_flags,
                timestamp,
            );
            summary.flow_id = Some(flow_id);

            if tuple.l4_protocol == crate::decode::ipv4::protocol::TCP {
                let payload = decode::extract_tcp_payload(&frame).unwrap_or(&[]);
                let stream_id = self.stream.feed(
                    (src_ip, src_port),
                    (dst_ip, dst_port),
                    tuple.l4_protocol,
                    tuple.tcp_seq.unwrap_or(0),
                    payload,
                    tuple.tcp_flags,
                    timestamp,
                );
                summary.stream_id = Some(stream_id);
            }
        }

        self.observers.broadcast(Event::new(EventKind::Packet, &summary));
    }
}

/// §4.7 "1 s flow broadcaster": emits `flow_update` (skipped when empty) and
/// piggybacks the inactivity eviction sweep from §9/SPEC_FULL.md §4.3.
fn spawn_flow_broadcaster(engine: Arc<Engine>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.flow.evict_idle(Utc::now());
                    let flows = engine.flow.get_flows();
                    if !flows.is_empty() {
                        engine.observers.broadcast(Event::new(EventKind::FlowUpdate, &flows));
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// §4.7 "2 s stats broadcaster": emits `capture_stats`. `dropped_count` is a
/// sentinel zero (drops are not yet tracked, per §4.7).
fn spawn_stats_broadcaster(engine: Arc<Engine>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(2));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let payload = serde_json::json!({
                        "packet_count": engine.packet_count(),
                        "dropped_count": 0u64,
                        "protocol_stats": engine.protocol_stats(),
                    });
                    engine.observers.broadcast(Event::new(EventKind::CaptureStats, payload));
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
