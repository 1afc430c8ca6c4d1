//! Observer registration and event payloads (§6).
//!
//! Observers are held by `Weak` reference (§9's design note on the cyclic
//! observer↔engine dependency: a transport layer may own both an observer
//! and a handle back into the engine, so the engine must never be the thing
//! keeping that observer alive). A dead weak reference is treated exactly
//! like an explicit `unregister`.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Recognized event kinds (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CaptureStarted,
    CaptureStopped,
    Packet,
    FlowUpdate,
    CaptureStats,
    StreamEvent,
}

/// `message = { type, payload }` from §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: impl Serialize) -> Self {
        Self { kind, payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null) }
    }
}

/// Registered by a transport layer to receive engine events. `send` must not
/// block the fast path for long — a slow observer should buffer internally.
pub trait Observer: Send + Sync {
    fn send(&self, event: Event);
}

/// One registered observer's delivery channel: a bounded queue drained by a
/// dedicated task, so a slow `send` backs up only that observer's queue
/// instead of blocking `broadcast` (the packet ingest hot path) or any other
/// observer.
struct Handle {
    weak: Weak<dyn Observer>,
    tx: mpsc::Sender<Event>,
}

/// Holds observers behind bounded per-observer queues (§4.7/§9: "an observer
/// queue depth" tunable bounds how far a slow subscriber can lag before its
/// events are dropped). A dead weak reference is pruned the same as an
/// explicit `unregister`.
pub struct ObserverRegistry {
    queue_depth: usize,
    handles: parking_lot::Mutex<Vec<Handle>>,
}

impl ObserverRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self { queue_depth: queue_depth.max(1), handles: parking_lot::Mutex::new(Vec::new()) }
    }

    /// Spawns the observer's delivery task, which runs until its queue is
    /// dropped (`unregister`) or its weak reference can no longer upgrade.
    pub fn register(&self, observer: &Arc<dyn Observer>) {
        let (tx, mut rx) = mpsc::channel(self.queue_depth);
        let weak = Arc::downgrade(observer);
        let delivery_weak = weak.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match delivery_weak.upgrade() {
                    Some(observer) => observer.send(event),
                    None => break,
                }
            }
        });
        self.handles.lock().push(Handle { weak, tx });
    }

    /// Drops the channel feeding `observer`'s delivery task, which ends the
    /// task once its queue drains.
    pub fn unregister(&self, observer: &Arc<dyn Observer>) {
        let target = Arc::as_ptr(observer);
        self.handles.lock().retain(|h| h.weak.upgrade().map(|o| Arc::as_ptr(&o) != target).unwrap_or(false));
    }

    /// Enqueues `event` for every observer still alive, pruning dead
    /// references as it goes. A full queue means that observer is lagging
    /// past `queue_depth`; the event is dropped for it and logged rather
    /// than blocking the caller (§5: this runs on the packet ingest path).
    pub fn broadcast(&self, event: Event) {
        let mut handles = self.handles.lock();
        handles.retain(|h| h.weak.strong_count() > 0);
        for handle in handles.iter() {
            if handle.tx.try_send(event.clone()).is_err() {
                warn!("observer queue full, dropping event");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().iter().all(|h| h.weak.upgrade().is_none())
    }
}
