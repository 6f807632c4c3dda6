//! Single emission point for workflow lifecycle events.
//!
//! `EventBridge::emit` is synchronous and never waits on a consumer: it
//! stamps the per-run sequence number, publishes to the broadcast bus, and
//! queues the event for the observer dispatcher. The dispatcher runs on the
//! blocking thread pool, so a slow or blocking observer never occupies an
//! async worker. It calls each observer in order and catches panics, so a
//! misbehaving observer is logged and otherwise ignored.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dagent_types::event::{WorkflowEvent, WorkflowEventKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::bus::EventBus;
use super::observer::{dispatch, WorkflowObserver};

struct Emitter {
    next_seq: u64,
    queue: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

struct BridgeInner {
    run_id: Uuid,
    bus: Option<EventBus>,
    // seq assignment and enqueue happen under one lock so observers see
    // events in seq order
    emitter: Mutex<Emitter>,
}

/// Cloneable handle used by the executor and its step tasks to emit events.
#[derive(Clone)]
pub struct EventBridge {
    inner: Arc<BridgeInner>,
}

impl EventBridge {
    /// Start a bridge for one run.
    ///
    /// Spawns the observer dispatcher when there is at least one observer,
    /// so this must be called from within a tokio runtime.
    pub fn start(
        run_id: Uuid,
        bus: Option<EventBus>,
        observers: Vec<Arc<dyn WorkflowObserver>>,
    ) -> (Self, ObserverDispatch) {
        let abandoned = Arc::new(AtomicBool::new(false));
        let (queue, handle) = if observers.is_empty() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            let flag = abandoned.clone();
            let handle = tokio::task::spawn_blocking(move || run_dispatcher(rx, observers, flag));
            (Some(tx), Some(handle))
        };

        let bridge = Self {
            inner: Arc::new(BridgeInner {
                run_id,
                bus,
                emitter: Mutex::new(Emitter { next_seq: 0, queue }),
            }),
        };
        let dispatch = ObserverDispatch {
            bridge: bridge.clone(),
            handle,
            abandoned,
        };
        (bridge, dispatch)
    }

    /// A bridge with no bus and no observers. Events are sequenced and dropped.
    pub fn detached(run_id: Uuid) -> Self {
        Self::start(run_id, None, Vec::new()).0
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// Emit one event; returns its sequence number.
    pub fn emit(&self, kind: WorkflowEventKind) -> u64 {
        let mut emitter = self
            .inner
            .emitter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let event = WorkflowEvent {
            run_id: self.inner.run_id,
            seq: emitter.next_seq,
            timestamp: Utc::now(),
            kind,
        };
        emitter.next_seq += 1;

        if let Some(bus) = &self.inner.bus {
            bus.publish(event.clone());
        }
        if let Some(queue) = &emitter.queue {
            let _ = queue.send(event.clone());
        }
        event.seq
    }

    /// Stop queueing for observers. Later events still reach the bus.
    fn close(&self) {
        let mut emitter = self
            .inner
            .emitter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        emitter.queue = None;
    }
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("run_id", &self.inner.run_id)
            .finish_non_exhaustive()
    }
}

/// Handle to the observer dispatcher of one bridge.
pub struct ObserverDispatch {
    bridge: EventBridge,
    handle: Option<JoinHandle<u64>>,
    /// Set when `finish` gives up; the dispatcher stops at the next check.
    abandoned: Arc<AtomicBool>,
}

impl ObserverDispatch {
    /// Close the observer queue and wait up to `timeout` for queued events
    /// to be delivered.
    ///
    /// Returns `true` when every queued event was delivered. On timeout the
    /// dispatcher is abandoned: the callback in progress runs to completion
    /// on its own thread and the remaining events are dropped.
    pub async fn finish(self, timeout: Duration) -> bool {
        self.bridge.close();
        let Some(handle) = self.handle else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(delivered)) => {
                tracing::debug!(run_id = %self.bridge.run_id(), delivered, "observer dispatch drained");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(run_id = %self.bridge.run_id(), error = %e, "observer dispatcher failed");
                false
            }
            Err(_) => {
                self.abandoned.store(true, Ordering::Release);
                tracing::warn!(
                    run_id = %self.bridge.run_id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "observers did not drain in time, dropping remaining events"
                );
                false
            }
        }
    }
}

fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    observers: Vec<Arc<dyn WorkflowObserver>>,
    abandoned: Arc<AtomicBool>,
) -> u64 {
    let mut delivered = 0;
    while let Some(event) = rx.blocking_recv() {
        for observer in &observers {
            if abandoned.load(Ordering::Acquire) {
                return delivered;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(observer.as_ref(), &event)));
            if outcome.is_err() {
                tracing::warn!(
                    run_id = %event.run_id,
                    seq = event.seq,
                    "workflow observer panicked, continuing"
                );
            }
        }
        delivered += 1;
    }
    delivered
}
