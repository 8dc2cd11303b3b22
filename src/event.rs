use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::model::ProcedureId;

/// Tripped by the executor once replay has re-registered every recovered procedure.
pub const EXECUTOR_INITIALIZED: &str = "executor-initialized";
/// Tripped by the master once it accepts table and namespace work.
pub const MASTER_INITIALIZED: &str = "master-initialized";

#[derive(Debug, Default)]
struct EventInner {
    ready: bool,
    waiters: Vec<ProcedureId>,
}

/// Named condition procedures can suspend on without holding a worker.
///
/// Suspension and wake take the same lock, so a procedure either observes the event
/// ready or is handed back by the wake that sets it; it is never left parked.
#[derive(Debug)]
pub struct ProcedureEvent {
    name: String,
    inner: Mutex<EventInner>,
    ready_tx: watch::Sender<bool>,
    wake_tx: Option<mpsc::UnboundedSender<ProcedureId>>,
}

impl ProcedureEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_waker(name, None)
    }

    fn with_waker(
        name: impl Into<String>,
        wake_tx: Option<mpsc::UnboundedSender<ProcedureId>>,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            inner: Mutex::new(EventInner::default()),
            ready_tx,
            wake_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    /// Park `proc_id` unless the event is already ready. Returns whether it was parked.
    pub fn suspend_if_not_ready(&self, proc_id: ProcedureId) -> bool {
        let mut inner = self.inner.lock();
        if inner.ready {
            return false;
        }
        if !inner.waiters.contains(&proc_id) {
            inner.waiters.push(proc_id);
        }
        true
    }

    /// Mark the event ready and release every parked procedure.
    pub fn wake(&self) -> Vec<ProcedureId> {
        let woken = {
            let mut inner = self.inner.lock();
            inner.ready = true;
            std::mem::take(&mut inner.waiters)
        };
        self.ready_tx.send_replace(true);
        if let Some(tx) = &self.wake_tx {
            for proc_id in &woken {
                // the executor being gone just means nobody needs the wakeup
                let _ = tx.send(*proc_id);
            }
        }
        debug!(event = %self.name, woken = woken.len(), "event woken");
        woken
    }

    /// Re-arm a recurring condition. Parked procedures stay parked.
    pub fn clear(&self) {
        self.inner.lock().ready = false;
        self.ready_tx.send_replace(false);
    }

    pub fn remove_waiter(&self, proc_id: ProcedureId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.waiters.len();
        inner.waiters.retain(|id| *id != proc_id);
        inner.waiters.len() != before
    }

    pub fn waiters(&self) -> Vec<ProcedureId> {
        self.inner.lock().waiters.clone()
    }

    /// Wait until the event is ready. For callers outside the executor.
    pub async fn wait(&self) {
        let mut rx = self.ready_tx.subscribe();
        // the sender lives as long as self, so this only returns once ready
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Events by name. Events created here report woken procedures to the executor.
#[derive(Debug)]
pub struct EventRegistry {
    events: DashMap<String, Arc<ProcedureEvent>>,
    wake_tx: mpsc::UnboundedSender<ProcedureId>,
}

impl EventRegistry {
    pub fn new(wake_tx: mpsc::UnboundedSender<ProcedureId>) -> Self {
        Self {
            events: DashMap::new(),
            wake_tx,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<ProcedureEvent> {
        self.events
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ProcedureEvent::with_waker(name, Some(self.wake_tx.clone())))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcedureEvent>> {
        self.events.get(name).map(|e| e.clone())
    }

    /// Wake `name`, creating it if nobody has referenced it yet.
    pub fn wake(&self, name: &str) -> Vec<ProcedureId> {
        self.get_or_create(name).wake()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.events.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
