//! The procedure executor.
//!
//! Procedures live in an arena keyed by id. A worker checks a procedure out,
//! drives it by exactly one step (or one compensation), appends the resulting
//! state to the store and only then commits it back to the arena and decides
//! what wakes it next. Nothing a step did becomes visible to other procedures
//! before its record is durable.

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::env::ClusterEnv;
use crate::error::{ProcedureError, Result};
use crate::event::{EventRegistry, ProcedureEvent, EXECUTOR_INITIALIZED};
use crate::lock::{LockOutcome, LockedResourceSummary};
use crate::metrics::{ExecutorMetrics, MetricsSnapshot};
use crate::model::{
    ExpiryPolicy, FailureKind, NonceKey, Procedure, ProcedureFailure, ProcedureId, ProcedureState,
    ProcedureSummary, Wait,
};
use crate::nonce::NonceDeduplicator;
use crate::procedure::{ProcedureSpec, ProcedureType, StepContext, StepOutcome};
use crate::recovery::{self, RecoveryStats};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::store::ProcedureStore;
use crate::timer::{TimeoutTimer, TimerFired};

const COMPLETION_CHANNEL_CAPACITY: usize = 1024;

type Wakeups = (mpsc::UnboundedReceiver<TimerFired>, mpsc::UnboundedReceiver<ProcedureId>);

fn retry_deadline(delay: Duration) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Published once for every procedure that reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCompletion {
    pub proc_id: ProcedureId,
    pub proc_type: ProcedureType,
    pub parent_id: Option<ProcedureId>,
    pub state: ProcedureState,
    pub result: Option<String>,
    pub exception: Option<ProcedureFailure>,
    pub rollback_error: Option<ProcedureFailure>,
}

impl ProcedureCompletion {
    fn of(proc: &Procedure) -> Self {
        Self {
            proc_id: proc.id,
            proc_type: proc.proc_type(),
            parent_id: proc.parent_id,
            state: proc.state,
            result: proc.result.clone(),
            exception: proc.exception.clone(),
            rollback_error: proc.rollback_error.clone(),
        }
    }
}

/// What one housekeeping pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoreReport {
    pub nonces_evicted: usize,
    pub procedures_evicted: usize,
    pub records_compacted: usize,
}

#[derive(Debug)]
struct Slot {
    proc: Procedure,
    /// Checked out by a worker
    running: bool,
    /// Sitting in the ready queue
    queued: bool,
    /// A wakeup arrived while the procedure was running
    wake_pending: bool,
    abort_requested: bool,
    timer_fired: bool,
    completed_at: Option<Instant>,
}

impl Slot {
    fn new(proc: Procedure) -> Self {
        Self {
            proc,
            running: false,
            queued: false,
            wake_pending: false,
            abort_requested: false,
            timer_fired: false,
            completed_at: None,
        }
    }
}

#[derive(Debug)]
struct Arena {
    slots: HashMap<ProcedureId, Slot>,
    next_id: u64,
}

/// Flags consumed when a procedure is checked out
#[derive(Debug, Clone, Copy, Default)]
struct Pickup {
    abort_requested: bool,
    timer_fired: bool,
}

/// What happens to a procedure after its new state is durable.
#[derive(Debug)]
enum Disposition {
    /// Nothing changed; keep the arena copy
    Unchanged,
    Requeue,
    /// Parked until a lock, an event or its children wake it
    Park,
    ParkUntil(chrono::DateTime<Utc>),
    /// Parked on freshly spawned children
    Children(Vec<Procedure>),
    Finished,
}

struct ExecutorInner {
    config: ExecutorConfig,
    store: Arc<dyn ProcedureStore>,
    env: Arc<dyn ClusterEnv>,
    scheduler: Scheduler,
    events: Arc<EventRegistry>,
    nonces: NonceDeduplicator,
    arena: Mutex<Arena>,
    timer: TimeoutTimer,
    metrics: ExecutorMetrics,
    completions: Sender<ProcedureCompletion>,
    completions_keepalive: InactiveReceiver<ProcedureCompletion>,
    completed: Notify,
    /// Evicted since the last compaction
    evicted: Mutex<HashSet<ProcedureId>>,
    initialized: AtomicBool,
    halted: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs procedures on a fixed pool of workers.
pub struct ProcedureExecutor {
    inner: Arc<ExecutorInner>,
    wakeups: Mutex<Option<Wakeups>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcedureExecutor {
    pub fn new(
        config: ExecutorConfig,
        store: Arc<dyn ProcedureStore>,
        env: Arc<dyn ClusterEnv>,
    ) -> Result<Self> {
        config.validate()?;
        let (timer, timer_rx) = TimeoutTimer::new();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (mut completions, completions_rx) =
            async_broadcast::broadcast(COMPLETION_CHANNEL_CAPACITY);
        completions.set_overflow(true);
        completions.set_await_active(false);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = ExecutorInner {
            config,
            store,
            env,
            scheduler: Scheduler::new(),
            events: Arc::new(EventRegistry::new(wake_tx)),
            nonces: NonceDeduplicator::new(),
            arena: Mutex::new(Arena {
                slots: HashMap::new(),
                next_id: 1,
            }),
            timer,
            metrics: ExecutorMetrics::new(),
            completions,
            completions_keepalive: completions_rx.deactivate(),
            completed: Notify::new(),
            evicted: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            shutdown_tx,
        };
        Ok(Self {
            inner: Arc::new(inner),
            wakeups: Mutex::new(Some((timer_rx, wake_rx))),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Replay the store, start the workers and trip [`EXECUTOR_INITIALIZED`].
    pub async fn start(&self) -> Result<RecoveryStats> {
        let (timer_rx, wake_rx) = self
            .wakeups
            .lock()
            .take()
            .ok_or_else(|| ProcedureError::internal("executor already started"))?;

        let records = self.inner.store.read_all().await?;
        let max_issued = self.inner.store.max_procedure_id().await?;
        let stats = self.inner.recover(records, max_issued)?;

        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.inner.clone().run_workers(shutdown_rx.clone())));
        tasks.push(tokio::spawn(
            self.inner.clone().dispatch_wakeups(timer_rx, wake_rx, shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(self.inner.clone().run_chores(shutdown_rx)));
        drop(tasks);

        self.inner.initialized.store(true, Ordering::Release);
        self.inner.events.wake(EXECUTOR_INITIALIZED);
        info!(
            procedures = stats.procedures,
            resumed = stats.resumed,
            workers = self.inner.config.max_workers,
            "procedure executor started"
        );
        Ok(stats)
    }

    /// Stop picking up work, wait for running steps and flush the store.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "executor task ended abnormally");
            }
        }
        self.inner.completed.notify_waiters();
        if !self.inner.halted.load(Ordering::Acquire) {
            self.inner.store.flush().await?;
        }
        info!("procedure executor stopped");
        Ok(())
    }

    pub async fn submit(
        &self,
        spec: ProcedureSpec,
        nonce_key: Option<NonceKey>,
    ) -> Result<ProcedureId> {
        self.submit_with(nonce_key, move || async move { Ok(spec) }).await
    }

    /// Submit the procedure `build` returns, unless `nonce_key` already maps to one.
    ///
    /// `build` runs only for unseen keys; an error from it (an invalid request)
    /// persists nothing and records no mapping.
    pub async fn submit_with<F, Fut>(
        &self,
        nonce_key: Option<NonceKey>,
        build: F,
    ) -> Result<ProcedureId>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProcedureSpec>>,
    {
        self.inner.ensure_accepting()?;
        let inner = &self.inner;
        let mut built = false;
        let outcome = inner
            .nonces
            .submit(nonce_key, || {
                built = true;
                async move {
                    let spec = build().await?;
                    inner.register(spec, nonce_key).await
                }
            })
            .await;

        match &outcome {
            Ok(proc_id) if !built => {
                inner.metrics.record_deduplicated();
                debug!(proc_id = %proc_id, "nonce hit");
            }
            Err(e) if e.is_invalid_request() => {
                inner.metrics.record_rejected();
                debug!(error = %e, "rejected invalid request");
            }
            _ => {}
        }
        outcome
    }

    /// Abort a procedure.
    ///
    /// Without `may_interrupt` this only succeeds while no step has run and the
    /// procedure is not running. With it, the procedure is failed at the next step
    /// boundary, provided the step it would run next is still abortable.
    ///
    /// For a running procedure `true` means the abort was requested, not that it
    /// took effect: if the running step leads into an irreversible one, the request
    /// is dropped and the procedure runs to completion.
    pub async fn abort(&self, proc_id: ProcedureId, may_interrupt: bool) -> Result<bool> {
        self.inner.abort(proc_id, may_interrupt).await
    }

    pub fn get(&self, proc_id: ProcedureId) -> Option<ProcedureSummary> {
        self.inner.arena.lock().slots.get(&proc_id).map(|s| s.proc.summary())
    }

    /// Every procedure in the arena, by id.
    pub fn list(&self) -> Vec<ProcedureSummary> {
        let arena = self.inner.arena.lock();
        let mut summaries: Vec<ProcedureSummary> =
            arena.slots.values().map(|s| s.proc.summary()).collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    pub fn locks(&self) -> Vec<LockedResourceSummary> {
        self.inner.scheduler.snapshot()
    }

    pub async fn wait_for_completion(&self, proc_id: ProcedureId) -> Result<ProcedureSummary> {
        loop {
            let notified = self.inner.completed.notified();
            if let Some(summary) = self.finished_summary(proc_id)? {
                return Ok(summary);
            }
            if self.inner.halted.load(Ordering::Acquire) || *self.inner.shutdown_tx.borrow() {
                return Err(ProcedureError::ExecutorStopped);
            }
            notified.await;
        }
    }

    pub async fn wait_for_completion_timeout(
        &self,
        proc_id: ProcedureId,
        timeout: Duration,
    ) -> Result<ProcedureSummary> {
        tokio::time::timeout(timeout, self.wait_for_completion(proc_id))
            .await
            .map_err(|_| ProcedureError::WaitTimeout { proc_id, timeout })?
    }

    fn finished_summary(&self, proc_id: ProcedureId) -> Result<Option<ProcedureSummary>> {
        let arena = self.inner.arena.lock();
        let slot = arena
            .slots
            .get(&proc_id)
            .ok_or(ProcedureError::ProcedureNotFound { proc_id })?;
        Ok(slot.proc.is_finished().then(|| slot.proc.summary()))
    }

    /// Stream of completion notices from now on.
    pub fn subscribe(&self) -> Receiver<ProcedureCompletion> {
        self.inner.completions_keepalive.activate_cloned()
    }

    pub fn events(&self) -> Arc<EventRegistry> {
        self.inner.events.clone()
    }

    pub fn event(&self, name: &str) -> Arc<ProcedureEvent> {
        self.inner.events.get_or_create(name)
    }

    /// Whether replay finished and new submissions are accepted
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Whether a store failure stopped the executor
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Run one housekeeping pass now instead of waiting for the chore interval.
    pub async fn run_chores_now(&self) -> Result<ChoreReport> {
        self.inner.chore().await
    }

    /// Drop superseded records and records of evicted procedures from the store.
    pub async fn compact_store(&self) -> Result<usize> {
        self.inner.compact_store().await
    }

    #[cfg(test)]
    pub(crate) fn procedure(&self, proc_id: ProcedureId) -> Option<Procedure> {
        self.inner.arena.lock().slots.get(&proc_id).map(|s| s.proc.clone())
    }
}

impl ExecutorInner {
    fn ensure_accepting(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) || *self.shutdown_tx.borrow() {
            return Err(ProcedureError::ExecutorStopped);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ProcedureError::NotInitialized);
        }
        Ok(())
    }

    async fn register(
        &self,
        spec: ProcedureSpec,
        nonce_key: Option<NonceKey>,
    ) -> Result<ProcedureId> {
        let proc = {
            let mut arena = self.arena.lock();
            let active = arena.slots.values().filter(|s| !s.proc.is_finished()).count();
            if active >= self.config.queue_capacity {
                return Err(ProcedureError::QueueFull {
                    capacity: self.config.queue_capacity,
                });
            }
            let proc_id = ProcedureId(arena.next_id);
            arena.next_id += 1;
            Procedure::new(proc_id, spec, None, nonce_key)
        };
        let proc_id = proc.id;
        let proc_type = proc.proc_type();

        self.persist(&proc).await?;
        self.arena.lock().slots.insert(proc_id, Slot::new(proc));
        self.metrics.record_submitted();
        info!(proc_id = %proc_id, proc_type = %proc_type, "submitted procedure");
        self.enqueue(proc_id);
        Ok(proc_id)
    }

    async fn persist(&self, proc: &Procedure) -> Result<()> {
        let record = proc.encode()?;
        if let Err(e) = self.store.append(proc.id, record).await {
            self.halt(&e);
            return Err(e);
        }
        Ok(())
    }

    async fn persist_batch(&self, procs: &[&Procedure]) -> Result<()> {
        let mut records = Vec::with_capacity(procs.len());
        for proc in procs {
            records.push((proc.id, proc.encode()?));
        }
        if let Err(e) = self.store.append_batch(records).await {
            self.halt(&e);
            return Err(e);
        }
        Ok(())
    }

    /// The store can no longer be trusted; stop before anything runs ahead of it.
    fn halt(&self, cause: &ProcedureError) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            error!(error = %cause, "procedure store failed, halting executor");
            self.shutdown_tx.send_replace(true);
            self.completed.notify_waiters();
        }
    }

    /// Put a procedure on the ready queue unless it is already there.
    fn enqueue(&self, proc_id: ProcedureId) {
        let urgent = {
            let mut arena = self.arena.lock();
            let Some(slot) = arena.slots.get_mut(&proc_id) else {
                return;
            };
            if slot.queued || slot.proc.is_finished() {
                return;
            }
            slot.queued = true;
            slot.proc.parent_id.is_some()
        };
        self.scheduler.enqueue(proc_id, urgent);
    }

    fn checkout(&self, proc_id: ProcedureId) -> Option<(Procedure, Pickup)> {
        let mut arena = self.arena.lock();
        let slot = arena.slots.get_mut(&proc_id)?;
        slot.queued = false;
        if slot.running {
            slot.wake_pending = true;
            return None;
        }
        if slot.proc.is_finished() {
            return None;
        }
        slot.running = true;
        let pickup = Pickup {
            abort_requested: std::mem::take(&mut slot.abort_requested),
            timer_fired: std::mem::take(&mut slot.timer_fired),
        };
        Some((slot.proc.clone(), pickup))
    }

    fn ancestry(&self, proc: &Procedure) -> Vec<ProcedureId> {
        let arena = self.arena.lock();
        let mut chain = vec![proc.id];
        let mut current = proc.parent_id;
        while let Some(parent) = current {
            chain.push(parent);
            current = arena.slots.get(&parent).and_then(|s| s.proc.parent_id);
        }
        chain
    }

    // -----------------------------------------------------------------------
    // Worker pool

    async fn run_workers(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = loop {
                if let Some(proc_id) = self.scheduler.pop() {
                    break Some(proc_id);
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break None,
                    _ = self.scheduler.notified() => {}
                }
            };
            let Some(proc_id) = next else {
                break;
            };

            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_one(proc_id).await;
                drop(permit);
            });
        }

        // let in-flight steps finish before reporting the pool stopped
        let workers = u32::try_from(self.config.max_workers).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(workers).await;
        debug!("procedure workers stopped");
    }

    async fn run_one(self: Arc<Self>, proc_id: ProcedureId) {
        if self.halted.load(Ordering::Acquire) {
            return;
        }
        let Some((mut proc, pickup)) = self.checkout(proc_id) else {
            return;
        };
        match self.drive(&mut proc, pickup).await {
            Ok(disposition) => self.commit(proc, disposition).await,
            Err(e) => {
                // only store failures get here, and they halted the executor
                error!(proc_id = %proc_id, error = %e, "procedure step could not be recorded");
                if let Some(slot) = self.arena.lock().slots.get_mut(&proc_id) {
                    slot.running = false;
                }
            }
        }
    }

    async fn dispatch_wakeups(
        self: Arc<Self>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
        mut wakes: mpsc::UnboundedReceiver<ProcedureId>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                Some(fired) = timers.recv() => self.on_timer(fired),
                Some(proc_id) = wakes.recv() => {
                    debug!(proc_id = %proc_id, "woken by event");
                    self.enqueue(proc_id);
                }
                else => break,
            }
        }
    }

    fn on_timer(&self, fired: TimerFired) {
        {
            let mut arena = self.arena.lock();
            let Some(slot) = arena.slots.get_mut(&fired.proc_id) else {
                return;
            };
            let waiting = matches!(slot.proc.wait, Some(Wait::Timeout { .. }));
            if slot.proc.wait_token != fired.token || !waiting {
                debug!(proc_id = %fired.proc_id, token = fired.token, "ignoring stale timer");
                return;
            }
            slot.timer_fired = true;
        }
        self.enqueue(fired.proc_id);
    }

    async fn run_chores(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.cleaner_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.chore().await {
                        warn!(error = %e, "procedure housekeeping failed");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Driving one procedure

    async fn drive(&self, proc: &mut Procedure, pickup: Pickup) -> Result<Disposition> {
        if pickup.abort_requested && self.can_interrupt(proc) {
            return self.abort_now(proc).await;
        }

        match (proc.state, proc.wait.clone()) {
            (ProcedureState::Failed, Some(Wait::Timeout { .. })) if !pickup.timer_fired => {
                Ok(Disposition::Unchanged)
            }
            (ProcedureState::Failed, _) => self.rollback_step(proc).await,
            (ProcedureState::Initializing, _) | (ProcedureState::Waiting, Some(Wait::Lock)) => {
                self.acquire_locks(proc).await
            }
            (ProcedureState::Waiting, Some(Wait::Event(_))) => {
                proc.wait = None;
                proc.transition(ProcedureState::Runnable);
                self.execute_step(proc).await
            }
            (ProcedureState::Waiting, Some(Wait::Children)) => {
                if proc.remaining_children > 0 {
                    return Ok(Disposition::Unchanged);
                }
                proc.wait = None;
                if let Some(failure) = proc.child_failure.take() {
                    warn!(
                        proc_id = %proc.id,
                        cause = %failure,
                        "child procedure failed, rolling back"
                    );
                    proc.fail(failure);
                    self.persist(proc).await?;
                    return Ok(Disposition::Requeue);
                }
                proc.transition(ProcedureState::Runnable);
                self.execute_step(proc).await
            }
            (ProcedureState::WaitingTimeout, Some(Wait::Timeout { on_expiry, .. })) => {
                if !pickup.timer_fired {
                    return Ok(Disposition::Unchanged);
                }
                proc.wait = None;
                match on_expiry {
                    ExpiryPolicy::Resume | ExpiryPolicy::Retry => {
                        proc.timed_out = on_expiry == ExpiryPolicy::Resume;
                        proc.transition(ProcedureState::Runnable);
                        self.execute_step(proc).await
                    }
                    ExpiryPolicy::Fail => {
                        let step = proc.spec.step_name(proc.step_index);
                        warn!(proc_id = %proc.id, step = ?step, "deadline passed");
                        let failure =
                            ProcedureFailure::new(FailureKind::TimedOut, step, "deadline passed");
                        proc.fail(failure);
                        self.persist(proc).await?;
                        Ok(Disposition::Requeue)
                    }
                }
            }
            (ProcedureState::Runnable, _) => self.execute_step(proc).await,
            (state, wait) => {
                warn!(proc_id = %proc.id, ?state, ?wait, "picked up procedure in unexpected state");
                Ok(Disposition::Unchanged)
            }
        }
    }

    async fn acquire_locks(&self, proc: &mut Procedure) -> Result<Disposition> {
        let ancestry = self.ancestry(proc);
        match self.scheduler.try_acquire(&ancestry, &proc.locks) {
            LockOutcome::Granted => {
                proc.holds_locks = true;
                proc.wait = None;
                if proc.state != ProcedureState::Runnable {
                    proc.transition(ProcedureState::Runnable);
                }
                // locks are on record before the first step has any effect
                self.persist(proc).await?;
                self.execute_step(proc).await
            }
            LockOutcome::Blocked(resource) => {
                debug!(proc_id = %proc.id, resource = %resource, "waiting for lock");
                self.metrics.record_lock_wait();
                if proc.state == ProcedureState::Initializing {
                    proc.transition(ProcedureState::Waiting);
                }
                proc.wait = Some(Wait::Lock);
                Ok(Disposition::Park)
            }
        }
    }

    fn step_context(&self, proc: &Procedure, step: &'static str) -> StepContext {
        StepContext {
            proc_id: proc.id,
            step,
            env: self.env.clone(),
            events: self.events.clone(),
            attempt: proc.retry_count,
            timed_out: proc.timed_out,
        }
    }

    async fn execute_step(&self, proc: &mut Procedure) -> Result<Disposition> {
        let index = proc.step_index;
        let step_count = proc.spec.step_count();
        let Some(step) = proc.spec.step_name(index) else {
            proc.transition(ProcedureState::Success);
            return self.finalize(proc).await;
        };

        let ctx = self.step_context(proc, step);
        proc.timed_out = false;
        debug!(proc_id = %proc.id, step, index, attempt = proc.retry_count, "executing step");
        let started = Instant::now();
        let outcome = proc.spec.execute(index, &ctx).await;
        self.metrics.record_step(started.elapsed());

        match outcome {
            Ok(StepOutcome::Continue) => {
                proc.step_index += 1;
                proc.retry_count = 0;
                if proc.step_index >= step_count {
                    proc.transition(ProcedureState::Success);
                    return self.finalize(proc).await;
                }
                proc.transition(ProcedureState::Runnable);
                self.persist(proc).await?;
                Ok(Disposition::Requeue)
            }
            Ok(StepOutcome::Finish(result)) => {
                proc.step_index += 1;
                proc.retry_count = 0;
                proc.result = result;
                proc.transition(ProcedureState::Success);
                self.finalize(proc).await
            }
            Ok(StepOutcome::SpawnChildren(specs)) => {
                proc.step_index += 1;
                proc.retry_count = 0;
                if specs.is_empty() {
                    proc.transition(ProcedureState::Runnable);
                    self.persist(proc).await?;
                    return Ok(Disposition::Requeue);
                }
                let children = self.allocate_children(proc, specs);
                proc.children.extend(children.iter().map(|c| c.id));
                proc.remaining_children = children.len();
                proc.child_failure = None;
                proc.wait = Some(Wait::Children);
                proc.transition(ProcedureState::Waiting);

                // parent and children become durable together
                let mut batch: Vec<&Procedure> = vec![&*proc];
                batch.extend(children.iter());
                self.persist_batch(&batch).await?;
                debug!(proc_id = %proc.id, children = children.len(), "spawned child procedures");
                Ok(Disposition::Children(children))
            }
            Ok(StepOutcome::Suspend(Wait::Event(name))) => {
                proc.wait = Some(Wait::Event(name.clone()));
                proc.transition(ProcedureState::Waiting);
                self.persist(proc).await?;
                let event = self.events.get_or_create(&name);
                if event.suspend_if_not_ready(proc.id) {
                    debug!(proc_id = %proc.id, event = %name, "suspended on event");
                    Ok(Disposition::Park)
                } else {
                    Ok(Disposition::Requeue)
                }
            }
            Ok(StepOutcome::Suspend(Wait::Timeout { deadline, on_expiry })) => {
                proc.wait_token += 1;
                proc.wait = Some(Wait::Timeout { deadline, on_expiry });
                proc.transition(ProcedureState::WaitingTimeout);
                self.persist(proc).await?;
                Ok(Disposition::ParkUntil(deadline))
            }
            Ok(StepOutcome::Suspend(wait)) => {
                let message = format!("steps cannot suspend on {:?}", wait);
                let failure = ProcedureFailure::step_failed(step, message);
                self.fail(proc, failure).await
            }
            Ok(StepOutcome::Fail(failure)) => self.fail(proc, failure).await,
            Err(e) if e.is_transient() && proc.retry_count < self.config.max_step_retries => {
                proc.retry_count += 1;
                self.metrics.record_retry();
                let delay = self.config.retry_backoff(proc.retry_count);
                warn!(
                    proc_id = %proc.id,
                    step,
                    attempt = proc.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient step failure, retrying"
                );
                let deadline = retry_deadline(delay);
                proc.wait_token += 1;
                proc.wait = Some(Wait::Timeout {
                    deadline,
                    on_expiry: ExpiryPolicy::Retry,
                });
                proc.transition(ProcedureState::WaitingTimeout);
                self.persist(proc).await?;
                Ok(Disposition::ParkUntil(deadline))
            }
            Err(e) if e.is_transient() => {
                let failure = ProcedureFailure::new(
                    FailureKind::RetriesExhausted,
                    Some(step),
                    format!("gave up after {} retries: {}", proc.retry_count, e),
                );
                self.fail(proc, failure).await
            }
            Err(e) => self.fail(proc, ProcedureFailure::step_failed(step, e.to_string())).await,
        }
    }

    fn allocate_children(&self, parent: &Procedure, specs: Vec<ProcedureSpec>) -> Vec<Procedure> {
        let mut arena = self.arena.lock();
        specs
            .into_iter()
            .map(|spec| {
                let proc_id = ProcedureId(arena.next_id);
                arena.next_id += 1;
                Procedure::new(proc_id, spec, Some(parent.id), None)
            })
            .collect()
    }

    async fn fail(&self, proc: &mut Procedure, failure: ProcedureFailure) -> Result<Disposition> {
        warn!(proc_id = %proc.id, cause = %failure, "procedure failed, rolling back");
        proc.fail(failure);
        self.persist(proc).await?;
        Ok(Disposition::Requeue)
    }

    /// Run the compensation of the last completed step still to undo.
    async fn rollback_step(&self, proc: &mut Procedure) -> Result<Disposition> {
        proc.wait = None;
        let mut remaining = proc.rollback_index.unwrap_or(0);
        // steps without a compensation are passed over in one go
        while remaining > 0 && !proc.spec.has_rollback(remaining - 1) {
            remaining -= 1;
        }
        if remaining == 0 {
            proc.rollback_index = Some(0);
            proc.transition(ProcedureState::RolledBack);
            return self.finalize(proc).await;
        }

        let index = remaining - 1;
        let step = proc.spec.step_name(index).unwrap_or("unknown");
        let ctx = self.step_context(proc, step);
        debug!(proc_id = %proc.id, step, index, "rolling back step");
        match proc.spec.rollback(index, &ctx).await {
            Ok(()) => {
                self.metrics.record_rollback_step();
                proc.rollback_index = Some(index);
                proc.retry_count = 0;
                if index == 0 {
                    proc.transition(ProcedureState::RolledBack);
                    return self.finalize(proc).await;
                }
                proc.transition(ProcedureState::Failed);
                self.persist(proc).await?;
                Ok(Disposition::Requeue)
            }
            Err(e) if e.is_transient() && proc.retry_count < self.config.max_step_retries => {
                proc.retry_count += 1;
                proc.rollback_index = Some(remaining);
                self.metrics.record_retry();
                let delay = self.config.retry_backoff(proc.retry_count);
                warn!(
                    proc_id = %proc.id,
                    step,
                    attempt = proc.retry_count,
                    error = %e,
                    "transient rollback failure, retrying"
                );
                let deadline = retry_deadline(delay);
                proc.wait_token += 1;
                proc.wait = Some(Wait::Timeout {
                    deadline,
                    on_expiry: ExpiryPolicy::Retry,
                });
                proc.transition(ProcedureState::Failed);
                self.persist(proc).await?;
                Ok(Disposition::ParkUntil(deadline))
            }
            Err(e) => {
                let failure =
                    ProcedureFailure::new(FailureKind::RollbackFailed, Some(step), e.to_string());
                error!(
                    proc_id = %proc.id,
                    proc_type = %proc.proc_type(),
                    step,
                    error = %e,
                    "rollback failed, procedure needs operator intervention"
                );
                proc.rollback_index = Some(remaining);
                proc.rollback_error = Some(failure);
                proc.transition(ProcedureState::Failed);
                self.finalize(proc).await
            }
        }
    }

    /// Record a terminal state. Locks are released once the record is durable.
    async fn finalize(&self, proc: &mut Procedure) -> Result<Disposition> {
        proc.holds_locks = false;
        proc.wait = None;
        self.persist(proc).await?;
        Ok(Disposition::Finished)
    }

    // -----------------------------------------------------------------------
    // Committing

    async fn commit(&self, proc: Procedure, disposition: Disposition) {
        let proc_id = proc.id;
        let finished = proc.is_finished();
        let wait_token = proc.wait_token;
        let completion = finished.then(|| proc.clone());

        let requeue = {
            let mut arena = self.arena.lock();
            if let Disposition::Children(children) = &disposition {
                for child in children {
                    arena.slots.insert(child.id, Slot::new(child.clone()));
                }
            }
            let Some(slot) = arena.slots.get_mut(&proc_id) else {
                return;
            };
            if !matches!(disposition, Disposition::Unchanged) {
                slot.proc = proc;
            }
            slot.running = false;
            if finished {
                slot.completed_at = Some(Instant::now());
            }
            let woken = std::mem::take(&mut slot.wake_pending) || slot.abort_requested;
            matches!(disposition, Disposition::Requeue) || (woken && !finished)
        };

        match disposition {
            Disposition::Children(children) => {
                for child in &children {
                    self.enqueue(child.id);
                }
            }
            Disposition::ParkUntil(deadline) => self.timer.schedule(proc_id, wait_token, deadline),
            _ => {}
        }
        if requeue {
            self.enqueue(proc_id);
        }
        if let Some(done) = completion {
            self.on_finished(&done);
        }
    }

    fn on_finished(&self, proc: &Procedure) {
        for waiter in self.scheduler.release(proc.id) {
            self.enqueue(waiter);
        }

        match (proc.state, &proc.rollback_error) {
            (ProcedureState::Success, _) => {
                self.metrics.record_succeeded();
                info!(
                    proc_id = %proc.id,
                    proc_type = %proc.proc_type(),
                    result = ?proc.result,
                    "procedure succeeded"
                );
            }
            (ProcedureState::RolledBack, _) => {
                self.metrics.record_rolled_back();
                info!(
                    proc_id = %proc.id,
                    proc_type = %proc.proc_type(),
                    cause = ?proc.exception,
                    "procedure rolled back"
                );
            }
            (_, Some(_)) => self.metrics.record_failed_permanently(),
            _ => {}
        }

        if let Some(parent_id) = proc.parent_id {
            let parent_ready = {
                let mut arena = self.arena.lock();
                match arena.slots.get_mut(&parent_id) {
                    Some(parent) => {
                        parent.proc.remaining_children =
                            parent.proc.remaining_children.saturating_sub(1);
                        if !proc.is_success() && parent.proc.child_failure.is_none() {
                            parent.proc.child_failure = Some(recovery::child_failure(proc.id));
                        }
                        parent.proc.remaining_children == 0
                    }
                    None => false,
                }
            };
            if parent_ready {
                self.enqueue(parent_id);
            }
        }

        let _ = self.completions.try_broadcast(ProcedureCompletion::of(proc));
        self.completed.notify_waiters();
    }

    // -----------------------------------------------------------------------
    // Abort

    fn can_interrupt(&self, proc: &Procedure) -> bool {
        !proc.is_finished()
            && !proc.is_rolling_back()
            && proc.wait != Some(Wait::Children)
            && proc.spec.is_abortable(proc.step_index)
    }

    async fn abort_now(&self, proc: &mut Procedure) -> Result<Disposition> {
        self.cancel_waits(proc);
        proc.wait_token += 1;
        let step = proc.spec.step_name(proc.step_index);
        proc.fail(ProcedureFailure::new(FailureKind::Aborted, step, "aborted by request"));
        self.metrics.record_aborted();
        info!(proc_id = %proc.id, step = ?step, "procedure aborted");
        self.persist(proc).await?;
        Ok(Disposition::Requeue)
    }

    fn cancel_waits(&self, proc: &Procedure) {
        match &proc.wait {
            Some(Wait::Lock) => {
                self.scheduler.cancel_lock_wait(proc.id);
            }
            Some(Wait::Event(name)) => {
                if let Some(event) = self.events.get(name) {
                    event.remove_waiter(proc.id);
                }
            }
            _ => {}
        }
    }

    async fn abort(&self, proc_id: ProcedureId, may_interrupt: bool) -> Result<bool> {
        let mut proc = {
            let mut arena = self.arena.lock();
            let slot = arena
                .slots
                .get_mut(&proc_id)
                .ok_or(ProcedureError::ProcedureNotFound { proc_id })?;
            let proc = &slot.proc;
            // children are aborted through their root
            if proc.parent_id.is_some() || !self.can_interrupt(proc) {
                return Ok(false);
            }
            if !may_interrupt && (slot.running || proc.step_index > 0) {
                return Ok(false);
            }
            if slot.running {
                slot.abort_requested = true;
                debug!(proc_id = %proc_id, "abort requested, applies at the next step boundary");
                return Ok(true);
            }
            // reserve the slot while the abort is recorded
            slot.running = true;
            slot.timer_fired = false;
            slot.proc.clone()
        };

        match self.abort_now(&mut proc).await {
            Ok(disposition) => {
                self.commit(proc, disposition).await;
                Ok(true)
            }
            Err(e) => {
                if let Some(slot) = self.arena.lock().slots.get_mut(&proc_id) {
                    slot.running = false;
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recovery

    fn recover(
        &self,
        records: Vec<crate::store::StoreRecord>,
        max_issued: Option<ProcedureId>,
    ) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats {
            records: records.len(),
            ..RecoveryStats::default()
        };
        let mut procedures = recovery::replay(records)?;
        recovery::link_children(&mut procedures);
        stats.procedures = procedures.len();

        let mut ready = Vec::new();
        let mut event_waits = Vec::new();
        let mut timers = Vec::new();

        // ascending ids: parents reinstall their locks before their children
        for (proc_id, proc) in &procedures {
            if let Some(key) = proc.nonce_key {
                self.nonces.register_existing(key, *proc_id);
            }
            if proc.is_finished() {
                stats.finished += 1;
                continue;
            }
            if proc.holds_locks {
                let ancestry = recovery::ancestry_in(&procedures, *proc_id);
                self.scheduler.restore_locks(*proc_id, &ancestry, &proc.locks);
                stats.locks_restored += 1;
            }
            if proc.is_rolling_back() {
                stats.rolling_back += 1;
            }
            match &proc.wait {
                Some(Wait::Event(name)) => event_waits.push((*proc_id, name.clone())),
                Some(Wait::Timeout { deadline, .. }) => {
                    timers.push((*proc_id, proc.wait_token, *deadline))
                }
                Some(Wait::Children) if proc.remaining_children > 0 => {}
                _ => ready.push(*proc_id),
            }
        }

        {
            let mut arena = self.arena.lock();
            // evicted ids are gone from the records but must never be handed out again
            let max_id = procedures
                .keys()
                .next_back()
                .copied()
                .max(max_issued)
                .map_or(0, |id| id.0);
            arena.next_id = arena.next_id.max(max_id + 1);
            stats.next_id = arena.next_id;
            let now = Instant::now();
            for (proc_id, proc) in procedures {
                let mut slot = Slot::new(proc);
                if slot.proc.is_finished() {
                    slot.completed_at = Some(now);
                }
                arena.slots.insert(proc_id, slot);
            }
        }

        stats.event_waiters = event_waits.len();
        for (proc_id, name) in event_waits {
            if !self.events.get_or_create(&name).suspend_if_not_ready(proc_id) {
                ready.push(proc_id);
            }
        }
        stats.timers = timers.len();
        for (proc_id, token, deadline) in timers {
            self.timer.schedule(proc_id, token, deadline);
        }
        stats.resumed = ready.len();
        for proc_id in ready {
            self.enqueue(proc_id);
        }

        info!(
            records = stats.records,
            procedures = stats.procedures,
            finished = stats.finished,
            resumed = stats.resumed,
            locks_restored = stats.locks_restored,
            "recovered procedures"
        );
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Housekeeping

    async fn chore(&self) -> Result<ChoreReport> {
        let nonces_evicted = self.nonces.evict_expired(self.config.nonce_ttl);
        let procedures_evicted = self.evict_completed(self.config.completed_procedure_ttl);
        let records_compacted = if procedures_evicted > 0 {
            self.compact_store().await?
        } else {
            0
        };
        if nonces_evicted + procedures_evicted > 0 {
            debug!(nonces_evicted, procedures_evicted, records_compacted, "housekeeping pass");
        }
        Ok(ChoreReport {
            nonces_evicted,
            procedures_evicted,
            records_compacted,
        })
    }

    /// Remove finished trees older than `ttl`. Trees with a failed rollback stay.
    fn evict_completed(&self, ttl: Duration) -> usize {
        let mut arena = self.arena.lock();
        let expired_roots: Vec<ProcedureId> = arena
            .slots
            .values()
            .filter(|s| s.proc.parent_id.is_none())
            .filter(|s| s.completed_at.map_or(false, |at| at.elapsed() >= ttl))
            .map(|s| s.proc.id)
            .collect();

        let mut evicted = Vec::new();
        for root in expired_roots {
            let mut tree = vec![root];
            let mut cursor = 0;
            let mut evictable = true;
            while cursor < tree.len() {
                match arena.slots.get(&tree[cursor]) {
                    Some(slot) if slot.proc.is_finished() && slot.proc.rollback_error.is_none() => {
                        tree.extend(slot.proc.children.iter().copied());
                    }
                    Some(_) => {
                        evictable = false;
                        break;
                    }
                    None => {}
                }
                cursor += 1;
            }
            if evictable {
                evicted.extend(tree);
            }
        }
        for proc_id in &evicted {
            arena.slots.remove(proc_id);
        }
        drop(arena);

        if !evicted.is_empty() {
            self.metrics.record_evicted(evicted.len());
            debug!(count = evicted.len(), "evicted finished procedures");
            self.evicted.lock().extend(evicted.iter().copied());
        }
        evicted.len()
    }

    async fn compact_store(&self) -> Result<usize> {
        let evicted: HashSet<ProcedureId> = std::mem::take(&mut *self.evicted.lock());
        match self.store.compact(&|proc_id| !evicted.contains(&proc_id)).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                self.evicted.lock().extend(evicted);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfigBuilder;
    use crate::env::MemoryCluster;
    use crate::procedure::probe::{Probe, ProbeAction};
    use crate::store::MemoryProcedureStore;
    use pretty_assertions::assert_eq;

    fn test_config() -> ExecutorConfig {
        ExecutorConfigBuilder::from_config(ExecutorConfig::development())
            .retry_delays(Duration::from_millis(5), Duration::from_millis(20))
            .max_step_retries(2)
            .build()
            .unwrap()
    }

    async fn started(store: &MemoryProcedureStore) -> ProcedureExecutor {
        crate::logging::try_init_for_tests();
        let executor = ProcedureExecutor::new(
            test_config(),
            Arc::new(store.clone()),
            Arc::new(MemoryCluster::new()),
        )
        .unwrap();
        executor.start().await.unwrap();
        executor
    }

    async fn run(executor: &ProcedureExecutor, probe: Probe) -> (ProcedureSummary, Vec<String>) {
        let proc_id = executor.submit(probe.spec(), None).await.unwrap();
        let summary = executor
            .wait_for_completion_timeout(proc_id, Duration::from_secs(5))
            .await
            .unwrap();
        let trace = match executor.procedure(proc_id).unwrap().spec {
            ProcedureSpec::Probe(p) => p.trace,
            _ => unreachable!(),
        };
        (summary, trace)
    }

    #[tokio::test]
    async fn test_runs_all_steps_in_order() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let (summary, trace) = run(&executor, Probe::passing()).await;

        assert_eq!(summary.state, ProcedureState::Success);
        assert_eq!(summary.result.as_deref(), Some("exec:0,exec:1,exec:2"));
        assert_eq!(trace, vec!["exec:0", "exec:1", "exec:2"]);
        // submission, lock grant, two continued steps, success
        assert_eq!(store.record_ids(), vec![ProcedureId(1); 5]);
    }

    #[tokio::test]
    async fn test_failure_compensates_completed_steps_in_reverse() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let probe = Probe::new([ProbeAction::Continue, ProbeAction::Continue, ProbeAction::Fail]);
        let (summary, trace) = run(&executor, probe).await;

        assert_eq!(summary.state, ProcedureState::RolledBack);
        assert_eq!(summary.exception.map(|e| e.kind), Some(FailureKind::StepFailed));
        assert_eq!(trace, vec!["exec:0", "exec:1", "exec:2", "undo:1", "undo:0"]);
    }

    #[tokio::test]
    async fn test_failure_in_first_step_rolls_back_nothing() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let probe = Probe::new([ProbeAction::Fatal, ProbeAction::Continue, ProbeAction::Continue]);
        let (summary, trace) = run(&executor, probe).await;

        assert_eq!(summary.state, ProcedureState::RolledBack);
        assert_eq!(trace, vec!["exec:0"]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let probe = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Flaky(2),
            ProbeAction::Continue,
        ]);
        let (summary, trace) = run(&executor, probe).await;

        assert_eq!(summary.state, ProcedureState::Success);
        assert_eq!(trace, vec!["exec:0", "exec:1", "exec:1", "exec:1", "exec:2"]);
        assert_eq!(executor.metrics().step_retries, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let probe = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Flaky(10),
            ProbeAction::Continue,
        ]);
        let (summary, trace) = run(&executor, probe).await;

        assert_eq!(summary.state, ProcedureState::RolledBack);
        assert_eq!(summary.exception.map(|e| e.kind), Some(FailureKind::RetriesExhausted));
        assert_eq!(trace.iter().filter(|t| *t == "exec:1").count(), 3);
        assert_eq!(trace.last().map(String::as_str), Some("undo:0"));
    }

    #[tokio::test]
    async fn test_timeout_resumes_or_fails_per_policy() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;

        let resume = Probe::new([
            ProbeAction::Timeout {
                millis: 10,
                on_expiry: ExpiryPolicy::Resume,
            },
            ProbeAction::Continue,
            ProbeAction::Continue,
        ]);
        let (summary, trace) = run(&executor, resume).await;
        assert_eq!(summary.state, ProcedureState::Success);
        assert_eq!(trace, vec!["exec:0", "exec:0", "exec:1", "exec:2"]);

        let fail = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Timeout {
                millis: 10,
                on_expiry: ExpiryPolicy::Fail,
            },
            ProbeAction::Continue,
        ]);
        let (summary, trace) = run(&executor, fail).await;
        assert_eq!(summary.state, ProcedureState::RolledBack);
        assert_eq!(summary.exception.map(|e| e.kind), Some(FailureKind::TimedOut));
        assert_eq!(trace, vec!["exec:0", "exec:1", "undo:0"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_is_retained() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let mut probe = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Continue,
            ProbeAction::Fail,
        ]);
        probe.failing_rollback = Some(0);
        let (summary, trace) = run(&executor, probe).await;

        assert_eq!(summary.state, ProcedureState::Failed);
        assert_eq!(summary.rollback_error.map(|e| e.kind), Some(FailureKind::RollbackFailed));
        assert_eq!(trace, vec!["exec:0", "exec:1", "exec:2", "undo:1"]);
        assert_eq!(executor.metrics().failed_permanently, 1);

        // kept even after its ttl
        let report = executor.inner.evict_completed(Duration::ZERO);
        assert_eq!(report, 0);
        assert!(executor.get(summary.id).is_some());
    }

    #[tokio::test]
    async fn test_event_suspension_and_wake() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let probe = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Event("schema-ready".into()),
            ProbeAction::Continue,
        ]);
        let proc_id = executor.submit(probe.spec(), None).await.unwrap();

        let event = executor.event("schema-ready");
        while event.waiters().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.get(proc_id).unwrap().state, ProcedureState::Waiting);

        event.wake();
        let summary = executor
            .wait_for_completion_timeout(proc_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(summary.state, ProcedureState::Success);
    }

    #[tokio::test]
    async fn test_children_finish_before_parent_resumes() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let probe = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Spawn {
                count: 3,
                failing: false,
            },
            ProbeAction::Continue,
        ])
        .locking("t1");
        let (summary, _) = run(&executor, probe).await;

        assert_eq!(summary.state, ProcedureState::Success);
        assert_eq!(summary.children.len(), 3);
        for child in &summary.children {
            let child = executor.get(*child).unwrap();
            assert_eq!(child.state, ProcedureState::Success);
            assert_eq!(child.parent_id, Some(summary.id));
        }
        assert!(executor.locks().is_empty());
    }

    #[tokio::test]
    async fn test_failed_child_rolls_back_parent() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let probe = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Spawn {
                count: 2,
                failing: true,
            },
            ProbeAction::Continue,
        ]);
        let (summary, trace) = run(&executor, probe).await;

        assert_eq!(summary.state, ProcedureState::RolledBack);
        assert_eq!(summary.exception.map(|e| e.kind), Some(FailureKind::ChildFailed));
        assert_eq!(trace, vec!["exec:0", "exec:1", "undo:1", "undo:0"]);
    }

    #[tokio::test]
    async fn test_abort_before_first_step() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;

        let blocker = Probe::new([
            ProbeAction::Event("hold".into()),
            ProbeAction::Continue,
            ProbeAction::Continue,
        ])
        .locking("t1");
        let holder = executor.submit(blocker.spec(), None).await.unwrap();
        while executor.event("hold").waiters().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let waiter = executor.submit(Probe::passing().locking("t1").spec(), None).await.unwrap();
        while executor.locks().first().map_or(true, |l| l.waiting.is_empty()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(executor.abort(waiter, false).await.unwrap());
        let summary = executor
            .wait_for_completion_timeout(waiter, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(summary.state, ProcedureState::RolledBack);
        assert_eq!(summary.exception.map(|e| e.kind), Some(FailureKind::Aborted));
        assert_eq!(executor.scheduler_stats().lock_waiters, 0);

        executor.event("hold").wake();
        let summary = executor
            .wait_for_completion_timeout(holder, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(summary.state, ProcedureState::Success);
        assert!(!executor.abort(holder, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_submit_requires_start() {
        let executor = ProcedureExecutor::new(
            test_config(),
            Arc::new(MemoryProcedureStore::new()),
            Arc::new(MemoryCluster::new()),
        )
        .unwrap();
        let err = executor.submit(Probe::passing().spec(), None).await.unwrap_err();
        assert!(matches!(err, ProcedureError::NotInitialized));
    }

    #[tokio::test]
    async fn test_restart_resumes_and_continues_ids() {
        let store = MemoryProcedureStore::new();
        let first = started(&store).await;
        let probe = Probe::new([
            ProbeAction::Continue,
            ProbeAction::Event("resume".into()),
            ProbeAction::Continue,
        ])
        .locking("t1");
        let proc_id = first.submit(probe.spec(), NonceKey::new(9, 1)).await.unwrap();
        while first.event("resume").waiters().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        first.shutdown().await.unwrap();

        let second = started(&store).await;
        let parked = second.get(proc_id).unwrap();
        assert_eq!(parked.state, ProcedureState::Waiting);
        assert_eq!(second.locks()[0].exclusive_owner, Some(proc_id));

        // the nonce map was rebuilt from the log
        let again = second.submit(Probe::passing().spec(), NonceKey::new(9, 1)).await.unwrap();
        assert_eq!(again, proc_id);
        let fresh = second.submit(Probe::passing().spec(), None).await.unwrap();
        assert!(fresh > proc_id);

        second.event("resume").wake();
        let summary = second
            .wait_for_completion_timeout(proc_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(summary.state, ProcedureState::Success);
    }

    #[tokio::test]
    async fn test_eviction_and_compaction() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let (summary, _) = run(&executor, Probe::passing()).await;

        assert_eq!(executor.inner.evict_completed(Duration::ZERO), 1);
        assert!(executor.get(summary.id).is_none());
        executor.compact_store().await.unwrap();
        assert!(store.is_empty());
        executor.shutdown().await.unwrap();

        // an empty log still remembers which ids were handed out
        let restarted = started(&store).await;
        let fresh = restarted.submit(Probe::passing().spec(), None).await.unwrap();
        assert!(fresh > summary.id, "{} reissued after compaction", fresh);
    }

    #[tokio::test]
    async fn test_completion_stream() {
        let store = MemoryProcedureStore::new();
        let executor = started(&store).await;
        let mut completions = executor.subscribe();
        let (summary, _) = run(&executor, Probe::passing()).await;

        let notice = completions.recv().await.unwrap();
        assert_eq!(notice.proc_id, summary.id);
        assert_eq!(notice.state, ProcedureState::Success);
        assert_eq!(notice.proc_type, ProcedureType::Probe);
    }
}
