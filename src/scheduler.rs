use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::lock::{LockManager, LockOutcome, LockRequest, LockedResourceSummary, ResourceKey};
use crate::model::ProcedureId;
use crate::ready_queue::ReadyQueue;

#[derive(Debug, Default)]
struct LockState {
    locks: LockManager,
    /// FIFO wait queue per blocking resource, ordered by first-wait sequence
    waiters: BTreeMap<ResourceKey, BTreeMap<u64, ProcedureId>>,
    /// Sequence a procedure got when it first blocked; kept until it is granted so a
    /// re-block after a wakeup keeps its place
    wait_seq: HashMap<ProcedureId, u64>,
    /// Woken from a wait queue but not yet retried
    woken: HashSet<ProcedureId>,
    next_seq: u64,
}

impl LockState {
    fn enqueue_waiter(&mut self, proc_id: ProcedureId, key: ResourceKey) {
        let next_seq = &mut self.next_seq;
        let seq = *self.wait_seq.entry(proc_id).or_insert_with(|| {
            *next_seq += 1;
            *next_seq
        });
        self.waiters.entry(key).or_default().insert(seq, proc_id);
    }

    /// A resource in the request chain that still has older waiters queued.
    fn older_waiter_on(
        &self,
        proc_id: ProcedureId,
        requests: &[LockRequest],
    ) -> Option<ResourceKey> {
        let own_seq = self.wait_seq.get(&proc_id).copied().unwrap_or(u64::MAX);
        requests
            .iter()
            .flat_map(|r| r.resource.path())
            .find(|key| {
                self.waiters
                    .get(key)
                    .and_then(|queue| queue.keys().next())
                    .map_or(false, |&head| head < own_seq)
            })
    }
}

/// Orders ready procedures and arbitrates resource locks.
pub struct Scheduler {
    state: Mutex<LockState>,
    ready: ReadyQueue<ProcedureId>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            ready: ReadyQueue::new(),
        }
    }

    /// Make a procedure runnable. `urgent` puts it ahead of unrelated submissions.
    pub fn enqueue(&self, proc_id: ProcedureId, urgent: bool) {
        if urgent {
            self.ready.push_urgent(proc_id);
        } else {
            self.ready.push(proc_id);
        }
    }

    pub fn pop(&self) -> Option<ProcedureId> {
        self.ready.pop()
    }

    pub async fn notified(&self) {
        self.ready.notified().await
    }

    pub fn kick(&self) {
        self.ready.kick()
    }

    /// Try to take all of `requests` for `ancestry[0]`.
    ///
    /// On conflict the procedure is queued on the blocking resource in the same
    /// critical section, so a release can never slip in between and be missed.
    pub fn try_acquire(&self, ancestry: &[ProcedureId], requests: &[LockRequest]) -> LockOutcome {
        let Some(&proc_id) = ancestry.first() else {
            return LockOutcome::Granted;
        };
        let mut state = self.state.lock();
        state.woken.remove(&proc_id);

        // children run under their parent's locks and must not queue behind
        // procedures that are themselves waiting for the parent
        let fairness = if ancestry.len() == 1 {
            state.older_waiter_on(proc_id, requests)
        } else {
            None
        };
        if let Some(key) = fairness {
            debug!(proc_id = %proc_id, resource = %key, "queued behind earlier waiter");
            state.enqueue_waiter(proc_id, key.clone());
            return LockOutcome::Blocked(key);
        }

        let outcome = state.locks.try_acquire(ancestry, requests);
        match &outcome {
            LockOutcome::Granted => {
                state.wait_seq.remove(&proc_id);
            }
            LockOutcome::Blocked(key) => {
                debug!(proc_id = %proc_id, resource = %key, "lock conflict, waiting");
                state.enqueue_waiter(proc_id, key.clone());
            }
        }
        outcome
    }

    /// Reinstall locks a recovered procedure held before the crash.
    pub fn restore_locks(
        &self,
        proc_id: ProcedureId,
        ancestry: &[ProcedureId],
        requests: &[LockRequest],
    ) {
        self.state.lock().locks.restore(proc_id, ancestry, requests);
    }

    /// Release everything `proc_id` holds and return the waiters to retry, oldest first.
    pub fn release(&self, proc_id: ProcedureId) -> Vec<ProcedureId> {
        let mut state = self.state.lock();
        let freed = state.locks.release_all(proc_id);

        let mut woken: Vec<(u64, ProcedureId)> = Vec::new();
        for key in freed {
            if let Some(queue) = state.waiters.remove(&key) {
                woken.extend(queue);
            }
        }
        woken.sort_unstable();
        woken.dedup();
        for (_, id) in &woken {
            state.woken.insert(*id);
        }
        woken.into_iter().map(|(_, id)| id).collect()
    }

    /// Forget a procedure's lock wait, e.g. after it was aborted.
    pub fn cancel_lock_wait(&self, proc_id: ProcedureId) -> bool {
        let mut state = self.state.lock();
        let mut removed = false;
        state.waiters.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|_, id| *id != proc_id);
            removed |= queue.len() != before;
            !queue.is_empty()
        });
        state.wait_seq.remove(&proc_id);
        state.woken.remove(&proc_id);
        removed
    }

    pub fn is_waiting_for_lock(&self, proc_id: ProcedureId) -> bool {
        let state = self.state.lock();
        state.woken.contains(&proc_id)
            || state.waiters.values().any(|queue| queue.values().any(|id| *id == proc_id))
    }

    /// Locked resources with their owners and FIFO waiters.
    pub fn snapshot(&self) -> Vec<LockedResourceSummary> {
        let state = self.state.lock();
        let mut summaries = state.locks.snapshot();
        for summary in &mut summaries {
            let key = ResourceKey {
                kind: summary.resource_type,
                name: summary.resource_name.clone(),
            };
            if let Some(queue) = state.waiters.get(&key) {
                summary.waiting = queue.values().copied().collect();
            }
        }
        summaries
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            ready_queue_size: self.ready.len(),
            locked_resources: state.locks.snapshot().len(),
            lock_waiters: state.waiters.values().map(|q| q.len()).sum(),
        }
    }
}

/// Statistics about the scheduler state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ready_queue_size: usize,
    pub locked_resources: usize,
    pub lock_waiters: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::Resource;
    use crate::model::{RegionId, TableName};
    use pretty_assertions::assert_eq;

    fn table_excl(name: &str) -> Vec<LockRequest> {
        vec![LockRequest::exclusive(Resource::Table(TableName::parse(name)))]
    }

    fn p(id: u64) -> ProcedureId {
        ProcedureId(id)
    }

    #[test]
    fn test_ready_lanes() {
        let scheduler = Scheduler::new();
        scheduler.enqueue(p(1), false);
        scheduler.enqueue(p(2), true);
        assert_eq!(scheduler.pop(), Some(p(2)));
        assert_eq!(scheduler.pop(), Some(p(1)));
        assert_eq!(scheduler.pop(), None);
    }

    #[test]
    fn test_release_wakes_waiters_in_fifo_order() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.try_acquire(&[p(1)], &table_excl("t1")), LockOutcome::Granted);
        assert!(matches!(
            scheduler.try_acquire(&[p(2)], &table_excl("t1")),
            LockOutcome::Blocked(_)
        ));
        assert!(matches!(
            scheduler.try_acquire(&[p(3)], &table_excl("t1")),
            LockOutcome::Blocked(_)
        ));

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot[0].exclusive_owner, Some(p(1)));
        assert_eq!(snapshot[0].waiting, vec![p(2), p(3)]);

        assert_eq!(scheduler.release(p(1)), vec![p(2), p(3)]);
        assert!(scheduler.is_waiting_for_lock(p(3)));
    }

    #[test]
    fn test_reblocked_waiter_keeps_its_place() {
        let scheduler = Scheduler::new();
        scheduler.try_acquire(&[p(1)], &table_excl("t1"));
        scheduler.try_acquire(&[p(2)], &table_excl("t1"));
        scheduler.try_acquire(&[p(3)], &table_excl("t1"));
        assert_eq!(scheduler.release(p(1)), vec![p(2), p(3)]);

        // p3 happens to retry first and wins; p2 re-blocks with its original place
        assert_eq!(scheduler.try_acquire(&[p(3)], &table_excl("t1")), LockOutcome::Granted);
        assert!(matches!(
            scheduler.try_acquire(&[p(4)], &table_excl("t1")),
            LockOutcome::Blocked(_)
        ));
        assert!(matches!(
            scheduler.try_acquire(&[p(2)], &table_excl("t1")),
            LockOutcome::Blocked(_)
        ));
        assert_eq!(scheduler.snapshot()[0].waiting, vec![p(2), p(4)]);
        assert_eq!(scheduler.release(p(3)), vec![p(2), p(4)]);
    }

    #[test]
    fn test_shared_newcomer_queues_behind_exclusive_waiter() {
        let scheduler = Scheduler::new();
        let shared = vec![LockRequest::shared(Resource::Table(TableName::parse("t1")))];

        assert_eq!(scheduler.try_acquire(&[p(1)], &shared), LockOutcome::Granted);
        assert!(matches!(
            scheduler.try_acquire(&[p(2)], &table_excl("t1")),
            LockOutcome::Blocked(_)
        ));
        // compatible with p1, but p2 asked first
        assert_eq!(
            scheduler.try_acquire(&[p(3)], &shared),
            LockOutcome::Blocked(Resource::Table(TableName::parse("t1")).key())
        );

        assert_eq!(scheduler.release(p(1)), vec![p(2), p(3)]);
        assert_eq!(scheduler.try_acquire(&[p(2)], &table_excl("t1")), LockOutcome::Granted);
        assert!(matches!(scheduler.try_acquire(&[p(3)], &shared), LockOutcome::Blocked(_)));
    }

    #[test]
    fn test_child_runs_under_parent_lock() {
        let scheduler = Scheduler::new();
        let table = TableName::parse("t1");
        scheduler.try_acquire(&[p(1)], &table_excl("t1"));
        let region = vec![LockRequest::exclusive(Resource::region(&table, &RegionId::from("r1")))];
        assert_eq!(scheduler.try_acquire(&[p(2), p(1)], &region), LockOutcome::Granted);
        assert!(matches!(scheduler.try_acquire(&[p(3)], &region), LockOutcome::Blocked(_)));
    }

    #[test]
    fn test_cancel_lock_wait() {
        let scheduler = Scheduler::new();
        scheduler.try_acquire(&[p(1)], &table_excl("t1"));
        scheduler.try_acquire(&[p(2)], &table_excl("t1"));
        assert!(scheduler.cancel_lock_wait(p(2)));
        assert!(!scheduler.is_waiting_for_lock(p(2)));
        assert!(scheduler.release(p(1)).is_empty());
        assert_eq!(
            scheduler.stats(),
            SchedulerStats {
                ready_queue_size: 0,
                locked_resources: 0,
                lock_waiters: 0
            }
        );
    }
}
