//! Rebuilding the procedure arena from the store.
//!
//! The log holds one record per persisted step of every procedure. Replay keeps
//! the last record per id, then recomputes the runtime bookkeeping that is never
//! persisted (outstanding child counts and child failures).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{ProcedureError, Result};
use crate::model::{FailureKind, Procedure, ProcedureFailure, ProcedureId};
use crate::store::StoreRecord;

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Records read from the store
    pub records: usize,
    /// Distinct procedures reconstructed
    pub procedures: usize,
    /// Already terminal when the executor stopped
    pub finished: usize,
    /// Put back on the ready queue
    pub resumed: usize,
    pub rolling_back: usize,
    /// Procedures whose locks were reinstalled
    pub locks_restored: usize,
    pub event_waiters: usize,
    pub timers: usize,
    pub next_id: u64,
}

/// Fold the log into the latest state of every procedure, in id order.
pub fn replay(records: Vec<StoreRecord>) -> Result<BTreeMap<ProcedureId, Procedure>> {
    let mut procedures: BTreeMap<ProcedureId, Procedure> = BTreeMap::new();
    for (proc_id, bytes) in records {
        let proc = Procedure::decode(&bytes)?;
        if proc.id != proc_id {
            return Err(ProcedureError::storage(format!(
                "record filed under {} decodes as {}",
                proc_id, proc.id
            )));
        }
        if let Some(previous) = procedures.get(&proc_id) {
            if proc.step_index < previous.step_index {
                return Err(ProcedureError::storage(format!(
                    "{} went back from step {} to step {}",
                    proc_id, previous.step_index, proc.step_index
                )));
            }
        }
        procedures.insert(proc_id, proc);
    }
    info!(procedures = procedures.len(), "replayed procedure log");
    Ok(procedures)
}

/// Recompute outstanding child counts and the first child failure of every parent.
pub fn link_children(procedures: &mut BTreeMap<ProcedureId, Procedure>) {
    let child_states: BTreeMap<ProcedureId, (bool, bool)> = procedures
        .iter()
        .filter(|(_, p)| p.parent_id.is_some())
        .map(|(id, p)| (*id, (p.is_finished(), p.is_success())))
        .collect();

    for parent in procedures.values_mut() {
        if parent.children.is_empty() || parent.is_finished() {
            continue;
        }
        parent.remaining_children = 0;
        parent.child_failure = None;
        for child in &parent.children {
            match child_states.get(child) {
                Some((false, _)) => parent.remaining_children += 1,
                Some((true, false)) if parent.child_failure.is_none() => {
                    parent.child_failure = Some(child_failure(*child));
                }
                Some(_) => {}
                None => debug!(
                    proc_id = %parent.id,
                    child = %child,
                    "child record missing, treating as done"
                ),
            }
        }
    }
}

pub(crate) fn child_failure(child: ProcedureId) -> ProcedureFailure {
    ProcedureFailure::new(
        FailureKind::ChildFailed,
        None,
        format!("child procedure {} did not succeed", child),
    )
}

/// Requesting procedure first, then its parent, grandparent and so on.
pub fn ancestry_in(
    procedures: &BTreeMap<ProcedureId, Procedure>,
    proc_id: ProcedureId,
) -> Vec<ProcedureId> {
    let mut chain = vec![proc_id];
    let mut current = procedures.get(&proc_id).and_then(|p| p.parent_id);
    while let Some(parent) = current {
        chain.push(parent);
        current = procedures.get(&parent).and_then(|p| p.parent_id);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProcedureState, Wait};
    use crate::procedure::probe::Probe;
    use pretty_assertions::assert_eq;

    fn probe(id: u64, parent: Option<u64>) -> Procedure {
        Procedure::new(ProcedureId(id), Probe::passing().spec(), parent.map(ProcedureId), None)
    }

    fn record(proc: &Procedure) -> StoreRecord {
        (proc.id, proc.encode().unwrap())
    }

    #[test]
    fn test_replay_keeps_last_record() {
        let mut p1 = probe(1, None);
        let first = record(&p1);
        p1.transition(ProcedureState::Runnable);
        p1.step_index = 2;
        let p2 = probe(2, None);

        let procedures = replay(vec![first, record(&p2), record(&p1)]).unwrap();
        assert_eq!(procedures.len(), 2);
        assert_eq!(procedures[&ProcedureId(1)].step_index, 2);
        assert_eq!(procedures[&ProcedureId(1)].state, ProcedureState::Runnable);
    }

    #[test]
    fn test_replay_rejects_step_regression() {
        let mut p1 = probe(1, None);
        p1.transition(ProcedureState::Runnable);
        p1.step_index = 2;
        let later = record(&p1);
        p1.step_index = 1;
        let err = replay(vec![later, record(&p1)]).unwrap_err();
        assert!(matches!(err, ProcedureError::Storage(_)));
    }

    #[test]
    fn test_link_children_counts_outstanding() {
        let mut parent = probe(1, None);
        parent.transition(ProcedureState::Runnable);
        parent.transition(ProcedureState::Waiting);
        parent.wait = Some(Wait::Children);
        parent.children = vec![ProcedureId(2), ProcedureId(3), ProcedureId(4)];

        let running = probe(2, Some(1));
        let mut done = probe(3, Some(1));
        done.transition(ProcedureState::Runnable);
        done.transition(ProcedureState::Success);
        let mut rolled_back = probe(4, Some(1));
        rolled_back.transition(ProcedureState::Failed);
        rolled_back.transition(ProcedureState::RolledBack);

        let mut procedures = replay(vec![
            record(&parent),
            record(&running),
            record(&done),
            record(&rolled_back),
        ])
        .unwrap();
        link_children(&mut procedures);

        let parent = &procedures[&ProcedureId(1)];
        assert_eq!(parent.remaining_children, 1);
        assert_eq!(parent.child_failure, Some(child_failure(ProcedureId(4))));
        assert_eq!(ancestry_in(&procedures, ProcedureId(3)), vec![ProcedureId(3), ProcedureId(1)]);
    }
}
