//! Procedure types and their step tables.
//!
//! Every procedure type is a plain struct holding its parameters plus whatever it
//! computes while running, and a fixed, ordered table of [`Step`]s. The executor
//! persists the struct after every step, so a step must be safe to run again from
//! the last persisted state: the cluster actions it issues are idempotent and any
//! value it derives (region ids, previous descriptors) is a pure function of the
//! struct and the procedure id.

pub mod namespace;
pub mod peer;
pub mod region;
pub mod table;

#[cfg(test)]
pub(crate) mod probe;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::env::{ClusterAction, ClusterEnv};
use crate::error::ActionError;
use crate::event::EventRegistry;
use crate::lock::LockRequest;
use crate::model::{ExpiryPolicy, FailureKind, ProcedureFailure, ProcedureId, Wait};

pub use namespace::{CreateNamespace, DeleteNamespace};
pub use peer::{
    AddPeer, RemovePeer, SetPeerState, TransitPeerSyncReplicationState, UpdatePeerConfig,
};
pub use region::{MergeRegions, ReopenRegion, SplitRegion};
pub use table::{CreateTable, DeleteTable, DisableTable, EnableTable, ModifyTable, TruncateTable};

pub type StepResult = Result<StepOutcome, ActionError>;
pub type StepFn<T> = for<'a> fn(&'a mut T, &'a StepContext) -> BoxFuture<'a, StepResult>;
pub type RollbackFn<T> =
    for<'a> fn(&'a mut T, &'a StepContext) -> BoxFuture<'a, Result<(), ActionError>>;

/// What a step asks the executor to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step done, run the next one
    Continue,
    /// Last step done; the procedure succeeds with this result
    Finish(Option<String>),
    /// Step done; park until every spawned child is terminal
    SpawnChildren(Vec<ProcedureSpec>),
    /// Step not done; run it again once the wait is over
    Suspend(Wait),
    /// Unrecoverable; roll back the completed steps
    Fail(ProcedureFailure),
}

impl StepOutcome {
    pub fn wait_for_event(name: &str) -> Self {
        StepOutcome::Suspend(Wait::Event(name.to_string()))
    }

    pub fn wait_until(deadline: DateTime<Utc>, on_expiry: ExpiryPolicy) -> Self {
        StepOutcome::Suspend(Wait::Timeout { deadline, on_expiry })
    }
}

/// One entry of a procedure type's step table.
pub struct Step<T> {
    pub name: &'static str,
    pub execute: StepFn<T>,
    /// Compensation for a completed run of `execute`; `None` when there is nothing to undo
    pub rollback: Option<RollbackFn<T>>,
    /// Whether the procedure may still be aborted before this step runs
    pub abortable: bool,
}

impl<T> Step<T> {
    pub const fn new(name: &'static str, execute: StepFn<T>) -> Self {
        Self {
            name,
            execute,
            rollback: None,
            abortable: true,
        }
    }

    pub const fn with_rollback(self, rollback: RollbackFn<T>) -> Self {
        Step {
            rollback: Some(rollback),
            ..self
        }
    }

    /// Running this step crosses the point of no return.
    pub const fn irreversible(self) -> Self {
        Step {
            abortable: false,
            ..self
        }
    }
}

/// Implemented by every procedure type.
pub trait ProcedureDef: Send + Sized + 'static {
    const STEPS: &'static [Step<Self>];

    /// Resources held for the whole life of the procedure, coarsest first.
    fn locks(&self) -> Vec<LockRequest>;
}

/// Everything a running step may touch.
pub struct StepContext {
    pub proc_id: ProcedureId,
    pub step: &'static str,
    pub env: Arc<dyn ClusterEnv>,
    pub events: Arc<EventRegistry>,
    /// Transient failures of this step so far
    pub attempt: u32,
    /// The step is re-running because its own timeout expired
    pub timed_out: bool,
}

impl StepContext {
    pub async fn perform(&self, action: ClusterAction) -> Result<(), ActionError> {
        debug!(
            proc_id = %self.proc_id,
            step = self.step,
            action = action.name(),
            "performing cluster action"
        );
        self.env.perform(&action).await
    }

    pub fn event_ready(&self, name: &str) -> bool {
        self.events.get_or_create(name).is_ready()
    }

    /// Fail the procedure because cluster state no longer allows it.
    pub fn conflict(&self, message: impl Into<String>) -> StepResult {
        Ok(StepOutcome::Fail(ProcedureFailure::new(
            FailureKind::ResourceConflict,
            Some(self.step),
            message,
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureType {
    CreateTable,
    DeleteTable,
    TruncateTable,
    ModifyTable,
    EnableTable,
    DisableTable,
    SplitRegion,
    MergeRegions,
    ReopenRegion,
    CreateNamespace,
    DeleteNamespace,
    AddReplicationPeer,
    RemoveReplicationPeer,
    EnableReplicationPeer,
    DisableReplicationPeer,
    UpdateReplicationPeerConfig,
    TransitPeerSyncReplicationState,
    #[cfg(test)]
    Probe,
}

impl fmt::Display for ProcedureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}Procedure", self)
    }
}

/// A procedure's type together with its parameters and accumulated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcedureSpec {
    CreateTable(CreateTable),
    DeleteTable(DeleteTable),
    TruncateTable(TruncateTable),
    ModifyTable(ModifyTable),
    EnableTable(EnableTable),
    DisableTable(DisableTable),
    SplitRegion(SplitRegion),
    MergeRegions(MergeRegions),
    ReopenRegion(ReopenRegion),
    CreateNamespace(CreateNamespace),
    DeleteNamespace(DeleteNamespace),
    AddPeer(AddPeer),
    RemovePeer(RemovePeer),
    SetPeerState(SetPeerState),
    UpdatePeerConfig(UpdatePeerConfig),
    TransitPeerSyncReplicationState(TransitPeerSyncReplicationState),
    #[cfg(test)]
    Probe(probe::Probe),
}

macro_rules! with_def {
    ($spec:expr, $p:ident => $body:expr) => {
        match $spec {
            ProcedureSpec::CreateTable($p) => $body,
            ProcedureSpec::DeleteTable($p) => $body,
            ProcedureSpec::TruncateTable($p) => $body,
            ProcedureSpec::ModifyTable($p) => $body,
            ProcedureSpec::EnableTable($p) => $body,
            ProcedureSpec::DisableTable($p) => $body,
            ProcedureSpec::SplitRegion($p) => $body,
            ProcedureSpec::MergeRegions($p) => $body,
            ProcedureSpec::ReopenRegion($p) => $body,
            ProcedureSpec::CreateNamespace($p) => $body,
            ProcedureSpec::DeleteNamespace($p) => $body,
            ProcedureSpec::AddPeer($p) => $body,
            ProcedureSpec::RemovePeer($p) => $body,
            ProcedureSpec::SetPeerState($p) => $body,
            ProcedureSpec::UpdatePeerConfig($p) => $body,
            ProcedureSpec::TransitPeerSyncReplicationState($p) => $body,
            #[cfg(test)]
            ProcedureSpec::Probe($p) => $body,
        }
    };
}

fn steps_of<T: ProcedureDef>(_: &T) -> &'static [Step<T>] {
    T::STEPS
}

async fn execute_step<T: ProcedureDef>(def: &mut T, index: u32, ctx: &StepContext) -> StepResult {
    match T::STEPS.get(index as usize) {
        Some(step) => (step.execute)(def, ctx).await,
        None => Err(ActionError::fatal(
            "execute",
            format!("no step {} in a table of {}", index, T::STEPS.len()),
        )),
    }
}

async fn rollback_step<T: ProcedureDef>(
    def: &mut T,
    index: u32,
    ctx: &StepContext,
) -> Result<(), ActionError> {
    match T::STEPS.get(index as usize).and_then(|step| step.rollback) {
        Some(rollback) => rollback(def, ctx).await,
        None => Ok(()),
    }
}

impl ProcedureSpec {
    pub fn proc_type(&self) -> ProcedureType {
        match self {
            ProcedureSpec::CreateTable(_) => ProcedureType::CreateTable,
            ProcedureSpec::DeleteTable(_) => ProcedureType::DeleteTable,
            ProcedureSpec::TruncateTable(_) => ProcedureType::TruncateTable,
            ProcedureSpec::ModifyTable(_) => ProcedureType::ModifyTable,
            ProcedureSpec::EnableTable(_) => ProcedureType::EnableTable,
            ProcedureSpec::DisableTable(_) => ProcedureType::DisableTable,
            ProcedureSpec::SplitRegion(_) => ProcedureType::SplitRegion,
            ProcedureSpec::MergeRegions(_) => ProcedureType::MergeRegions,
            ProcedureSpec::ReopenRegion(_) => ProcedureType::ReopenRegion,
            ProcedureSpec::CreateNamespace(_) => ProcedureType::CreateNamespace,
            ProcedureSpec::DeleteNamespace(_) => ProcedureType::DeleteNamespace,
            ProcedureSpec::AddPeer(_) => ProcedureType::AddReplicationPeer,
            ProcedureSpec::RemovePeer(_) => ProcedureType::RemoveReplicationPeer,
            ProcedureSpec::SetPeerState(p) if p.enabled => ProcedureType::EnableReplicationPeer,
            ProcedureSpec::SetPeerState(_) => ProcedureType::DisableReplicationPeer,
            ProcedureSpec::UpdatePeerConfig(_) => ProcedureType::UpdateReplicationPeerConfig,
            ProcedureSpec::TransitPeerSyncReplicationState(_) => {
                ProcedureType::TransitPeerSyncReplicationState
            }
            #[cfg(test)]
            ProcedureSpec::Probe(_) => ProcedureType::Probe,
        }
    }

    pub fn lock_requests(&self) -> Vec<LockRequest> {
        with_def!(self, p => p.locks())
    }

    pub fn step_count(&self) -> u32 {
        with_def!(self, p => steps_of(p).len() as u32)
    }

    pub fn step_name(&self, index: u32) -> Option<&'static str> {
        with_def!(self, p => steps_of(p).get(index as usize).map(|s| s.name))
    }

    /// Whether an abort is still allowed while the next step to run is `index`.
    pub fn is_abortable(&self, index: u32) -> bool {
        with_def!(self, p => steps_of(p).get(index as usize).map_or(false, |s| s.abortable))
    }

    pub fn has_rollback(&self, index: u32) -> bool {
        with_def!(self, p => steps_of(p)
            .get(index as usize)
            .map_or(false, |s| s.rollback.is_some()))
    }

    pub async fn execute(&mut self, index: u32, ctx: &StepContext) -> StepResult {
        with_def!(self, p => execute_step(p, index, ctx).await)
    }

    pub async fn rollback(&mut self, index: u32, ctx: &StepContext) -> Result<(), ActionError> {
        with_def!(self, p => rollback_step(p, index, ctx).await)
    }
}
