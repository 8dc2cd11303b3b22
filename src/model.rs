use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ProcedureError, Result};
use crate::lock::LockRequest;
use crate::procedure::{ProcedureSpec, ProcedureType};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const SYSTEM_NAMESPACE: &str = "hbase";

/// Identifier assigned to a procedure at submission, monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcedureId(pub u64);

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={}", self.0)
    }
}

/// Caller supplied `(group, nonce)` pair identifying one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonceKey {
    pub group: u64,
    pub nonce: u64,
}

impl NonceKey {
    /// Nonce value meaning "the caller did not ask for deduplication".
    pub const NO_NONCE: u64 = 0;

    /// Returns `None` for the no-nonce sentinel, so such requests always build fresh.
    pub fn new(group: u64, nonce: u64) -> Option<Self> {
        if nonce == Self::NO_NONCE {
            None
        } else {
            Some(Self { group, nonce })
        }
    }
}

impl fmt::Display for NonceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.nonce)
    }
}

/// Fully qualified table name, `namespace:qualifier`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub namespace: String,
    pub qualifier: String,
}

impl TableName {
    pub fn new(namespace: impl Into<String>, qualifier: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            qualifier: qualifier.into(),
        }
    }

    /// Parse `ns:table`, or a bare `table` in the default namespace.
    pub fn parse(name: &str) -> Self {
        match name.split_once(':') {
            Some((ns, qualifier)) => Self::new(ns, qualifier),
            None => Self::new(DEFAULT_NAMESPACE, name),
        }
    }

    pub fn is_system(&self) -> bool {
        self.namespace == SYSTEM_NAMESPACE
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.qualifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub max_versions: u32,
    pub ttl_secs: Option<u64>,
}

impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_versions: 1,
            ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: TableName,
    pub families: BTreeMap<String, ColumnFamilyDescriptor>,
}

impl TableDescriptor {
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            families: BTreeMap::new(),
        }
    }

    pub fn with_family(mut self, family: ColumnFamilyDescriptor) -> Self {
        self.families.insert(family.name.clone(), family);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableState {
    Enabled,
    Disabled,
    Enabling,
    Disabling,
}

/// Encoded region name, unique across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(pub String);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A contiguous key range `[start_key, end_key)` of a table; empty keys are unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub id: RegionId,
    pub table: TableName,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl RegionInfo {
    /// Region ids are derived from the creating procedure so re-executing the
    /// step that computes them always yields the same regions.
    pub fn new(
        table: &TableName,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        proc_id: ProcedureId,
        seq: usize,
    ) -> Self {
        let id = RegionId(format!(
            "{},{},{}.{}",
            table,
            hex(&start_key),
            proc_id.0,
            seq
        ));
        Self {
            id,
            table: table.clone(),
            start_key,
            end_key,
        }
    }

    /// Whether `row` falls strictly inside the region, so splitting there yields
    /// two non-empty daughters.
    pub fn is_valid_split_row(&self, row: &[u8]) -> bool {
        row > self.start_key.as_slice()
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }

    pub fn is_adjacent(&self, other: &RegionInfo) -> bool {
        self.table == other.table
            && (self.end_key == other.start_key || other.end_key == self.start_key)
    }
}

/// Regions covering the whole key space, cut at `split_keys`.
///
/// Ids depend only on the inputs, so recomputing after a crash yields the same regions.
pub fn region_boundaries(
    table: &TableName,
    split_keys: &[Vec<u8>],
    proc_id: ProcedureId,
) -> Vec<RegionInfo> {
    let mut keys: Vec<Vec<u8>> = split_keys.iter().filter(|k| !k.is_empty()).cloned().collect();
    keys.sort();
    keys.dedup();
    let mut regions = Vec::with_capacity(keys.len() + 1);
    let mut start = Vec::new();
    for (seq, end) in keys.into_iter().chain(std::iter::once(Vec::new())).enumerate() {
        regions.push(RegionInfo::new(table, start, end.clone(), proc_id, seq));
        start = end;
    }
    regions
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    Closed,
    Open,
    /// Parent region after a committed split, offline for good.
    Split,
    /// Region consumed by a committed merge, offline for good.
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub cluster_key: String,
    pub tables: Vec<TableName>,
    pub sync_replication: bool,
}

impl PeerConfig {
    pub fn new(cluster_key: impl Into<String>) -> Self {
        Self {
            cluster_key: cluster_key.into(),
            tables: Vec::new(),
            sync_replication: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncReplicationState {
    None,
    Active,
    DowngradeActive,
    Standby,
}

impl SyncReplicationState {
    /// Transitions a sync replication peer may go through.
    pub fn can_transit_to(self, to: SyncReplicationState) -> bool {
        use SyncReplicationState::*;
        matches!(
            (self, to),
            (Active, DowngradeActive)
                | (DowngradeActive, Active)
                | (DowngradeActive, Standby)
                | (Standby, DowngradeActive)
        )
    }
}

/// Procedure lifecycle states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureState {
    Initializing = 0,
    Runnable = 1,
    Waiting = 2,
    WaitingTimeout = 3,
    Success = 4,
    Failed = 5,
    RolledBack = 6,
}

impl ProcedureState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProcedureState::Initializing),
            1 => Some(ProcedureState::Runnable),
            2 => Some(ProcedureState::Waiting),
            3 => Some(ProcedureState::WaitingTimeout),
            4 => Some(ProcedureState::Success),
            5 => Some(ProcedureState::Failed),
            6 => Some(ProcedureState::RolledBack),
            _ => None,
        }
    }

    /// Edges of the state graph. `Failed -> Failed` records rollback progress.
    pub fn can_transition_to(self, next: ProcedureState) -> bool {
        use ProcedureState::*;
        matches!(
            (self, next),
            (Initializing, Runnable | Waiting | Failed)
                | (Runnable, Runnable | Waiting | WaitingTimeout | Success | Failed)
                | (Waiting, Runnable | Failed)
                | (WaitingTimeout, Runnable | Failed)
                | (Failed, Failed | RolledBack)
        )
    }
}

/// What to do when a `WaitingTimeout` deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryPolicy {
    /// Run the same step again.
    Resume,
    /// The deadline itself is unrecoverable; fail and roll back.
    Fail,
    /// Backoff after a transient failure has elapsed; try the step again.
    Retry,
}

/// Condition a suspended procedure is parked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wait {
    Event(String),
    Children,
    Timeout {
        deadline: DateTime<Utc>,
        on_expiry: ExpiryPolicy,
    },
    /// Waiting in a lock wait queue; never persisted as such.
    Lock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    StepFailed,
    RetriesExhausted,
    TimedOut,
    Aborted,
    ChildFailed,
    /// A resource the procedure needs changed underneath it while it waited
    ResourceConflict,
    RollbackFailed,
}

/// Structured cause stored in a failed procedure's `exception` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureFailure {
    pub kind: FailureKind,
    pub step: Option<String>,
    pub message: String,
}

impl ProcedureFailure {
    pub fn new(kind: FailureKind, step: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: step.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn step_failed(step: &str, message: impl Into<String>) -> Self {
        Self::new(FailureKind::StepFailed, Some(step), message)
    }
}

impl fmt::Display for ProcedureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{:?} at {}: {}", self.kind, step, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// One administrative operation and everything needed to resume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    pub id: ProcedureId,
    pub spec: ProcedureSpec,
    pub state: ProcedureState,
    pub step_index: u32,
    pub rollback_index: Option<u32>,
    pub parent_id: Option<ProcedureId>,
    pub children: Vec<ProcedureId>,
    pub locks: Vec<LockRequest>,
    pub holds_locks: bool,
    pub nonce_key: Option<NonceKey>,
    pub wait: Option<Wait>,
    pub wait_token: u64,
    pub retry_count: u32,
    pub result: Option<String>,
    pub exception: Option<ProcedureFailure>,
    pub rollback_error: Option<ProcedureFailure>,
    pub submitted_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    // Runtime bookkeeping, rebuilt from the other records on replay
    #[serde(skip)]
    pub remaining_children: usize,
    #[serde(skip)]
    pub child_failure: Option<ProcedureFailure>,
    #[serde(skip)]
    pub timed_out: bool,
}

impl Procedure {
    pub fn new(
        id: ProcedureId,
        spec: ProcedureSpec,
        parent_id: Option<ProcedureId>,
        nonce_key: Option<NonceKey>,
    ) -> Self {
        let now = Utc::now();
        let locks = spec.lock_requests();
        Self {
            id,
            spec,
            state: ProcedureState::Initializing,
            step_index: 0,
            rollback_index: None,
            parent_id,
            children: Vec::new(),
            locks,
            holds_locks: false,
            nonce_key,
            wait: None,
            wait_token: 0,
            retry_count: 0,
            result: None,
            exception: None,
            rollback_error: None,
            submitted_at: now,
            last_update: now,
            remaining_children: 0,
            child_failure: None,
            timed_out: false,
        }
    }

    pub fn proc_type(&self) -> ProcedureType {
        self.spec.proc_type()
    }

    /// Move along the state graph, stamping `last_update`.
    pub fn transition(&mut self, next: ProcedureState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?} for {}",
            self.state,
            next,
            self.id
        );
        self.state = next;
        self.last_update = Utc::now();
    }

    /// Terminal: SUCCESS, ROLLEDBACK, or FAILED with a failed rollback.
    pub fn is_finished(&self) -> bool {
        match self.state {
            ProcedureState::Success | ProcedureState::RolledBack => true,
            ProcedureState::Failed => self.rollback_error.is_some(),
            _ => false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ProcedureState::Success
    }

    /// Whether the procedure is rolling back (FAILED but not yet terminal).
    pub fn is_rolling_back(&self) -> bool {
        self.state == ProcedureState::Failed && self.rollback_error.is_none()
    }

    /// Enter FAILED and arm the rollback over every completed step.
    pub fn fail(&mut self, failure: ProcedureFailure) {
        self.transition(ProcedureState::Failed);
        self.rollback_index = Some(self.step_index);
        self.exception = Some(failure);
        self.wait = None;
        self.retry_count = 0;
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(ProcedureError::from)
    }

    pub fn summary(&self) -> ProcedureSummary {
        ProcedureSummary {
            id: self.id,
            proc_type: self.proc_type(),
            state: self.state,
            step_index: self.step_index,
            step_name: self.spec.step_name(self.step_index).map(str::to_string),
            parent_id: self.parent_id,
            children: self.children.clone(),
            nonce_key: self.nonce_key,
            locks: self.locks.iter().map(|l| l.to_string()).collect(),
            result: self.result.clone(),
            exception: self.exception.clone(),
            rollback_error: self.rollback_error.clone(),
            submitted_at: self.submitted_at,
            last_update: self.last_update,
        }
    }
}

/// Point-in-time view of a procedure, as returned by `list_procedures`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSummary {
    pub id: ProcedureId,
    pub proc_type: ProcedureType,
    pub state: ProcedureState,
    pub step_index: u32,
    pub step_name: Option<String>,
    pub parent_id: Option<ProcedureId>,
    pub children: Vec<ProcedureId>,
    pub nonce_key: Option<NonceKey>,
    pub locks: Vec<String>,
    pub result: Option<String>,
    pub exception: Option<ProcedureFailure>,
    pub rollback_error: Option<ProcedureFailure>,
    pub submitted_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl ProcedureSummary {
    pub fn is_finished(&self) -> bool {
        match self.state {
            ProcedureState::Success | ProcedureState::RolledBack => true,
            ProcedureState::Failed => self.rollback_error.is_some(),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProcedureError::internal(e.to_string()))
    }
}
