//! The cluster the procedures operate on.
//!
//! Steps never touch region servers, the filesystem or the meta table directly:
//! they issue [`ClusterAction`]s through a [`ClusterEnv`] and read back metadata.
//! Every action must be idempotent, since a step is re-executed after a crash.

mod memory;

pub use memory::{GateHandle, MemoryCluster};

use async_trait::async_trait;

use crate::error::ActionError;
use crate::model::{
    PeerConfig, RegionId, RegionInfo, RegionState, SyncReplicationState, TableDescriptor, TableName,
    TableState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterAction {
    CreateNamespace { namespace: String },
    DeleteNamespace { namespace: String },

    /// Write the table's directory layout for the given regions
    CreateTableLayout { descriptor: TableDescriptor, regions: Vec<RegionInfo> },
    DeleteTableLayout { table: TableName },
    /// Register the table and its regions in meta, state ENABLING
    AddTableToMeta { descriptor: TableDescriptor, regions: Vec<RegionInfo> },
    RemoveTableFromMeta { table: TableName },
    SetTableState { table: TableName, state: TableState },
    UpdateTableDescriptor { descriptor: TableDescriptor },

    AssignRegions { regions: Vec<RegionId> },
    UnassignRegions { regions: Vec<RegionId> },
    ReopenRegion { region: RegionId },

    CreateDaughterLayout { parent: RegionId, daughters: Vec<RegionInfo> },
    DeleteDaughterLayout { daughters: Vec<RegionId> },
    /// Mark the parent split and register the daughters in meta
    CommitSplit { parent: RegionId, daughters: Vec<RegionInfo> },
    CreateMergedLayout { merged: RegionInfo },
    DeleteMergedLayout { merged: RegionId },
    /// Mark the parents merged and register the merged region in meta
    CommitMerge { parents: Vec<RegionId>, merged: RegionInfo },

    AddPeer { peer_id: String, config: PeerConfig, enabled: bool },
    RemovePeer { peer_id: String },
    SetPeerEnabled { peer_id: String, enabled: bool },
    UpdatePeerConfig { peer_id: String, config: PeerConfig },
    SetPeerSyncState { peer_id: String, state: SyncReplicationState },
    /// Push the current peer state to every region server
    RefreshPeer { peer_id: String },
}

impl ClusterAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterAction::CreateNamespace { .. } => "create-namespace",
            ClusterAction::DeleteNamespace { .. } => "delete-namespace",
            ClusterAction::CreateTableLayout { .. } => "create-table-layout",
            ClusterAction::DeleteTableLayout { .. } => "delete-table-layout",
            ClusterAction::AddTableToMeta { .. } => "add-table-to-meta",
            ClusterAction::RemoveTableFromMeta { .. } => "remove-table-from-meta",
            ClusterAction::SetTableState { .. } => "set-table-state",
            ClusterAction::UpdateTableDescriptor { .. } => "update-table-descriptor",
            ClusterAction::AssignRegions { .. } => "assign-regions",
            ClusterAction::UnassignRegions { .. } => "unassign-regions",
            ClusterAction::ReopenRegion { .. } => "reopen-region",
            ClusterAction::CreateDaughterLayout { .. } => "create-daughter-layout",
            ClusterAction::DeleteDaughterLayout { .. } => "delete-daughter-layout",
            ClusterAction::CommitSplit { .. } => "commit-split",
            ClusterAction::CreateMergedLayout { .. } => "create-merged-layout",
            ClusterAction::DeleteMergedLayout { .. } => "delete-merged-layout",
            ClusterAction::CommitMerge { .. } => "commit-merge",
            ClusterAction::AddPeer { .. } => "add-peer",
            ClusterAction::RemovePeer { .. } => "remove-peer",
            ClusterAction::SetPeerEnabled { .. } => "set-peer-enabled",
            ClusterAction::UpdatePeerConfig { .. } => "update-peer-config",
            ClusterAction::SetPeerSyncState { .. } => "set-peer-sync-state",
            ClusterAction::RefreshPeer { .. } => "refresh-peer",
        }
    }
}

/// What meta knows about a table. `regions` lists live regions by start key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub descriptor: TableDescriptor,
    pub state: TableState,
    pub regions: Vec<RegionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMeta {
    pub info: RegionInfo,
    pub state: RegionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMeta {
    pub config: PeerConfig,
    pub enabled: bool,
    pub sync_state: SyncReplicationState,
}

/// Collaborator trait for everything outside the procedure core.
#[async_trait]
pub trait ClusterEnv: Send + Sync {
    /// Apply one action. Errors come back as values; implementations must not panic.
    async fn perform(&self, action: &ClusterAction) -> Result<(), ActionError>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ActionError>;

    async fn tables_in_namespace(&self, namespace: &str) -> Result<Vec<TableName>, ActionError>;

    async fn table(&self, table: &TableName) -> Result<Option<TableMeta>, ActionError>;

    async fn region(&self, region: &RegionId) -> Result<Option<RegionMeta>, ActionError>;

    async fn peer(&self, peer_id: &str) -> Result<Option<PeerMeta>, ActionError>;
}
