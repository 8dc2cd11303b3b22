use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{ClusterAction, ClusterEnv, PeerMeta, RegionMeta, TableMeta};
use crate::error::ActionError;
use crate::model::{
    region_boundaries, ProcedureId, RegionId, RegionInfo, RegionState, SyncReplicationState,
    TableDescriptor, TableName, TableState, DEFAULT_NAMESPACE, SYSTEM_NAMESPACE,
};

#[derive(Debug)]
struct TableRecord {
    descriptor: TableDescriptor,
    state: TableState,
}

#[derive(Debug)]
struct InjectedFailure {
    action: &'static str,
    error: ActionError,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct Gate {
    entered: watch::Sender<bool>,
    open: watch::Sender<bool>,
}

/// Handle for an action gate installed with [`MemoryCluster::gate`].
#[derive(Debug, Clone)]
pub struct GateHandle {
    gate: Gate,
}

impl GateHandle {
    /// Wait until some step reached the gated action.
    pub async fn entered(&self) {
        let mut rx = self.gate.entered.subscribe();
        let _ = rx.wait_for(|entered| *entered).await;
    }

    /// Let the held action (and all later ones) through.
    pub fn release(&self) {
        self.gate.open.send_replace(true);
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    tables: BTreeMap<TableName, TableRecord>,
    table_layouts: BTreeSet<TableName>,
    regions: BTreeMap<RegionId, RegionMeta>,
    region_layouts: BTreeSet<RegionId>,
    peers: BTreeMap<String, PeerMeta>,
    applied: Vec<ClusterAction>,
    attempts: HashMap<&'static str, u32>,
    failures: Vec<InjectedFailure>,
    gates: HashMap<&'static str, Gate>,
}

/// In-memory cluster model.
///
/// Actions are idempotent: repeating one leaves the same state behind, which is what
/// makes re-executing an interrupted step safe. Tests inject failures per action
/// name and hold actions at gates to line up concurrent procedures.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// A cluster with the default and system namespaces.
    pub fn new() -> Self {
        let mut state = ClusterState::default();
        state.namespaces.insert(DEFAULT_NAMESPACE.to_string());
        state.namespaces.insert(SYSTEM_NAMESPACE.to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_namespace(self, namespace: &str) -> Self {
        self.state.lock().namespaces.insert(namespace.to_string());
        self
    }

    /// Seed an existing table whose regions are cut at `split_keys`.
    pub fn with_table(
        self,
        descriptor: TableDescriptor,
        split_keys: &[&[u8]],
        state: TableState,
    ) -> Self {
        {
            let mut guard = self.state.lock();
            let split_keys: Vec<Vec<u8>> = split_keys.iter().map(|k| k.to_vec()).collect();
            let regions = region_boundaries(&descriptor.name, &split_keys, ProcedureId(0));
            let region_state = match state {
                TableState::Enabled | TableState::Enabling => RegionState::Open,
                TableState::Disabled | TableState::Disabling => RegionState::Closed,
            };
            for info in regions {
                guard.region_layouts.insert(info.id.clone());
                guard.regions.insert(
                    info.id.clone(),
                    RegionMeta {
                        info,
                        state: region_state,
                    },
                );
            }
            guard.table_layouts.insert(descriptor.name.clone());
            guard
                .namespaces
                .insert(descriptor.name.namespace.clone());
            guard
                .tables
                .insert(descriptor.name.clone(), TableRecord { descriptor, state });
        }
        self
    }

    /// Fail the next `times` invocations of the named action with `error`.
    pub fn inject_failure(&self, action: &'static str, error: ActionError, times: u32) {
        self.state.lock().failures.push(InjectedFailure {
            action,
            error,
            remaining: times,
        });
    }

    /// Hold every invocation of the named action until the returned handle is released.
    pub fn gate(&self, action: &'static str) -> GateHandle {
        let (entered, _) = watch::channel(false);
        let (open, _) = watch::channel(false);
        let gate = Gate { entered, open };
        self.state.lock().gates.insert(action, gate.clone());
        GateHandle { gate }
    }

    /// Successfully applied actions, in order
    pub fn actions(&self) -> Vec<ClusterAction> {
        self.state.lock().applied.clone()
    }

    pub fn action_names(&self) -> Vec<&'static str> {
        self.state.lock().applied.iter().map(|a| a.name()).collect()
    }

    /// Invocations of the named action, failed ones included
    pub fn attempts(&self, action: &str) -> u32 {
        self.state.lock().attempts.get(action).copied().unwrap_or(0)
    }

    pub fn table_state(&self, table: &TableName) -> Option<TableState> {
        self.state.lock().tables.get(table).map(|t| t.state)
    }

    pub fn region_state(&self, region: &RegionId) -> Option<RegionState> {
        self.state.lock().regions.get(region).map(|r| r.state)
    }

    pub fn has_table_layout(&self, table: &TableName) -> bool {
        self.state.lock().table_layouts.contains(table)
    }

    pub fn has_region_layout(&self, region: &RegionId) -> bool {
        self.state.lock().region_layouts.contains(region)
    }

    /// Live regions of a table, by start key
    pub fn live_regions(&self, table: &TableName) -> Vec<RegionInfo> {
        live_regions(&self.state.lock(), table)
    }

    fn take_injected_failure(state: &mut ClusterState, name: &'static str) -> Option<ActionError> {
        let failure = state
            .failures
            .iter_mut()
            .find(|f| f.action == name && f.remaining > 0)?;
        failure.remaining -= 1;
        Some(failure.error.clone())
    }
}

fn live_regions(state: &ClusterState, table: &TableName) -> Vec<RegionInfo> {
    let mut regions: Vec<RegionInfo> = state
        .regions
        .values()
        .filter(|r| &r.info.table == table)
        .filter(|r| matches!(r.state, RegionState::Open | RegionState::Closed))
        .map(|r| r.info.clone())
        .collect();
    regions.sort_by(|a, b| a.start_key.cmp(&b.start_key));
    regions
}

fn missing(action: &ClusterAction, what: impl std::fmt::Display) -> ActionError {
    ActionError::fatal(action.name(), format!("{} does not exist", what))
}

fn apply(state: &mut ClusterState, action: &ClusterAction) -> Result<(), ActionError> {
    match action {
        ClusterAction::CreateNamespace { namespace } => {
            state.namespaces.insert(namespace.clone());
        }
        ClusterAction::DeleteNamespace { namespace } => {
            state.namespaces.remove(namespace);
        }
        ClusterAction::CreateTableLayout { descriptor, regions } => {
            state.table_layouts.insert(descriptor.name.clone());
            state.region_layouts.extend(regions.iter().map(|r| r.id.clone()));
        }
        ClusterAction::DeleteTableLayout { table } => {
            state.table_layouts.remove(table);
            // region ids are prefixed with their table name
            let prefix = format!("{},", table);
            state.region_layouts.retain(|id| !id.0.starts_with(&prefix));
        }
        ClusterAction::AddTableToMeta { descriptor, regions } => {
            state
                .tables
                .entry(descriptor.name.clone())
                .or_insert_with(|| TableRecord {
                    descriptor: descriptor.clone(),
                    state: TableState::Enabling,
                });
            for info in regions {
                state.regions.entry(info.id.clone()).or_insert_with(|| RegionMeta {
                    info: info.clone(),
                    state: RegionState::Closed,
                });
            }
        }
        ClusterAction::RemoveTableFromMeta { table } => {
            state.tables.remove(table);
            state.regions.retain(|_, r| &r.info.table != table);
        }
        ClusterAction::SetTableState { table, state: table_state } => {
            let record = state.tables.get_mut(table).ok_or_else(|| missing(action, table))?;
            record.state = *table_state;
        }
        ClusterAction::UpdateTableDescriptor { descriptor } => {
            let record = state
                .tables
                .get_mut(&descriptor.name)
                .ok_or_else(|| missing(action, &descriptor.name))?;
            record.descriptor = descriptor.clone();
        }
        ClusterAction::AssignRegions { regions } | ClusterAction::UnassignRegions { regions } => {
            let target = match action {
                ClusterAction::AssignRegions { .. } => RegionState::Open,
                _ => RegionState::Closed,
            };
            for id in regions {
                let region = state.regions.get_mut(id).ok_or_else(|| missing(action, id))?;
                if matches!(region.state, RegionState::Split | RegionState::Merged) {
                    return Err(ActionError::fatal(
                        action.name(),
                        format!("region {} is offline for good", id),
                    ));
                }
                region.state = target;
            }
        }
        ClusterAction::ReopenRegion { region } => {
            let meta = state.regions.get(region).ok_or_else(|| missing(action, region))?;
            if meta.state != RegionState::Open {
                return Err(ActionError::fatal(
                    action.name(),
                    format!("region {} is not open", region),
                ));
            }
        }
        ClusterAction::CreateDaughterLayout { daughters, .. } => {
            state.region_layouts.extend(daughters.iter().map(|d| d.id.clone()));
        }
        ClusterAction::DeleteDaughterLayout { daughters } => {
            for id in daughters {
                state.region_layouts.remove(id);
            }
        }
        ClusterAction::CommitSplit { parent, daughters } => {
            let meta = state.regions.get_mut(parent).ok_or_else(|| missing(action, parent))?;
            meta.state = RegionState::Split;
            for info in daughters {
                state.regions.entry(info.id.clone()).or_insert_with(|| RegionMeta {
                    info: info.clone(),
                    state: RegionState::Closed,
                });
            }
        }
        ClusterAction::CreateMergedLayout { merged } => {
            state.region_layouts.insert(merged.id.clone());
        }
        ClusterAction::DeleteMergedLayout { merged } => {
            state.region_layouts.remove(merged);
        }
        ClusterAction::CommitMerge { parents, merged } => {
            for id in parents {
                let meta = state.regions.get_mut(id).ok_or_else(|| missing(action, id))?;
                meta.state = RegionState::Merged;
            }
            state.regions.entry(merged.id.clone()).or_insert_with(|| RegionMeta {
                info: merged.clone(),
                state: RegionState::Closed,
            });
        }
        ClusterAction::AddPeer { peer_id, config, enabled } => {
            state.peers.entry(peer_id.clone()).or_insert_with(|| PeerMeta {
                config: config.clone(),
                enabled: *enabled,
                sync_state: if config.sync_replication {
                    SyncReplicationState::DowngradeActive
                } else {
                    SyncReplicationState::None
                },
            });
        }
        ClusterAction::RemovePeer { peer_id } => {
            state.peers.remove(peer_id);
        }
        ClusterAction::SetPeerEnabled { peer_id, enabled } => {
            let peer = state.peers.get_mut(peer_id).ok_or_else(|| missing(action, peer_id))?;
            peer.enabled = *enabled;
        }
        ClusterAction::UpdatePeerConfig { peer_id, config } => {
            let peer = state.peers.get_mut(peer_id).ok_or_else(|| missing(action, peer_id))?;
            peer.config = config.clone();
        }
        ClusterAction::SetPeerSyncState { peer_id, state: sync_state } => {
            let peer = state.peers.get_mut(peer_id).ok_or_else(|| missing(action, peer_id))?;
            peer.sync_state = *sync_state;
        }
        ClusterAction::RefreshPeer { peer_id } => {
            if !state.peers.contains_key(peer_id) {
                // refreshing a removed peer tells the servers to drop it
                debug!(peer_id = %peer_id, "refreshing removed peer");
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ClusterEnv for MemoryCluster {
    async fn perform(&self, action: &ClusterAction) -> Result<(), ActionError> {
        let name = action.name();
        let gate = {
            let mut state = self.state.lock();
            *state.attempts.entry(name).or_default() += 1;
            state.gates.get(name).cloned()
        };
        if let Some(gate) = gate {
            gate.entered.send_replace(true);
            let mut open = gate.open.subscribe();
            let _ = open.wait_for(|open| *open).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = Self::take_injected_failure(&mut state, name) {
            debug!(action = name, error = %error, "injected failure");
            return Err(error);
        }
        apply(&mut state, action)?;
        state.applied.push(action.clone());
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ActionError> {
        Ok(self.state.lock().namespaces.contains(namespace))
    }

    async fn tables_in_namespace(&self, namespace: &str) -> Result<Vec<TableName>, ActionError> {
        Ok(self
            .state
            .lock()
            .tables
            .keys()
            .filter(|t| t.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn table(&self, table: &TableName) -> Result<Option<TableMeta>, ActionError> {
        let state = self.state.lock();
        Ok(state.tables.get(table).map(|record| TableMeta {
            descriptor: record.descriptor.clone(),
            state: record.state,
            regions: live_regions(&state, table),
        }))
    }

    async fn region(&self, region: &RegionId) -> Result<Option<RegionMeta>, ActionError> {
        Ok(self.state.lock().regions.get(region).cloned())
    }

    async fn peer(&self, peer_id: &str) -> Result<Option<PeerMeta>, ActionError> {
        Ok(self.state.lock().peers.get(peer_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnFamilyDescriptor;
    use pretty_assertions::assert_eq;

    fn descriptor(name: &str) -> TableDescriptor {
        TableDescriptor::new(TableName::parse(name)).with_family(ColumnFamilyDescriptor::new("cf"))
    }

    #[tokio::test]
    async fn test_actions_are_idempotent() {
        let cluster = MemoryCluster::new();
        let desc = descriptor("t1");
        let regions = region_boundaries(&desc.name, &[], ProcedureId(1));
        let add = ClusterAction::AddTableToMeta {
            descriptor: desc.clone(),
            regions: regions.clone(),
        };
        cluster.perform(&add).await.unwrap();
        cluster.perform(&add).await.unwrap();

        let assign = ClusterAction::AssignRegions {
            regions: vec![regions[0].id.clone()],
        };
        cluster.perform(&assign).await.unwrap();
        cluster.perform(&assign).await.unwrap();

        let meta = cluster.table(&desc.name).await.unwrap().unwrap();
        assert_eq!(meta.state, TableState::Enabling);
        assert_eq!(meta.regions.len(), 1);
        assert_eq!(cluster.region_state(&regions[0].id), Some(RegionState::Open));
        assert_eq!(cluster.action_names().len(), 4);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let cluster = MemoryCluster::new();
        let busy = ActionError::transient("create-namespace", "busy");
        cluster.inject_failure("create-namespace", busy, 2);
        let action = ClusterAction::CreateNamespace {
            namespace: "ns1".into(),
        };
        assert!(cluster.perform(&action).await.unwrap_err().is_transient());
        assert!(cluster.perform(&action).await.is_err());
        cluster.perform(&action).await.unwrap();
        assert_eq!(cluster.attempts("create-namespace"), 3);
        assert!(cluster.namespace_exists("ns1").await.unwrap());
    }

    #[tokio::test]
    async fn test_split_commit_retires_parent() {
        let cluster = MemoryCluster::new().with_table(descriptor("t1"), &[], TableState::Enabled);
        let table = TableName::parse("t1");
        let parent = cluster.live_regions(&table).remove(0);
        let daughters = vec![
            RegionInfo::new(&table, vec![], b"k".to_vec(), ProcedureId(9), 0),
            RegionInfo::new(&table, b"k".to_vec(), vec![], ProcedureId(9), 1),
        ];
        cluster
            .perform(&ClusterAction::CommitSplit {
                parent: parent.id.clone(),
                daughters: daughters.clone(),
            })
            .await
            .unwrap();

        assert_eq!(cluster.region_state(&parent.id), Some(RegionState::Split));
        assert_eq!(cluster.live_regions(&table), daughters);
        let reassign = ClusterAction::AssignRegions {
            regions: vec![parent.id.clone()],
        };
        assert!(!cluster.perform(&reassign).await.unwrap_err().is_transient());
    }
}
