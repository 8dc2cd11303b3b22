//! Typed administrative operations on top of the executor.
//!
//! Every operation validates its request against cluster metadata before a
//! procedure exists. The validation runs inside the nonce build, so a rejected
//! request persists nothing and records no nonce mapping; a retry with the same
//! nonce after a successful submission returns the original procedure without
//! validating again.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::env::{ClusterEnv, PeerMeta, TableMeta};
use crate::error::{ProcedureError, Result};
use crate::event::{ProcedureEvent, MASTER_INITIALIZED};
use crate::executor::ProcedureExecutor;
use crate::lock::LockedResourceSummary;
use crate::model::{
    ColumnFamilyDescriptor, NonceKey, PeerConfig, ProcedureId, ProcedureSummary, RegionId,
    RegionInfo, RegionState, SyncReplicationState, TableDescriptor, TableName, TableState,
    DEFAULT_NAMESPACE, SYSTEM_NAMESPACE,
};
use crate::procedure::{
    AddPeer, CreateNamespace, CreateTable, DeleteNamespace, DeleteTable, DisableTable, EnableTable,
    MergeRegions, ModifyTable, ProcedureSpec, RemovePeer, SetPeerState, SplitRegion,
    TransitPeerSyncReplicationState, TruncateTable, UpdatePeerConfig,
};

/// Region topology switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchType {
    Split,
    Merge,
}

/// The master's inbound surface: one method per administrative operation.
pub struct MasterServices {
    executor: Arc<ProcedureExecutor>,
    env: Arc<dyn ClusterEnv>,
    split_enabled: AtomicBool,
    merge_enabled: AtomicBool,
    maintenance_mode: AtomicBool,
}

impl MasterServices {
    pub fn new(executor: Arc<ProcedureExecutor>, env: Arc<dyn ClusterEnv>) -> Self {
        Self {
            executor,
            env,
            split_enabled: AtomicBool::new(true),
            merge_enabled: AtomicBool::new(true),
            maintenance_mode: AtomicBool::new(false),
        }
    }

    pub fn executor(&self) -> &Arc<ProcedureExecutor> {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Initialization and switches

    pub fn initialized_event(&self) -> Arc<ProcedureEvent> {
        self.executor.event(MASTER_INITIALIZED)
    }

    /// Whether the master accepts table and namespace work
    pub fn is_initialized(&self) -> bool {
        self.initialized_event().is_ready()
    }

    /// Trip the initialized event, resuming procedures parked on it.
    pub fn mark_initialized(&self) {
        let resumed = self.initialized_event().wake();
        info!(resumed = resumed.len(), "master initialized");
    }

    pub fn is_split_or_merge_enabled(&self, switch: SwitchType) -> bool {
        match switch {
            SwitchType::Split => self.split_enabled.load(Ordering::Acquire),
            SwitchType::Merge => self.merge_enabled.load(Ordering::Acquire),
        }
    }

    /// Flip a switch, returning its previous value.
    pub fn set_split_or_merge_enabled(&self, switch: SwitchType, enabled: bool) -> bool {
        let flag = match switch {
            SwitchType::Split => &self.split_enabled,
            SwitchType::Merge => &self.merge_enabled,
        };
        let previous = flag.swap(enabled, Ordering::AcqRel);
        info!(?switch, enabled, previous, "region topology switch changed");
        previous
    }

    pub fn is_in_maintenance_mode(&self) -> bool {
        self.maintenance_mode.load(Ordering::Acquire)
    }

    pub fn set_maintenance_mode(&self, on: bool) {
        self.maintenance_mode.store(on, Ordering::Release);
        info!(on, "maintenance mode changed");
    }

    /// Whether a region topology action must be turned away right now.
    pub fn skip_region_management_action(&self, action: &str) -> bool {
        if !self.is_initialized() {
            debug!(action, "master not initialized, skipping region action");
            return true;
        }
        if self.is_in_maintenance_mode() {
            info!(action, "maintenance mode, skipping region action");
            return true;
        }
        false
    }

    // -----------------------------------------------------------------------
    // Generic procedure access

    pub async fn submit_procedure(
        &self,
        spec: ProcedureSpec,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor.submit(spec, NonceKey::new(nonce_group, nonce)).await
    }

    /// See [`ProcedureExecutor::abort`]: `true` on a running procedure only means
    /// the abort was requested.
    pub async fn abort_procedure(&self, proc_id: ProcedureId, may_interrupt: bool) -> Result<bool> {
        self.executor.abort(proc_id, may_interrupt).await
    }

    pub fn list_procedures(&self) -> Vec<ProcedureSummary> {
        self.executor.list()
    }

    pub fn get_procedure(&self, proc_id: ProcedureId) -> Option<ProcedureSummary> {
        self.executor.get(proc_id)
    }

    pub fn list_locks(&self) -> Vec<LockedResourceSummary> {
        self.executor.locks()
    }

    pub async fn wait_for_procedure(
        &self,
        proc_id: ProcedureId,
        timeout: Duration,
    ) -> Result<ProcedureSummary> {
        self.executor.wait_for_completion_timeout(proc_id, timeout).await
    }

    /// Tables in `namespace`
    pub async fn list_table_names_by_namespace(&self, namespace: &str) -> Result<Vec<TableName>> {
        if !self.env.namespace_exists(namespace).await? {
            return Err(ProcedureError::NamespaceNotFound {
                namespace: namespace.to_string(),
            });
        }
        Ok(self.env.tables_in_namespace(namespace).await?)
    }

    // -----------------------------------------------------------------------
    // Tables

    /// Check the table exists and is offline.
    pub async fn check_table_modifiable(&self, table: &TableName) -> Result<()> {
        let meta = self.existing_table(table).await?;
        expect_state(table, &meta, TableState::Disabled)
    }

    pub async fn create_table(
        &self,
        descriptor: TableDescriptor,
        split_keys: Option<Vec<Vec<u8>>>,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                validate_descriptor(&descriptor)?;
                if let Some(keys) = &split_keys {
                    validate_split_keys(keys)?;
                }
                let name = &descriptor.name;
                if !self.env.namespace_exists(&name.namespace).await? {
                    return Err(ProcedureError::NamespaceNotFound {
                        namespace: name.namespace.clone(),
                    });
                }
                if self.env.table(name).await?.is_some() {
                    return Err(ProcedureError::TableExists { table: name.clone() });
                }
                Ok(ProcedureSpec::CreateTable(CreateTable::new(descriptor, split_keys)))
            })
            .await
    }

    pub async fn delete_table(
        &self,
        table: TableName,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                self.check_table_modifiable(&table).await?;
                Ok(ProcedureSpec::DeleteTable(DeleteTable::new(table)))
            })
            .await
    }

    pub async fn truncate_table(
        &self,
        table: TableName,
        preserve_splits: bool,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                self.check_table_modifiable(&table).await?;
                Ok(ProcedureSpec::TruncateTable(TruncateTable::new(table, preserve_splits)))
            })
            .await
    }

    pub async fn modify_table(
        &self,
        table: TableName,
        descriptor: TableDescriptor,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                if descriptor.name != table {
                    return Err(ProcedureError::invalid(format!(
                        "descriptor names {} but the request modifies {}",
                        descriptor.name, table
                    )));
                }
                validate_descriptor(&descriptor)?;
                let meta = self.existing_table(&table).await?;
                expect_settled(&table, &meta)?;
                Ok(ProcedureSpec::ModifyTable(ModifyTable::new(descriptor)))
            })
            .await
    }

    pub async fn enable_table(
        &self,
        table: TableName,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                let meta = self.existing_table(&table).await?;
                expect_state(&table, &meta, TableState::Disabled)?;
                Ok(ProcedureSpec::EnableTable(EnableTable::new(table)))
            })
            .await
    }

    pub async fn disable_table(
        &self,
        table: TableName,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                if table.is_system() {
                    return Err(ProcedureError::invalid(format!(
                        "system table {} cannot be disabled",
                        table
                    )));
                }
                let meta = self.existing_table(&table).await?;
                expect_state(&table, &meta, TableState::Enabled)?;
                Ok(ProcedureSpec::DisableTable(DisableTable::new(table)))
            })
            .await
    }

    pub async fn add_column(
        &self,
        table: TableName,
        family: ColumnFamilyDescriptor,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                let meta = self.existing_table(&table).await?;
                expect_settled(&table, &meta)?;
                if meta.descriptor.families.contains_key(&family.name) {
                    return Err(ProcedureError::invalid(format!(
                        "column family {} already exists in {}",
                        family.name, table
                    )));
                }
                let descriptor = meta.descriptor.with_family(family);
                validate_descriptor(&descriptor)?;
                Ok(ProcedureSpec::ModifyTable(ModifyTable::new(descriptor)))
            })
            .await
    }

    pub async fn modify_column(
        &self,
        table: TableName,
        family: ColumnFamilyDescriptor,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                let meta = self.existing_table(&table).await?;
                expect_settled(&table, &meta)?;
                if !meta.descriptor.families.contains_key(&family.name) {
                    return Err(missing_family(&table, &family.name));
                }
                let descriptor = meta.descriptor.with_family(family);
                Ok(ProcedureSpec::ModifyTable(ModifyTable::new(descriptor)))
            })
            .await
    }

    pub async fn delete_column(
        &self,
        table: TableName,
        family: &str,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                let meta = self.existing_table(&table).await?;
                expect_settled(&table, &meta)?;
                let mut descriptor = meta.descriptor;
                if descriptor.families.remove(family).is_none() {
                    return Err(missing_family(&table, family));
                }
                if descriptor.families.is_empty() {
                    return Err(ProcedureError::invalid(format!(
                        "cannot delete {}, the only column family of {}",
                        family, table
                    )));
                }
                Ok(ProcedureSpec::ModifyTable(ModifyTable::new(descriptor)))
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Regions

    pub async fn split_region(
        &self,
        region: RegionId,
        split_row: Vec<u8>,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                self.check_region_switch(SwitchType::Split, "split")?;
                let info = self.open_region(&region).await?;
                if !info.is_valid_split_row(&split_row) {
                    return Err(ProcedureError::invalid(format!(
                        "split row is outside of region {} or on its boundary",
                        region
                    )));
                }
                Ok(ProcedureSpec::SplitRegion(SplitRegion::new(info.table, region, split_row)))
            })
            .await
    }

    /// Merge `regions` into one. Non-adjacent regions are only merged when `forcible`.
    pub async fn merge_regions(
        &self,
        regions: Vec<RegionId>,
        forcible: bool,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                self.check_region_switch(SwitchType::Merge, "merge")?;
                if regions.len() < 2 {
                    return Err(ProcedureError::invalid("a merge needs at least two regions"));
                }
                let distinct: BTreeSet<&RegionId> = regions.iter().collect();
                if distinct.len() != regions.len() {
                    return Err(ProcedureError::invalid("cannot merge a region with itself"));
                }

                let mut infos = Vec::with_capacity(regions.len());
                for region in &regions {
                    infos.push(self.open_region(region).await?);
                }
                let table = infos[0].table.clone();
                if infos.iter().any(|r| r.table != table) {
                    return Err(ProcedureError::invalid("cannot merge regions of different tables"));
                }
                infos.sort_by(|a, b| a.start_key.cmp(&b.start_key));
                if !forcible {
                    let gap = infos.windows(2).find(|pair| pair[0].end_key != pair[1].start_key);
                    if let Some(pair) = gap {
                        return Err(ProcedureError::invalid(format!(
                            "regions {} and {} are not adjacent",
                            pair[0].id, pair[1].id
                        )));
                    }
                }
                Ok(ProcedureSpec::MergeRegions(MergeRegions::new(table, regions, forcible)))
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Namespaces

    pub async fn create_namespace(
        &self,
        namespace: String,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                validate_name("namespace", &namespace)?;
                if self.env.namespace_exists(&namespace).await? {
                    return Err(ProcedureError::NamespaceExists { namespace });
                }
                Ok(ProcedureSpec::CreateNamespace(CreateNamespace::new(namespace)))
            })
            .await
    }

    pub async fn delete_namespace(
        &self,
        namespace: String,
        nonce_group: u64,
        nonce: u64,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(NonceKey::new(nonce_group, nonce), move || async move {
                if namespace == DEFAULT_NAMESPACE || namespace == SYSTEM_NAMESPACE {
                    return Err(ProcedureError::invalid(format!(
                        "namespace {} is reserved",
                        namespace
                    )));
                }
                if !self.env.namespace_exists(&namespace).await? {
                    return Err(ProcedureError::NamespaceNotFound { namespace });
                }
                let tables = self.env.tables_in_namespace(&namespace).await?;
                if !tables.is_empty() {
                    return Err(ProcedureError::NamespaceNotEmpty {
                        namespace,
                        tables: tables.len(),
                    });
                }
                Ok(ProcedureSpec::DeleteNamespace(DeleteNamespace::new(namespace)))
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Replication peers. Peer operations carry no nonce.

    pub async fn add_replication_peer(
        &self,
        peer_id: &str,
        config: PeerConfig,
        enabled: bool,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(None, move || async move {
                validate_name("peer id", peer_id)?;
                if config.cluster_key.is_empty() {
                    return Err(ProcedureError::invalid("peer cluster key must not be empty"));
                }
                if self.env.peer(peer_id).await?.is_some() {
                    return Err(ProcedureError::PeerExists {
                        peer_id: peer_id.to_string(),
                    });
                }
                let add = AddPeer::new(peer_id, config);
                Ok(ProcedureSpec::AddPeer(if enabled { add } else { add.disabled() }))
            })
            .await
    }

    pub async fn remove_replication_peer(&self, peer_id: &str) -> Result<ProcedureId> {
        self.executor
            .submit_with(None, move || async move {
                self.existing_peer(peer_id).await?;
                Ok(ProcedureSpec::RemovePeer(RemovePeer::new(peer_id)))
            })
            .await
    }

    pub async fn enable_replication_peer(&self, peer_id: &str) -> Result<ProcedureId> {
        self.set_peer_state(peer_id, true).await
    }

    pub async fn disable_replication_peer(&self, peer_id: &str) -> Result<ProcedureId> {
        self.set_peer_state(peer_id, false).await
    }

    async fn set_peer_state(&self, peer_id: &str, enabled: bool) -> Result<ProcedureId> {
        self.executor
            .submit_with(None, move || async move {
                self.existing_peer(peer_id).await?;
                Ok(ProcedureSpec::SetPeerState(SetPeerState::new(peer_id, enabled)))
            })
            .await
    }

    pub async fn update_replication_peer_config(
        &self,
        peer_id: &str,
        config: PeerConfig,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(None, move || async move {
                let peer = self.existing_peer(peer_id).await?;
                if peer.config.sync_replication != config.sync_replication {
                    return Err(ProcedureError::invalid(format!(
                        "cannot switch sync replication of peer {} by updating its config",
                        peer_id
                    )));
                }
                Ok(ProcedureSpec::UpdatePeerConfig(UpdatePeerConfig::new(peer_id, config)))
            })
            .await
    }

    pub async fn transit_replication_peer_sync_replication_state(
        &self,
        peer_id: &str,
        target: SyncReplicationState,
    ) -> Result<ProcedureId> {
        self.executor
            .submit_with(None, move || async move {
                let peer = self.existing_peer(peer_id).await?;
                if !peer.config.sync_replication {
                    return Err(ProcedureError::invalid(format!(
                        "peer {} is not a sync replication peer",
                        peer_id
                    )));
                }
                if !peer.sync_state.can_transit_to(target) {
                    return Err(ProcedureError::invalid(format!(
                        "peer {} cannot go from {:?} to {:?}",
                        peer_id, peer.sync_state, target
                    )));
                }
                Ok(ProcedureSpec::TransitPeerSyncReplicationState(
                    TransitPeerSyncReplicationState::new(peer_id, target),
                ))
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Lookups

    async fn existing_table(&self, table: &TableName) -> Result<TableMeta> {
        self.env
            .table(table)
            .await?
            .ok_or_else(|| ProcedureError::TableNotFound { table: table.clone() })
    }

    async fn open_region(&self, region: &RegionId) -> Result<RegionInfo> {
        let meta = self
            .env
            .region(region)
            .await?
            .ok_or_else(|| ProcedureError::RegionNotFound {
                region: region.to_string(),
            })?;
        if meta.state != RegionState::Open {
            return Err(ProcedureError::invalid(format!(
                "region {} is {:?}, not open",
                region, meta.state
            )));
        }
        Ok(meta.info)
    }

    async fn existing_peer(&self, peer_id: &str) -> Result<PeerMeta> {
        self.env
            .peer(peer_id)
            .await?
            .ok_or_else(|| ProcedureError::PeerNotFound {
                peer_id: peer_id.to_string(),
            })
    }

    fn check_region_switch(&self, switch: SwitchType, action: &str) -> Result<()> {
        if !self.is_split_or_merge_enabled(switch) {
            warn!(?switch, "region {} rejected, switch is off", action);
            return Err(ProcedureError::OperationDisabled(format!("{} switch is off", action)));
        }
        if self.skip_region_management_action(action) {
            return Err(ProcedureError::OperationDisabled(format!(
                "{} is not allowed while the master is initializing or in maintenance",
                action
            )));
        }
        Ok(())
    }
}

fn expect_state(table: &TableName, meta: &TableMeta, expected: TableState) -> Result<()> {
    if meta.state != expected {
        return Err(ProcedureError::TableState {
            table: table.clone(),
            expected,
            actual: meta.state,
        });
    }
    Ok(())
}

/// Enabled or disabled, not halfway through either
fn expect_settled(table: &TableName, meta: &TableMeta) -> Result<()> {
    match meta.state {
        TableState::Enabled | TableState::Disabled => Ok(()),
        state => Err(ProcedureError::invalid(format!(
            "table {} is {:?}, wait for it to settle",
            table, state
        ))),
    }
}

fn missing_family(table: &TableName, family: &str) -> ProcedureError {
    ProcedureError::invalid(format!("column family {} does not exist in {}", family, table))
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProcedureError::invalid(format!("{} must not be empty", what)));
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.')) {
        return Err(ProcedureError::invalid(format!(
            "{} {:?} contains illegal character {:?}",
            what, name, c
        )));
    }
    Ok(())
}

fn validate_descriptor(descriptor: &TableDescriptor) -> Result<()> {
    validate_name("namespace", &descriptor.name.namespace)?;
    validate_name("table name", &descriptor.name.qualifier)?;
    if descriptor.families.is_empty() {
        return Err(ProcedureError::invalid(format!(
            "table {} must have at least one column family",
            descriptor.name
        )));
    }
    for family in descriptor.families.values() {
        validate_name("column family", &family.name)?;
        if family.max_versions == 0 {
            return Err(ProcedureError::invalid(format!(
                "column family {} must keep at least one version",
                family.name
            )));
        }
    }
    Ok(())
}

fn validate_split_keys(keys: &[Vec<u8>]) -> Result<()> {
    if keys.iter().any(|k| k.is_empty()) {
        return Err(ProcedureError::invalid("split keys must not be empty"));
    }
    let distinct: BTreeSet<&Vec<u8>> = keys.iter().collect();
    if distinct.len() != keys.len() {
        return Err(ProcedureError::invalid("split keys must be distinct"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("namespace", "ns_1").is_ok());
        assert!(validate_name("namespace", "").is_err());
        assert!(validate_name("peer id", "a-b").unwrap_err().is_invalid_request());
    }

    #[test]
    fn test_descriptor_needs_a_family() {
        let bare = TableDescriptor::new(TableName::parse("t1"));
        assert!(validate_descriptor(&bare).is_err());
        let with_family = bare.with_family(ColumnFamilyDescriptor::new("cf"));
        assert!(validate_descriptor(&with_family).is_ok());
    }

    #[test]
    fn test_split_keys_must_be_distinct() {
        assert!(validate_split_keys(&[b"b".to_vec(), b"m".to_vec()]).is_ok());
        assert!(validate_split_keys(&[b"b".to_vec(), b"b".to_vec()]).is_err());
        assert!(validate_split_keys(&[Vec::new()]).is_err());
    }
}
