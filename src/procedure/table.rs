use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{ProcedureDef, ProcedureSpec, ReopenRegion, Step, StepContext, StepOutcome, StepResult};
use crate::env::ClusterAction;
use crate::error::ActionError;
use crate::event::MASTER_INITIALIZED;
use crate::lock::{LockRequest, Resource};
use crate::model::{region_boundaries, RegionId, RegionInfo, TableDescriptor, TableName, TableState};

fn table_lock(table: &TableName) -> Vec<LockRequest> {
    vec![LockRequest::exclusive(Resource::Table(table.clone()))]
}

fn region_ids(regions: &[RegionInfo]) -> Vec<RegionId> {
    regions.iter().map(|r| r.id.clone()).collect()
}

/// Require the table to exist in `expected` state, returning its live regions.
async fn expect_table_state(
    ctx: &StepContext,
    table: &TableName,
    expected: TableState,
) -> Result<Result<Vec<RegionInfo>, String>, ActionError> {
    Ok(match ctx.env.table(table).await? {
        None => Err(format!("table {} no longer exists", table)),
        Some(meta) if meta.state != expected => {
            Err(format!("table {} is {:?}, expected {:?}", table, meta.state, expected))
        }
        Some(meta) => Ok(meta.regions),
    })
}

// ---------------------------------------------------------------------------
// CreateTable

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTable {
    pub descriptor: TableDescriptor,
    pub split_keys: Vec<Vec<u8>>,
    /// Computed by the first step
    pub regions: Vec<RegionInfo>,
}

impl CreateTable {
    pub fn new(descriptor: TableDescriptor, split_keys: Option<Vec<Vec<u8>>>) -> Self {
        Self {
            descriptor,
            split_keys: split_keys.unwrap_or_default(),
            regions: Vec::new(),
        }
    }
}

impl ProcedureDef for CreateTable {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", create_prepare),
        Step::new("write-fs-layout", create_layout).with_rollback(create_layout_undo),
        Step::new("add-to-meta", create_add_to_meta).with_rollback(create_add_to_meta_undo),
        Step::new("assign-regions", create_assign).with_rollback(create_assign_undo),
        Step::new("mark-enabled", create_mark_enabled).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        table_lock(&self.descriptor.name)
    }
}

fn create_prepare<'a>(p: &'a mut CreateTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if !ctx.event_ready(MASTER_INITIALIZED) {
            return Ok(StepOutcome::wait_for_event(MASTER_INITIALIZED));
        }
        let name = &p.descriptor.name;
        if !ctx.env.namespace_exists(&name.namespace).await? {
            return ctx.conflict(format!("namespace {} no longer exists", name.namespace));
        }
        if ctx.env.table(name).await?.is_some() {
            return ctx.conflict(format!("table {} already exists", name));
        }
        p.regions = region_boundaries(name, &p.split_keys, ctx.proc_id);
        Ok(StepOutcome::Continue)
    })
}

fn create_layout<'a>(p: &'a mut CreateTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::CreateTableLayout {
            descriptor: p.descriptor.clone(),
            regions: p.regions.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn create_layout_undo<'a>(
    p: &'a mut CreateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::DeleteTableLayout {
            table: p.descriptor.name.clone(),
        })
        .await
    })
}

fn create_add_to_meta<'a>(
    p: &'a mut CreateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AddTableToMeta {
            descriptor: p.descriptor.clone(),
            regions: p.regions.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn create_add_to_meta_undo<'a>(
    p: &'a mut CreateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::RemoveTableFromMeta {
            table: p.descriptor.name.clone(),
        })
        .await
    })
}

fn create_assign<'a>(p: &'a mut CreateTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AssignRegions {
            regions: region_ids(&p.regions),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn create_assign_undo<'a>(
    p: &'a mut CreateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::UnassignRegions {
            regions: region_ids(&p.regions),
        })
        .await
    })
}

fn create_mark_enabled<'a>(
    p: &'a mut CreateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.descriptor.name.clone(),
            state: TableState::Enabled,
        })
        .await?;
        Ok(StepOutcome::Finish(Some(format!(
            "created {} with {} regions",
            p.descriptor.name,
            p.regions.len()
        ))))
    })
}

// ---------------------------------------------------------------------------
// DeleteTable

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTable {
    pub table: TableName,
}

impl DeleteTable {
    pub fn new(table: TableName) -> Self {
        Self { table }
    }
}

impl ProcedureDef for DeleteTable {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", delete_prepare),
        Step::new("remove-from-meta", delete_remove_from_meta).irreversible(),
        Step::new("clear-fs-layout", delete_clear_layout).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        table_lock(&self.table)
    }
}

fn delete_prepare<'a>(p: &'a mut DeleteTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        match expect_table_state(ctx, &p.table, TableState::Disabled).await? {
            Ok(_) => Ok(StepOutcome::Continue),
            Err(conflict) => ctx.conflict(conflict),
        }
    })
}

fn delete_remove_from_meta<'a>(
    p: &'a mut DeleteTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::RemoveTableFromMeta { table: p.table.clone() })
            .await?;
        Ok(StepOutcome::Continue)
    })
}

fn delete_clear_layout<'a>(
    p: &'a mut DeleteTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::DeleteTableLayout { table: p.table.clone() })
            .await?;
        Ok(StepOutcome::Finish(Some(format!("deleted {}", p.table))))
    })
}

// ---------------------------------------------------------------------------
// TruncateTable

/// Drop every row of a disabled table by recreating it empty; the table comes
/// back enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncateTable {
    pub table: TableName,
    pub preserve_splits: bool,
    pub descriptor: Option<TableDescriptor>,
    pub regions: Vec<RegionInfo>,
}

impl TruncateTable {
    pub fn new(table: TableName, preserve_splits: bool) -> Self {
        Self {
            table,
            preserve_splits,
            descriptor: None,
            regions: Vec::new(),
        }
    }

    fn descriptor(&self) -> Result<TableDescriptor, ActionError> {
        self.descriptor
            .clone()
            .ok_or_else(|| ActionError::fatal("truncate-table", "descriptor was not captured"))
    }
}

impl ProcedureDef for TruncateTable {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", truncate_prepare),
        Step::new("remove-from-meta", truncate_remove_from_meta).irreversible(),
        Step::new("clear-fs-layout", truncate_clear_layout).irreversible(),
        Step::new("create-fs-layout", truncate_create_layout).irreversible(),
        Step::new("add-to-meta", truncate_add_to_meta).irreversible(),
        Step::new("assign-regions", truncate_assign).irreversible(),
        Step::new("mark-enabled", truncate_mark_enabled).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        table_lock(&self.table)
    }
}

fn truncate_prepare<'a>(
    p: &'a mut TruncateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let Some(meta) = ctx.env.table(&p.table).await? else {
            return ctx.conflict(format!("table {} no longer exists", p.table));
        };
        if meta.state != TableState::Disabled {
            return ctx.conflict(format!(
                "table {} is {:?}, expected Disabled",
                p.table, meta.state
            ));
        }
        let split_keys: Vec<Vec<u8>> = if p.preserve_splits {
            meta.regions.iter().map(|r| r.start_key.clone()).collect()
        } else {
            Vec::new()
        };
        p.regions = region_boundaries(&p.table, &split_keys, ctx.proc_id);
        p.descriptor = Some(meta.descriptor);
        Ok(StepOutcome::Continue)
    })
}

fn truncate_remove_from_meta<'a>(
    p: &'a mut TruncateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::RemoveTableFromMeta { table: p.table.clone() })
            .await?;
        Ok(StepOutcome::Continue)
    })
}

fn truncate_clear_layout<'a>(
    p: &'a mut TruncateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::DeleteTableLayout { table: p.table.clone() })
            .await?;
        Ok(StepOutcome::Continue)
    })
}

fn truncate_create_layout<'a>(
    p: &'a mut TruncateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::CreateTableLayout {
            descriptor: p.descriptor()?,
            regions: p.regions.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn truncate_add_to_meta<'a>(
    p: &'a mut TruncateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AddTableToMeta {
            descriptor: p.descriptor()?,
            regions: p.regions.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn truncate_assign<'a>(
    p: &'a mut TruncateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AssignRegions {
            regions: region_ids(&p.regions),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn truncate_mark_enabled<'a>(
    p: &'a mut TruncateTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.table.clone(),
            state: TableState::Enabled,
        })
        .await?;
        Ok(StepOutcome::Finish(Some(format!(
            "truncated {} into {} regions",
            p.table,
            p.regions.len()
        ))))
    })
}

// ---------------------------------------------------------------------------
// ModifyTable

/// Replace a table's descriptor. Column family add/modify/delete are built on this.
/// Regions of an enabled table are reopened by child procedures so they pick up
/// the new schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyTable {
    pub descriptor: TableDescriptor,
    pub previous: Option<TableDescriptor>,
    pub reopen_regions: bool,
}

impl ModifyTable {
    pub fn new(descriptor: TableDescriptor) -> Self {
        Self {
            descriptor,
            previous: None,
            reopen_regions: false,
        }
    }
}

impl ProcedureDef for ModifyTable {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", modify_prepare),
        Step::new("update-descriptor", modify_update).with_rollback(modify_update_undo),
        Step::new("reopen-regions", modify_reopen).irreversible(),
        Step::new("post-operation", modify_post).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        table_lock(&self.descriptor.name)
    }
}

fn modify_prepare<'a>(p: &'a mut ModifyTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let name = &p.descriptor.name;
        let Some(meta) = ctx.env.table(name).await? else {
            return ctx.conflict(format!("table {} no longer exists", name));
        };
        if !matches!(meta.state, TableState::Enabled | TableState::Disabled) {
            return ctx.conflict(format!("table {} is {:?}", name, meta.state));
        }
        p.reopen_regions = meta.state == TableState::Enabled;
        p.previous = Some(meta.descriptor);
        Ok(StepOutcome::Continue)
    })
}

fn modify_update<'a>(p: &'a mut ModifyTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::UpdateTableDescriptor {
            descriptor: p.descriptor.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn modify_update_undo<'a>(
    p: &'a mut ModifyTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        let Some(previous) = p.previous.clone() else {
            return Ok(());
        };
        ctx.perform(ClusterAction::UpdateTableDescriptor { descriptor: previous })
            .await
    })
}

fn modify_reopen<'a>(p: &'a mut ModifyTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if !p.reopen_regions {
            return Ok(StepOutcome::Continue);
        }
        let regions = match ctx.env.table(&p.descriptor.name).await? {
            Some(meta) => meta.regions,
            None => Vec::new(),
        };
        if regions.is_empty() {
            return Ok(StepOutcome::Continue);
        }
        let children = regions
            .iter()
            .map(|r| ProcedureSpec::ReopenRegion(ReopenRegion::new(r.table.clone(), r.id.clone())))
            .collect();
        Ok(StepOutcome::SpawnChildren(children))
    })
}

fn modify_post<'a>(p: &'a mut ModifyTable, _ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        Ok(StepOutcome::Finish(Some(format!(
            "modified {} ({} families)",
            p.descriptor.name,
            p.descriptor.families.len()
        ))))
    })
}

// ---------------------------------------------------------------------------
// EnableTable / DisableTable

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableTable {
    pub table: TableName,
    pub regions: Vec<RegionId>,
}

impl EnableTable {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            regions: Vec::new(),
        }
    }
}

impl ProcedureDef for EnableTable {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", enable_prepare),
        Step::new("mark-enabling", enable_mark_enabling).with_rollback(enable_mark_enabling_undo),
        Step::new("assign-regions", enable_assign).with_rollback(enable_assign_undo),
        Step::new("mark-enabled", enable_mark_enabled).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        table_lock(&self.table)
    }
}

fn enable_prepare<'a>(p: &'a mut EnableTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        match expect_table_state(ctx, &p.table, TableState::Disabled).await? {
            Ok(regions) => {
                p.regions = region_ids(&regions);
                Ok(StepOutcome::Continue)
            }
            Err(conflict) => ctx.conflict(conflict),
        }
    })
}

fn enable_mark_enabling<'a>(
    p: &'a mut EnableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.table.clone(),
            state: TableState::Enabling,
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn enable_mark_enabling_undo<'a>(
    p: &'a mut EnableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.table.clone(),
            state: TableState::Disabled,
        })
        .await
    })
}

fn enable_assign<'a>(p: &'a mut EnableTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AssignRegions {
            regions: p.regions.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn enable_assign_undo<'a>(
    p: &'a mut EnableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::UnassignRegions {
            regions: p.regions.clone(),
        })
        .await
    })
}

fn enable_mark_enabled<'a>(
    p: &'a mut EnableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.table.clone(),
            state: TableState::Enabled,
        })
        .await?;
        Ok(StepOutcome::Finish(Some(format!("enabled {}", p.table))))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisableTable {
    pub table: TableName,
    pub regions: Vec<RegionId>,
}

impl DisableTable {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            regions: Vec::new(),
        }
    }
}

impl ProcedureDef for DisableTable {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", disable_prepare),
        Step::new("mark-disabling", disable_mark_disabling)
            .with_rollback(disable_mark_disabling_undo),
        Step::new("unassign-regions", disable_unassign).with_rollback(disable_unassign_undo),
        Step::new("mark-disabled", disable_mark_disabled).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        table_lock(&self.table)
    }
}

fn disable_prepare<'a>(p: &'a mut DisableTable, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        match expect_table_state(ctx, &p.table, TableState::Enabled).await? {
            Ok(regions) => {
                p.regions = region_ids(&regions);
                Ok(StepOutcome::Continue)
            }
            Err(conflict) => ctx.conflict(conflict),
        }
    })
}

fn disable_mark_disabling<'a>(
    p: &'a mut DisableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.table.clone(),
            state: TableState::Disabling,
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn disable_mark_disabling_undo<'a>(
    p: &'a mut DisableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.table.clone(),
            state: TableState::Enabled,
        })
        .await
    })
}

fn disable_unassign<'a>(
    p: &'a mut DisableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::UnassignRegions {
            regions: p.regions.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn disable_unassign_undo<'a>(
    p: &'a mut DisableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AssignRegions {
            regions: p.regions.clone(),
        })
        .await
    })
}

fn disable_mark_disabled<'a>(
    p: &'a mut DisableTable,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetTableState {
            table: p.table.clone(),
            state: TableState::Disabled,
        })
        .await?;
        Ok(StepOutcome::Finish(Some(format!("disabled {}", p.table))))
    })
}
