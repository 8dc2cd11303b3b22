use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{ProcedureDef, Step, StepContext, StepOutcome, StepResult};
use crate::env::ClusterAction;
use crate::error::ActionError;
use crate::lock::{LockRequest, Resource};
use crate::model::{RegionId, RegionInfo, RegionState, TableName};

// ---------------------------------------------------------------------------
// SplitRegion

/// Split one open region at `split_row` into two daughters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRegion {
    pub table: TableName,
    pub parent: RegionId,
    pub split_row: Vec<u8>,
    pub daughters: Vec<RegionInfo>,
}

impl SplitRegion {
    pub fn new(table: TableName, parent: RegionId, split_row: Vec<u8>) -> Self {
        Self {
            table,
            parent,
            split_row,
            daughters: Vec::new(),
        }
    }

    fn daughter_ids(&self) -> Vec<RegionId> {
        self.daughters.iter().map(|d| d.id.clone()).collect()
    }
}

impl ProcedureDef for SplitRegion {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", split_prepare),
        Step::new("close-parent", split_close_parent).with_rollback(split_close_parent_undo),
        Step::new("create-daughters", split_create_daughters)
            .with_rollback(split_create_daughters_undo),
        Step::new("update-meta", split_commit).irreversible(),
        Step::new("open-daughters", split_open_daughters).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        vec![LockRequest::exclusive(Resource::region(&self.table, &self.parent))]
    }
}

fn split_prepare<'a>(p: &'a mut SplitRegion, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let parent = match ctx.env.region(&p.parent).await? {
            Some(meta) if meta.state == RegionState::Open => meta.info,
            Some(meta) => return ctx.conflict(format!("region {} is {:?}", p.parent, meta.state)),
            None => return ctx.conflict(format!("region {} no longer exists", p.parent)),
        };
        if !parent.is_valid_split_row(&p.split_row) {
            return ctx.conflict(format!("split row is outside region {}", p.parent));
        }
        p.daughters = vec![
            RegionInfo::new(
                &p.table,
                parent.start_key.clone(),
                p.split_row.clone(),
                ctx.proc_id,
                0,
            ),
            RegionInfo::new(&p.table, p.split_row.clone(), parent.end_key.clone(), ctx.proc_id, 1),
        ];
        Ok(StepOutcome::Continue)
    })
}

fn split_close_parent<'a>(
    p: &'a mut SplitRegion,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::UnassignRegions {
            regions: vec![p.parent.clone()],
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn split_close_parent_undo<'a>(
    p: &'a mut SplitRegion,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AssignRegions {
            regions: vec![p.parent.clone()],
        })
        .await
    })
}

fn split_create_daughters<'a>(
    p: &'a mut SplitRegion,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::CreateDaughterLayout {
            parent: p.parent.clone(),
            daughters: p.daughters.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn split_create_daughters_undo<'a>(
    p: &'a mut SplitRegion,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::DeleteDaughterLayout {
            daughters: p.daughter_ids(),
        })
        .await
    })
}

fn split_commit<'a>(p: &'a mut SplitRegion, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::CommitSplit {
            parent: p.parent.clone(),
            daughters: p.daughters.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn split_open_daughters<'a>(
    p: &'a mut SplitRegion,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AssignRegions {
            regions: p.daughter_ids(),
        })
        .await?;
        let names: Vec<String> = p.daughters.iter().map(|d| d.id.to_string()).collect();
        Ok(StepOutcome::Finish(Some(format!("split {} into {}", p.parent, names.join(" and ")))))
    })
}

// ---------------------------------------------------------------------------
// MergeRegions

/// Merge open regions of one table into a single region. Without `forcible` the
/// regions must be adjacent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRegions {
    pub table: TableName,
    pub regions: Vec<RegionId>,
    pub forcible: bool,
    pub merged: Option<RegionInfo>,
}

impl MergeRegions {
    pub fn new(table: TableName, regions: Vec<RegionId>, forcible: bool) -> Self {
        Self {
            table,
            regions,
            forcible,
            merged: None,
        }
    }

    fn merged(&self) -> Result<RegionInfo, ActionError> {
        self.merged
            .clone()
            .ok_or_else(|| ActionError::fatal("merge-regions", "merged region was not computed"))
    }
}

impl ProcedureDef for MergeRegions {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", merge_prepare),
        Step::new("close-regions", merge_close).with_rollback(merge_close_undo),
        Step::new("create-merged-region", merge_create).with_rollback(merge_create_undo),
        Step::new("update-meta", merge_commit).irreversible(),
        Step::new("open-merged-region", merge_open).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        self.regions
            .iter()
            .map(|r| LockRequest::exclusive(Resource::region(&self.table, r)))
            .collect()
    }
}

fn merge_prepare<'a>(p: &'a mut MergeRegions, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let mut infos: Vec<RegionInfo> = Vec::with_capacity(p.regions.len());
        for id in &p.regions {
            match ctx.env.region(id).await? {
                Some(meta) if meta.state == RegionState::Open => infos.push(meta.info),
                Some(meta) => return ctx.conflict(format!("region {} is {:?}", id, meta.state)),
                None => return ctx.conflict(format!("region {} no longer exists", id)),
            }
        }
        infos.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        if !p.forcible && infos.windows(2).any(|w| w[0].end_key != w[1].start_key) {
            return ctx.conflict("regions are not adjacent");
        }

        let (Some(first), Some(last)) = (infos.first(), infos.last()) else {
            return ctx.conflict("nothing to merge");
        };
        // the last region by start key carries the largest end key, unbounded included
        p.merged = Some(RegionInfo::new(
            &p.table,
            first.start_key.clone(),
            last.end_key.clone(),
            ctx.proc_id,
            0,
        ));
        Ok(StepOutcome::Continue)
    })
}

fn merge_close<'a>(p: &'a mut MergeRegions, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::UnassignRegions {
            regions: p.regions.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn merge_close_undo<'a>(
    p: &'a mut MergeRegions,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AssignRegions {
            regions: p.regions.clone(),
        })
        .await
    })
}

fn merge_create<'a>(p: &'a mut MergeRegions, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::CreateMergedLayout { merged: p.merged()? })
            .await?;
        Ok(StepOutcome::Continue)
    })
}

fn merge_create_undo<'a>(
    p: &'a mut MergeRegions,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::DeleteMergedLayout { merged: p.merged()?.id })
            .await
    })
}

fn merge_commit<'a>(p: &'a mut MergeRegions, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::CommitMerge {
            parents: p.regions.clone(),
            merged: p.merged()?,
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn merge_open<'a>(p: &'a mut MergeRegions, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let merged = p.merged()?;
        ctx.perform(ClusterAction::AssignRegions {
            regions: vec![merged.id.clone()],
        })
        .await?;
        Ok(StepOutcome::Finish(Some(format!(
            "merged {} regions into {}",
            p.regions.len(),
            merged.id
        ))))
    })
}

// ---------------------------------------------------------------------------
// ReopenRegion

/// Close and reopen an open region so it picks up a new table descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReopenRegion {
    pub table: TableName,
    pub region: RegionId,
}

impl ReopenRegion {
    pub fn new(table: TableName, region: RegionId) -> Self {
        Self { table, region }
    }
}

impl ProcedureDef for ReopenRegion {
    const STEPS: &'static [Step<Self>] = &[Step::new("reopen", reopen).irreversible()];

    fn locks(&self) -> Vec<LockRequest> {
        vec![LockRequest::exclusive(Resource::region(&self.table, &self.region))]
    }
}

fn reopen<'a>(p: &'a mut ReopenRegion, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        match ctx.env.region(&p.region).await? {
            Some(meta) if meta.state == RegionState::Open => {
                ctx.perform(ClusterAction::ReopenRegion { region: p.region.clone() })
                    .await?;
                Ok(StepOutcome::Finish(Some(format!("reopened {}", p.region))))
            }
            // a region that went offline meanwhile has nothing to pick up
            _ => Ok(StepOutcome::Finish(Some(format!("skipped offline region {}", p.region)))),
        }
    })
}
