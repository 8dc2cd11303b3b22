//! Replication peer procedures.
//!
//! Each one changes the stored peer state and then refreshes the peer on every
//! region server. The refresh is the point of no return: once servers have
//! seen the new state the change is rolled forward, never back.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{ProcedureDef, Step, StepContext, StepOutcome, StepResult};
use crate::env::{ClusterAction, PeerMeta};
use crate::error::ActionError;
use crate::lock::{LockRequest, Resource};
use crate::model::{PeerConfig, SyncReplicationState};

fn peer_lock(peer_id: &str) -> Vec<LockRequest> {
    vec![LockRequest::exclusive(Resource::Peer(peer_id.to_string()))]
}

async fn existing_peer(ctx: &StepContext, peer_id: &str) -> Result<Option<PeerMeta>, ActionError> {
    ctx.env.peer(peer_id).await
}

fn refresh<'a>(
    ctx: &'a StepContext,
    peer_id: &'a str,
    result: String,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::RefreshPeer {
            peer_id: peer_id.to_string(),
        })
        .await?;
        Ok(StepOutcome::Finish(Some(result)))
    })
}

// ---------------------------------------------------------------------------
// AddPeer

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddPeer {
    pub peer_id: String,
    pub config: PeerConfig,
    pub enabled: bool,
}

impl AddPeer {
    pub fn new(peer_id: impl Into<String>, config: PeerConfig) -> Self {
        Self {
            peer_id: peer_id.into(),
            config,
            enabled: true,
        }
    }

    /// Register the peer in the disabled state
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl ProcedureDef for AddPeer {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", add_prepare),
        Step::new("update-peer-storage", add_store).with_rollback(add_store_undo),
        Step::new("refresh-peer", add_refresh).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        peer_lock(&self.peer_id)
    }
}

fn add_prepare<'a>(p: &'a mut AddPeer, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if existing_peer(ctx, &p.peer_id).await?.is_some() {
            return ctx.conflict(format!("peer {} already exists", p.peer_id));
        }
        Ok(StepOutcome::Continue)
    })
}

fn add_store<'a>(p: &'a mut AddPeer, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::AddPeer {
            peer_id: p.peer_id.clone(),
            config: p.config.clone(),
            enabled: p.enabled,
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn add_store_undo<'a>(
    p: &'a mut AddPeer,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::RemovePeer {
            peer_id: p.peer_id.clone(),
        })
        .await
    })
}

fn add_refresh<'a>(p: &'a mut AddPeer, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    refresh(ctx, &p.peer_id, format!("added peer {}", p.peer_id))
}

// ---------------------------------------------------------------------------
// RemovePeer

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovePeer {
    pub peer_id: String,
}

impl RemovePeer {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self { peer_id: peer_id.into() }
    }
}

impl ProcedureDef for RemovePeer {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", remove_prepare),
        Step::new("update-peer-storage", remove_store).irreversible(),
        Step::new("refresh-peer", remove_refresh).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        peer_lock(&self.peer_id)
    }
}

fn remove_prepare<'a>(p: &'a mut RemovePeer, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if existing_peer(ctx, &p.peer_id).await?.is_none() {
            return ctx.conflict(format!("peer {} no longer exists", p.peer_id));
        }
        Ok(StepOutcome::Continue)
    })
}

fn remove_store<'a>(p: &'a mut RemovePeer, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::RemovePeer {
            peer_id: p.peer_id.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn remove_refresh<'a>(p: &'a mut RemovePeer, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    refresh(ctx, &p.peer_id, format!("removed peer {}", p.peer_id))
}

// ---------------------------------------------------------------------------
// SetPeerState

/// Enable or disable replication to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPeerState {
    pub peer_id: String,
    pub enabled: bool,
}

impl SetPeerState {
    pub fn new(peer_id: impl Into<String>, enabled: bool) -> Self {
        Self {
            peer_id: peer_id.into(),
            enabled,
        }
    }
}

impl ProcedureDef for SetPeerState {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", state_prepare),
        Step::new("update-peer-storage", state_store).with_rollback(state_store_undo),
        Step::new("refresh-peer", state_refresh).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        peer_lock(&self.peer_id)
    }
}

fn state_prepare<'a>(p: &'a mut SetPeerState, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        match existing_peer(ctx, &p.peer_id).await? {
            None => ctx.conflict(format!("peer {} no longer exists", p.peer_id)),
            Some(peer) if peer.enabled == p.enabled => ctx.conflict(format!(
                "peer {} is already {}",
                p.peer_id,
                if p.enabled { "enabled" } else { "disabled" }
            )),
            Some(_) => Ok(StepOutcome::Continue),
        }
    })
}

fn state_store<'a>(p: &'a mut SetPeerState, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetPeerEnabled {
            peer_id: p.peer_id.clone(),
            enabled: p.enabled,
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn state_store_undo<'a>(
    p: &'a mut SetPeerState,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetPeerEnabled {
            peer_id: p.peer_id.clone(),
            enabled: !p.enabled,
        })
        .await
    })
}

fn state_refresh<'a>(p: &'a mut SetPeerState, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    let verb = if p.enabled { "enabled" } else { "disabled" };
    refresh(ctx, &p.peer_id, format!("{} peer {}", verb, p.peer_id))
}

// ---------------------------------------------------------------------------
// UpdatePeerConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePeerConfig {
    pub peer_id: String,
    pub config: PeerConfig,
    pub previous: Option<PeerConfig>,
}

impl UpdatePeerConfig {
    pub fn new(peer_id: impl Into<String>, config: PeerConfig) -> Self {
        Self {
            peer_id: peer_id.into(),
            config,
            previous: None,
        }
    }
}

impl ProcedureDef for UpdatePeerConfig {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", update_prepare),
        Step::new("update-peer-storage", update_store).with_rollback(update_store_undo),
        Step::new("refresh-peer", update_refresh).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        peer_lock(&self.peer_id)
    }
}

fn update_prepare<'a>(
    p: &'a mut UpdatePeerConfig,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let Some(peer) = existing_peer(ctx, &p.peer_id).await? else {
            return ctx.conflict(format!("peer {} no longer exists", p.peer_id));
        };
        if peer.config.sync_replication != p.config.sync_replication {
            return ctx.conflict(format!("cannot change sync replication of peer {}", p.peer_id));
        }
        p.previous = Some(peer.config);
        Ok(StepOutcome::Continue)
    })
}

fn update_store<'a>(
    p: &'a mut UpdatePeerConfig,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::UpdatePeerConfig {
            peer_id: p.peer_id.clone(),
            config: p.config.clone(),
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn update_store_undo<'a>(
    p: &'a mut UpdatePeerConfig,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        let Some(previous) = p.previous.clone() else {
            return Ok(());
        };
        ctx.perform(ClusterAction::UpdatePeerConfig {
            peer_id: p.peer_id.clone(),
            config: previous,
        })
        .await
    })
}

fn update_refresh<'a>(
    p: &'a mut UpdatePeerConfig,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    refresh(ctx, &p.peer_id, format!("updated config of peer {}", p.peer_id))
}

// ---------------------------------------------------------------------------
// TransitPeerSyncReplicationState

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitPeerSyncReplicationState {
    pub peer_id: String,
    pub target: SyncReplicationState,
    pub from: Option<SyncReplicationState>,
}

impl TransitPeerSyncReplicationState {
    pub fn new(peer_id: impl Into<String>, target: SyncReplicationState) -> Self {
        Self {
            peer_id: peer_id.into(),
            target,
            from: None,
        }
    }
}

impl ProcedureDef for TransitPeerSyncReplicationState {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", transit_prepare),
        Step::new("update-peer-storage", transit_store).with_rollback(transit_store_undo),
        Step::new("refresh-peer", transit_refresh).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        peer_lock(&self.peer_id)
    }
}

fn transit_prepare<'a>(
    p: &'a mut TransitPeerSyncReplicationState,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let Some(peer) = existing_peer(ctx, &p.peer_id).await? else {
            return ctx.conflict(format!("peer {} no longer exists", p.peer_id));
        };
        if !peer.sync_state.can_transit_to(p.target) {
            return ctx.conflict(format!(
                "peer {} cannot go from {:?} to {:?}",
                p.peer_id, peer.sync_state, p.target
            ));
        }
        p.from = Some(peer.sync_state);
        Ok(StepOutcome::Continue)
    })
}

fn transit_store<'a>(
    p: &'a mut TransitPeerSyncReplicationState,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::SetPeerSyncState {
            peer_id: p.peer_id.clone(),
            state: p.target,
        })
        .await?;
        Ok(StepOutcome::Continue)
    })
}

fn transit_store_undo<'a>(
    p: &'a mut TransitPeerSyncReplicationState,
    ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(async move {
        let Some(from) = p.from else {
            return Ok(());
        };
        ctx.perform(ClusterAction::SetPeerSyncState {
            peer_id: p.peer_id.clone(),
            state: from,
        })
        .await
    })
}

fn transit_refresh<'a>(
    p: &'a mut TransitPeerSyncReplicationState,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    refresh(ctx, &p.peer_id, format!("peer {} is now {:?}", p.peer_id, p.target))
}
