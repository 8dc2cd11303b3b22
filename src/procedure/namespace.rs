use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{ProcedureDef, Step, StepContext, StepOutcome, StepResult};
use crate::env::ClusterAction;
use crate::event::MASTER_INITIALIZED;
use crate::lock::{LockRequest, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNamespace {
    pub namespace: String,
}

impl CreateNamespace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl ProcedureDef for CreateNamespace {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", create_prepare),
        Step::new("create-namespace", create_namespace).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        vec![LockRequest::exclusive(Resource::Namespace(self.namespace.clone()))]
    }
}

fn create_prepare<'a>(
    p: &'a mut CreateNamespace,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if !ctx.event_ready(MASTER_INITIALIZED) {
            return Ok(StepOutcome::wait_for_event(MASTER_INITIALIZED));
        }
        if ctx.env.namespace_exists(&p.namespace).await? {
            return ctx.conflict(format!("namespace {} already exists", p.namespace));
        }
        Ok(StepOutcome::Continue)
    })
}

fn create_namespace<'a>(
    p: &'a mut CreateNamespace,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::CreateNamespace {
            namespace: p.namespace.clone(),
        })
        .await?;
        Ok(StepOutcome::Finish(Some(format!("created namespace {}", p.namespace))))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNamespace {
    pub namespace: String,
}

impl DeleteNamespace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl ProcedureDef for DeleteNamespace {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("pre-operation", delete_prepare),
        Step::new("delete-namespace", delete_namespace).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        vec![LockRequest::exclusive(Resource::Namespace(self.namespace.clone()))]
    }
}

fn delete_prepare<'a>(
    p: &'a mut DeleteNamespace,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if !ctx.env.namespace_exists(&p.namespace).await? {
            return ctx.conflict(format!("namespace {} no longer exists", p.namespace));
        }
        let tables = ctx.env.tables_in_namespace(&p.namespace).await?;
        if !tables.is_empty() {
            return ctx.conflict(format!(
                "namespace {} still has {} tables",
                p.namespace,
                tables.len()
            ));
        }
        Ok(StepOutcome::Continue)
    })
}

fn delete_namespace<'a>(
    p: &'a mut DeleteNamespace,
    ctx: &'a StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.perform(ClusterAction::DeleteNamespace {
            namespace: p.namespace.clone(),
        })
        .await?;
        Ok(StepOutcome::Finish(Some(format!("deleted namespace {}", p.namespace))))
    })
}
