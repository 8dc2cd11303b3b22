//! Scriptable procedure for exercising the executor.

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{ProcedureDef, ProcedureSpec, Step, StepContext, StepOutcome, StepResult};
use crate::error::ActionError;
use crate::lock::{LockRequest, Resource};
use crate::model::{ExpiryPolicy, ProcedureFailure, TableName};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProbeAction {
    Continue,
    Fail,
    /// Fail transiently this many times, then continue
    Flaky(u32),
    Fatal,
    Event(String),
    /// Suspend once with a deadline this far out, then continue
    Timeout { millis: i64, on_expiry: ExpiryPolicy },
    /// Spawn children running this plan, failing ones if the flag is set
    Spawn { count: usize, failing: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub table: Option<TableName>,
    pub plan: [ProbeAction; 3],
    pub failing_rollback: Option<u32>,
    pub trace: Vec<String>,
}

impl Probe {
    pub fn new(plan: [ProbeAction; 3]) -> Self {
        Self {
            table: None,
            plan,
            failing_rollback: None,
            trace: Vec::new(),
        }
    }

    pub fn passing() -> Self {
        Self::new([ProbeAction::Continue, ProbeAction::Continue, ProbeAction::Continue])
    }

    pub fn locking(mut self, table: &str) -> Self {
        self.table = Some(TableName::parse(table));
        self
    }

    pub fn spec(self) -> ProcedureSpec {
        ProcedureSpec::Probe(self)
    }

    async fn run(&mut self, index: usize, ctx: &StepContext) -> StepResult {
        self.trace.push(format!("exec:{}", index));
        let Some(action) = self.plan.get(index).cloned() else {
            return Ok(StepOutcome::Continue);
        };
        let outcome = match action {
            ProbeAction::Continue => StepOutcome::Continue,
            ProbeAction::Fail => {
                StepOutcome::Fail(ProcedureFailure::step_failed(ctx.step, "scripted failure"))
            }
            ProbeAction::Flaky(times) if ctx.attempt < times => {
                return Err(ActionError::transient(ctx.step, "scripted transient failure"))
            }
            ProbeAction::Flaky(_) => StepOutcome::Continue,
            ProbeAction::Fatal => {
                return Err(ActionError::fatal(ctx.step, "scripted fatal failure"))
            }
            ProbeAction::Event(name) if !ctx.event_ready(&name) => {
                StepOutcome::wait_for_event(&name)
            }
            ProbeAction::Event(_) => StepOutcome::Continue,
            ProbeAction::Timeout { .. } if ctx.timed_out => StepOutcome::Continue,
            ProbeAction::Timeout { millis, on_expiry } => {
                let deadline = Utc::now() + chrono::Duration::milliseconds(millis);
                StepOutcome::wait_until(deadline, on_expiry)
            }
            ProbeAction::Spawn { count, failing } => {
                let plan = if failing {
                    [ProbeAction::Continue, ProbeAction::Fail, ProbeAction::Continue]
                } else {
                    [ProbeAction::Continue, ProbeAction::Continue, ProbeAction::Continue]
                };
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut child = Probe::new(plan.clone());
                    child.table = self.table.clone();
                    children.push(child.spec());
                }
                StepOutcome::SpawnChildren(children)
            }
        };
        if index == 2 && outcome == StepOutcome::Continue {
            return Ok(StepOutcome::Finish(Some(self.trace.join(","))));
        }
        Ok(outcome)
    }

    async fn undo(&mut self, index: u32) -> Result<(), ActionError> {
        if self.failing_rollback == Some(index) {
            return Err(ActionError::fatal("undo", "scripted rollback failure"));
        }
        self.trace.push(format!("undo:{}", index));
        Ok(())
    }
}

impl ProcedureDef for Probe {
    const STEPS: &'static [Step<Self>] = &[
        Step::new("first", first).with_rollback(first_undo),
        Step::new("second", second).with_rollback(second_undo),
        Step::new("third", third).irreversible(),
    ];

    fn locks(&self) -> Vec<LockRequest> {
        self.table
            .iter()
            .map(|t| LockRequest::exclusive(Resource::Table(t.clone())))
            .collect()
    }
}

fn first<'a>(p: &'a mut Probe, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(p.run(0, ctx))
}

fn second<'a>(p: &'a mut Probe, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(p.run(1, ctx))
}

fn third<'a>(p: &'a mut Probe, ctx: &'a StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(p.run(2, ctx))
}

fn first_undo<'a>(
    p: &'a mut Probe,
    _ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(p.undo(0))
}

fn second_undo<'a>(
    p: &'a mut Probe,
    _ctx: &'a StepContext,
) -> BoxFuture<'a, Result<(), ActionError>> {
    Box::pin(p.undo(1))
}
