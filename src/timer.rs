use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::model::ProcedureId;

/// A deadline that passed. `token` must still match the procedure's wait token for
/// the fire to take effect; anything else is a stale timer and is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub proc_id: ProcedureId,
    pub token: u64,
}

/// Monotonic timer service for `WaitingTimeout` procedures.
///
/// Each scheduled deadline is a sleeping task that posts back to the executor;
/// nothing is cancelled, stale fires are filtered by token on arrival.
#[derive(Debug, Clone)]
pub struct TimeoutTimer {
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimeoutTimer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire at the wall-clock `deadline`, measured on the monotonic clock from now.
    pub fn schedule(&self, proc_id: ProcedureId, token: u64, deadline: DateTime<Utc>) {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_after(proc_id, token, remaining);
    }

    pub fn schedule_after(&self, proc_id: ProcedureId, token: u64, delay: Duration) {
        let tx = self.tx.clone();
        let at = Instant::now() + delay;
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let _ = tx.send(TimerFired { proc_id, token });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_in_deadline_order() {
        let (timer, mut rx) = TimeoutTimer::new();
        timer.schedule_after(ProcedureId(2), 1, Duration::from_millis(40));
        timer.schedule_after(ProcedureId(1), 7, Duration::from_millis(5));
        timer.schedule(ProcedureId(3), 2, Utc::now() - chrono::Duration::seconds(5));

        assert_eq!(rx.recv().await, Some(TimerFired { proc_id: ProcedureId(3), token: 2 }));
        assert_eq!(rx.recv().await, Some(TimerFired { proc_id: ProcedureId(1), token: 7 }));
        assert_eq!(rx.recv().await, Some(TimerFired { proc_id: ProcedureId(2), token: 1 }));
    }
}
