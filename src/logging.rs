//! Tracing setup for binaries embedding the procedure system and for tests.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::error::{ProcedureError, Result};

/// Install a global fmt subscriber at `level`.
///
/// Fails if another global subscriber is already installed.
pub fn init_tracing(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ProcedureError::internal(format!("failed to install subscriber: {}", e)))
}

/// Best-effort subscriber for tests; later calls are no-ops.
pub fn try_init_for_tests() {
    let _ = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}
