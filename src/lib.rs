//! # cluster-procedures: crash-recoverable administrative operations
//!
//! A procedure execution core for a cluster coordinator. Administrative
//! operations (create a table, split a region, add a replication peer, ...) run
//! as multi-step procedures that are persisted after every step, serialized
//! against each other through hierarchical resource locks, deduplicated by
//! client nonce, and resumed exactly where they stopped after a restart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cluster_procedures::{
//!     ColumnFamilyDescriptor, ProcedureSystemBuilder, TableDescriptor, TableName,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let system = ProcedureSystemBuilder::new()
//!         .with_store_path("procedures.db")
//!         .build()
//!         .await?;
//!
//!     let descriptor = TableDescriptor::new(TableName::parse("orders"))
//!         .with_family(ColumnFamilyDescriptor::new("cf"));
//!     let proc_id = system.master().create_table(descriptor, None, 1, 1).await?;
//!     let summary = system.master().wait_for_procedure(proc_id, Duration::from_secs(30)).await?;
//!     println!("{}", summary.to_json()?);
//!
//!     system.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod event;
pub mod executor;
pub mod lock;
pub mod logging;
pub mod master;
pub mod metrics;
pub mod model;
pub mod nonce;
pub mod procedure;
pub mod ready_queue;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod timer;

pub use config::{ExecutorConfig, ExecutorConfigBuilder};
pub use env::{ClusterAction, ClusterEnv, MemoryCluster};
pub use error::{ActionError, ProcedureError, Result};
pub use event::{EventRegistry, ProcedureEvent, EXECUTOR_INITIALIZED, MASTER_INITIALIZED};
pub use executor::{ChoreReport, ProcedureCompletion, ProcedureExecutor};
pub use lock::{LockMode, LockRequest, LockedResourceSummary, Resource, ResourceType};
pub use master::{MasterServices, SwitchType};
pub use metrics::MetricsSnapshot;
pub use model::{
    ColumnFamilyDescriptor, ExpiryPolicy, FailureKind, NonceKey, PeerConfig, Procedure,
    ProcedureFailure, ProcedureId, ProcedureState, ProcedureSummary, RegionId, RegionInfo,
    RegionState, SyncReplicationState, TableDescriptor, TableName, TableState, Wait,
};
pub use procedure::{ProcedureSpec, ProcedureType, StepOutcome};
pub use recovery::RecoveryStats;
pub use scheduler::SchedulerStats;
pub use store::{MemoryProcedureStore, ProcedureStore, SledProcedureStore};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// The executor, its store and the master surface, started together.
pub struct ProcedureSystem {
    master: MasterServices,
    executor: Arc<ProcedureExecutor>,
    store: Arc<dyn ProcedureStore>,
    recovery_stats: RecoveryStats,
}

impl ProcedureSystem {
    /// Open the store, replay it and start the executor.
    ///
    /// Unless `defer_master_init` is set the master-initialized event is tripped
    /// right away; otherwise table and namespace procedures park until
    /// [`MasterServices::mark_initialized`] is called.
    pub async fn start(
        config: ExecutorConfig,
        store: Arc<dyn ProcedureStore>,
        env: Arc<dyn ClusterEnv>,
        defer_master_init: bool,
    ) -> Result<Arc<Self>> {
        let executor = Arc::new(ProcedureExecutor::new(config, store.clone(), env.clone())?);
        let recovery_stats = executor.start().await?;
        info!(?recovery_stats, "procedure recovery complete");

        let master = MasterServices::new(executor.clone(), env);
        if !defer_master_init {
            master.mark_initialized();
        }
        Ok(Arc::new(Self {
            master,
            executor,
            store,
            recovery_stats,
        }))
    }

    pub fn master(&self) -> &MasterServices {
        &self.master
    }

    pub fn executor(&self) -> &Arc<ProcedureExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn ProcedureStore> {
        &self.store
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.executor.metrics()
    }

    /// Shutdown the system gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down procedure system");
        self.executor.shutdown().await
    }
}

/// Builder for ProcedureSystem
#[derive(Default)]
pub struct ProcedureSystemBuilder {
    config: Option<ExecutorConfig>,
    store_path: Option<PathBuf>,
    store: Option<Arc<dyn ProcedureStore>>,
    env: Option<Arc<dyn ClusterEnv>>,
    defer_master_init: bool,
}

impl ProcedureSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Persist to a sled database at `path`
    pub fn with_store_path(mut self, path: impl AsRef<Path>) -> Self {
        self.store_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use an already opened store; takes precedence over any store path
    pub fn with_store(mut self, store: Arc<dyn ProcedureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cluster(mut self, env: Arc<dyn ClusterEnv>) -> Self {
        self.env = Some(env);
        self
    }

    /// Leave the master-initialized event untripped after start
    pub fn defer_master_init(mut self) -> Self {
        self.defer_master_init = true;
        self
    }

    pub async fn build(self) -> Result<Arc<ProcedureSystem>> {
        let config = self.config.unwrap_or_default();
        let store_path = self.store_path.or_else(|| config.store_path.clone());
        let store: Arc<dyn ProcedureStore> = match (self.store, store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                info!(path = ?path, "opening procedure store");
                Arc::new(SledProcedureStore::open(
                    path,
                    config.store_sync,
                    config.compression_level,
                )?)
            }
            (None, None) => Arc::new(MemoryProcedureStore::new()),
        };
        let env = self.env.unwrap_or_else(|| Arc::new(MemoryCluster::new()));
        ProcedureSystem::start(config, store, env, self.defer_master_init).await
    }
}
