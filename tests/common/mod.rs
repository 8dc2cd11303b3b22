//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_procedures::error::Result;
use cluster_procedures::store::StoreRecord;
use cluster_procedures::{
    ColumnFamilyDescriptor, ExecutorConfig, ExecutorConfigBuilder, MemoryCluster,
    MemoryProcedureStore, ProcedureError, ProcedureId, ProcedureStore, ProcedureSummary,
    ProcedureSystem, ProcedureSystemBuilder, TableDescriptor, TableName,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn config() -> ExecutorConfig {
    ExecutorConfigBuilder::from_config(ExecutorConfig::development())
        .retry_delays(Duration::from_millis(5), Duration::from_millis(50))
        .build()
        .unwrap()
}

pub fn descriptor(name: &str) -> TableDescriptor {
    TableDescriptor::new(TableName::parse(name)).with_family(ColumnFamilyDescriptor::new("cf"))
}

pub async fn start(
    cluster: &MemoryCluster,
    store: Arc<dyn ProcedureStore>,
) -> Arc<ProcedureSystem> {
    cluster_procedures::logging::try_init_for_tests();
    ProcedureSystemBuilder::new()
        .with_config(config())
        .with_cluster(Arc::new(cluster.clone()))
        .with_store(store)
        .build()
        .await
        .unwrap()
}

pub async fn start_memory(cluster: &MemoryCluster) -> Arc<ProcedureSystem> {
    start(cluster, Arc::new(MemoryProcedureStore::new())).await
}

pub async fn finish(system: &ProcedureSystem, proc_id: ProcedureId) -> ProcedureSummary {
    system.master().wait_for_procedure(proc_id, WAIT).await.unwrap()
}

/// Poll until `check` holds, failing the test after [`WAIT`].
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Memory store that starts failing every write after `budget` successful appends,
/// the way a coordinator loses its log when it crashes mid-step.
pub struct CrashingStore {
    inner: MemoryProcedureStore,
    budget: usize,
    appended: AtomicUsize,
}

impl CrashingStore {
    pub fn new(inner: MemoryProcedureStore, budget: usize) -> Self {
        Self {
            inner,
            budget,
            appended: AtomicUsize::new(0),
        }
    }

    fn spend(&self) -> Result<()> {
        if self.appended.fetch_add(1, Ordering::SeqCst) >= self.budget {
            return Err(ProcedureError::storage("simulated crash"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcedureStore for CrashingStore {
    async fn append(&self, proc_id: ProcedureId, record: Vec<u8>) -> Result<()> {
        self.spend()?;
        self.inner.append(proc_id, record).await
    }

    async fn append_batch(&self, records: Vec<StoreRecord>) -> Result<()> {
        self.spend()?;
        self.inner.append_batch(records).await
    }

    async fn read_all(&self) -> Result<Vec<StoreRecord>> {
        self.inner.read_all().await
    }

    async fn compact(&self, keep: &(dyn Fn(ProcedureId) -> bool + Send + Sync)) -> Result<usize> {
        self.inner.compact(keep).await
    }

    async fn max_procedure_id(&self) -> Result<Option<ProcedureId>> {
        self.inner.max_procedure_id().await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}
