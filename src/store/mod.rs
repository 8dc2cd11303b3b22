//! Durable, ordered log of procedure records.

mod memory;
mod sled_store;

pub use memory::MemoryProcedureStore;
pub use sled_store::SledProcedureStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::ProcedureId;

/// One persisted procedure snapshot: the owning id and its encoded record.
pub type StoreRecord = (ProcedureId, Vec<u8>);

/// Storage trait for procedure persistence
///
/// Appends are totally ordered and durable once the call returns. Replay reads the
/// log back in append order; the last record of an id wins.
#[async_trait]
pub trait ProcedureStore: Send + Sync {
    /// Append one record
    async fn append(&self, proc_id: ProcedureId, record: Vec<u8>) -> Result<()>;

    /// Append several records atomically: after a crash either all or none are visible
    async fn append_batch(&self, records: Vec<StoreRecord>) -> Result<()>;

    /// Every record in append order
    async fn read_all(&self) -> Result<Vec<StoreRecord>>;

    /// Drop superseded records and every record of ids `keep` rejects.
    /// Returns the number of records removed.
    async fn compact(&self, keep: &(dyn Fn(ProcedureId) -> bool + Send + Sync)) -> Result<usize>;

    /// Highest procedure id ever appended, including ids whose records compaction
    /// removed. Replay resumes the id counter above it.
    async fn max_procedure_id(&self) -> Result<Option<ProcedureId>>;

    /// Flush pending writes
    async fn flush(&self) -> Result<()>;
}

/// Records that survive compaction: the last one per id, for ids `keep` accepts.
/// Returned as positions into `records`, ascending.
pub(crate) fn surviving_positions<K>(
    records: &[(K, ProcedureId)],
    keep: &(dyn Fn(ProcedureId) -> bool + Send + Sync),
) -> Vec<usize> {
    let mut last = std::collections::HashMap::new();
    for (pos, (_, proc_id)) in records.iter().enumerate() {
        last.insert(*proc_id, pos);
    }
    let mut positions: Vec<usize> = last
        .into_iter()
        .filter(|(proc_id, _)| keep(*proc_id))
        .map(|(_, pos)| pos)
        .collect();
    positions.sort_unstable();
    positions
}
