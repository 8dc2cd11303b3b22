use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use super::{surviving_positions, ProcedureStore, StoreRecord};
use crate::error::Result;
use crate::model::ProcedureId;

/// In-process log. Clones share the same records, so a test can hand one clone to
/// an executor, drop the executor, and recover a new one from another clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryProcedureStore {
    log: Arc<Mutex<Log>>,
}

#[derive(Debug, Default)]
struct Log {
    records: Vec<StoreRecord>,
    max_id: Option<ProcedureId>,
}

impl Log {
    fn push(&mut self, record: StoreRecord) {
        self.max_id = self.max_id.max(Some(record.0));
        self.records.push(record);
    }
}

impl MemoryProcedureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in append order, one entry per record
    pub fn record_ids(&self) -> Vec<ProcedureId> {
        self.log.lock().records.iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl ProcedureStore for MemoryProcedureStore {
    async fn append(&self, proc_id: ProcedureId, record: Vec<u8>) -> Result<()> {
        self.log.lock().push((proc_id, record));
        Ok(())
    }

    async fn append_batch(&self, records: Vec<StoreRecord>) -> Result<()> {
        let mut log = self.log.lock();
        for record in records {
            log.push(record);
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<StoreRecord>> {
        Ok(self.log.lock().records.clone())
    }

    async fn compact(&self, keep: &(dyn Fn(ProcedureId) -> bool + Send + Sync)) -> Result<usize> {
        let mut log = self.log.lock();
        let records = &mut log.records;
        let index: Vec<((), ProcedureId)> = records.iter().map(|(id, _)| ((), *id)).collect();
        let survivors: HashSet<usize> = surviving_positions(&index, keep).into_iter().collect();
        let before = records.len();
        let compacted: Vec<StoreRecord> = records
            .drain(..)
            .enumerate()
            .filter(|(pos, _)| survivors.contains(pos))
            .map(|(_, record)| record)
            .collect();
        *records = compacted;
        Ok(before - records.len())
    }

    async fn max_procedure_id(&self) -> Result<Option<ProcedureId>> {
        Ok(self.log.lock().max_id)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
