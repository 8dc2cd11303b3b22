use async_trait::async_trait;
use sled::{Batch, Db, Tree};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{surviving_positions, ProcedureStore, StoreRecord};
use crate::error::{ProcedureError, Result};
use crate::model::ProcedureId;

const PROCEDURES_TREE: &str = "procedures";
const META_TREE: &str = "procedure-meta";
const MAX_ID_KEY: &[u8] = b"max-procedure-id";

/// On-disk log backed by a sled tree.
///
/// Keys are big-endian append sequence numbers so sled's key order is append order.
/// Values are the procedure id followed by the zstd-compressed record.
pub struct SledProcedureStore {
    db: Db,
    tree: Tree,
    /// Holds the id high-water mark, which compaction never removes
    meta: Tree,
    /// Next sequence number; the lock is the single serialization point for appends
    next_seq: Mutex<u64>,
    sync: bool,
    compression_level: i32,
}

impl SledProcedureStore {
    pub fn open(path: impl AsRef<Path>, sync: bool, compression_level: i32) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree(PROCEDURES_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        let next_seq = match tree.last()? {
            Some((key, _)) => decode_seq(&key)? + 1,
            None => 0,
        };
        info!(path = %path.as_ref().display(), records = tree.len(), "opened procedure store");
        Ok(Self {
            db,
            tree,
            meta,
            next_seq: Mutex::new(next_seq),
            sync,
            compression_level,
        })
    }

    fn encode_value(&self, proc_id: ProcedureId, record: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::encode_all(record, self.compression_level)?;
        let mut value = Vec::with_capacity(8 + compressed.len());
        value.extend_from_slice(&proc_id.0.to_be_bytes());
        value.extend_from_slice(&compressed);
        Ok(value)
    }

    async fn sync_if_needed(&self) -> Result<()> {
        if self.sync {
            self.db.flush_async().await?;
        }
        Ok(())
    }

    fn stored_max_id(&self) -> Result<Option<ProcedureId>> {
        self.meta.get(MAX_ID_KEY)?.map(|v| decode_id(&v)).transpose()
    }

    /// Raise the high-water mark to `proc_id`. Callers hold the append lock.
    fn raise_max_id(&self, proc_id: ProcedureId) -> Result<()> {
        if self.stored_max_id()? < Some(proc_id) {
            self.meta.insert(MAX_ID_KEY, proc_id.0.to_be_bytes().to_vec())?;
        }
        Ok(())
    }

    /// Disk space used by the database, in bytes
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| {
            ProcedureError::storage(format!("malformed record key of {} bytes", key.len()))
        })?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_id(value: &[u8]) -> Result<ProcedureId> {
    let head: [u8; 8] = value
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProcedureError::storage("truncated procedure record"))?;
    Ok(ProcedureId(u64::from_be_bytes(head)))
}

#[async_trait]
impl ProcedureStore for SledProcedureStore {
    async fn append(&self, proc_id: ProcedureId, record: Vec<u8>) -> Result<()> {
        let value = self.encode_value(proc_id, &record)?;
        let mut next_seq = self.next_seq.lock().await;
        self.tree.insert(next_seq.to_be_bytes(), value)?;
        *next_seq += 1;
        self.raise_max_id(proc_id)?;
        self.sync_if_needed().await
    }

    async fn append_batch(&self, records: Vec<StoreRecord>) -> Result<()> {
        let mut encoded = Vec::with_capacity(records.len());
        let max_id = records.iter().map(|(id, _)| *id).max();
        for (proc_id, record) in &records {
            encoded.push(self.encode_value(*proc_id, record)?);
        }

        let mut next_seq = self.next_seq.lock().await;
        let mut batch = Batch::default();
        let mut seq = *next_seq;
        for value in encoded {
            batch.insert(seq.to_be_bytes().to_vec(), value);
            seq += 1;
        }
        self.tree.apply_batch(batch)?;
        *next_seq = seq;
        if let Some(max_id) = max_id {
            self.raise_max_id(max_id)?;
        }
        self.sync_if_needed().await
    }

    async fn read_all(&self) -> Result<Vec<StoreRecord>> {
        let mut records = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            let proc_id = decode_id(&value)?;
            let record = zstd::decode_all(&value[8..])?;
            records.push((proc_id, record));
        }
        Ok(records)
    }

    async fn compact(&self, keep: &(dyn Fn(ProcedureId) -> bool + Send + Sync)) -> Result<usize> {
        // hold the append lock so no record lands between the scan and the batch
        let _guard = self.next_seq.lock().await;

        let mut index = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            index.push((key, decode_id(&value)?));
        }
        let survivors = surviving_positions(&index, keep);
        // a store written before the mark existed carries it only in its records
        if let Some(max_id) = index.iter().map(|(_, id)| *id).max() {
            self.raise_max_id(max_id)?;
        }

        let mut batch = Batch::default();
        let mut removed = 0;
        let mut survivors = survivors.into_iter().peekable();
        for (pos, (key, _)) in index.iter().enumerate() {
            if survivors.peek() == Some(&pos) {
                survivors.next();
                continue;
            }
            batch.remove(key.clone());
            removed += 1;
        }
        self.tree.apply_batch(batch)?;
        self.db.flush_async().await?;
        debug!(removed, "compacted procedure store");
        Ok(removed)
    }

    async fn max_procedure_id(&self) -> Result<Option<ProcedureId>> {
        self.stored_max_id()
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SledProcedureStore::open(temp_dir.path(), true, 3).unwrap();
            store.append(ProcedureId(1), b"first".to_vec()).await.unwrap();
            store
                .append_batch(vec![
                    (ProcedureId(1), b"second".to_vec()),
                    (ProcedureId(2), b"child".to_vec()),
                ])
                .await
                .unwrap();
        }

        let store = SledProcedureStore::open(temp_dir.path(), true, 3).unwrap();
        store.append(ProcedureId(3), b"after-reopen".to_vec()).await.unwrap();
        let records = store.read_all().await.unwrap();
        assert_eq!(
            records,
            vec![
                (ProcedureId(1), b"first".to_vec()),
                (ProcedureId(1), b"second".to_vec()),
                (ProcedureId(2), b"child".to_vec()),
                (ProcedureId(3), b"after-reopen".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_compaction_keeps_last_record_of_retained_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledProcedureStore::open(temp_dir.path(), false, 1).unwrap();
        for (id, body) in [(1, "a"), (2, "b"), (1, "c"), (3, "d"), (2, "e")] {
            store.append(ProcedureId(id), body.as_bytes().to_vec()).await.unwrap();
        }

        let removed = store.compact(&|id| id != ProcedureId(2)).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(
            store.read_all().await.unwrap(),
            vec![(ProcedureId(1), b"c".to_vec()), (ProcedureId(3), b"d".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_max_id_survives_compaction_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SledProcedureStore::open(temp_dir.path(), true, 1).unwrap();
            assert_eq!(store.max_procedure_id().await.unwrap(), None);
            store.append(ProcedureId(4), b"a".to_vec()).await.unwrap();
            store
                .append_batch(vec![
                    (ProcedureId(7), b"b".to_vec()),
                    (ProcedureId(5), b"c".to_vec()),
                ])
                .await
                .unwrap();
            store.compact(&|_| false).await.unwrap();
            assert!(store.read_all().await.unwrap().is_empty());
        }

        let store = SledProcedureStore::open(temp_dir.path(), true, 1).unwrap();
        assert_eq!(store.max_procedure_id().await.unwrap(), Some(ProcedureId(7)));
    }
}
