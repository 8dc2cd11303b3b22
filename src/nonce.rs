use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{ProcedureError, Result};
use crate::model::{NonceKey, ProcedureId};

#[derive(Debug, Clone, Copy)]
struct Recorded {
    proc_id: ProcedureId,
    at: Instant,
}

/// One nonce key. An empty cell means no procedure has been recorded yet; callers
/// racing on the same key queue on the cell and only one build runs at a time.
#[derive(Debug, Default)]
struct NonceSlot {
    cell: OnceCell<Recorded>,
}

/// Maps `(group, nonce)` to the procedure the first successful submission created.
#[derive(Debug, Default)]
pub struct NonceDeduplicator {
    slots: DashMap<NonceKey, Arc<NonceSlot>>,
}

impl NonceDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the procedure recorded for `key`, or run `build` and record its result.
    ///
    /// A failed build records nothing, so the next submission with the same key
    /// (including one already waiting on this call) builds again. Without a key
    /// every call builds.
    pub async fn submit<F, Fut>(&self, key: Option<NonceKey>, build: F) -> Result<ProcedureId>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProcedureId>>,
    {
        let Some(key) = key else {
            return build().await;
        };

        // clone the slot out so no map guard is held across the await
        let slot = self.slots.entry(key).or_default().clone();
        let mut built = false;
        let recorded = slot
            .cell
            .get_or_try_init(|| {
                built = true;
                let pending = build();
                async move {
                    let proc_id = pending.await?;
                    Ok::<_, ProcedureError>(Recorded {
                        proc_id,
                        at: Instant::now(),
                    })
                }
            })
            .await?;

        if !built {
            debug!(
                nonce = %key,
                proc_id = %recorded.proc_id,
                "duplicate submission, returning recorded procedure"
            );
        }
        Ok(recorded.proc_id)
    }

    /// Record a mapping recovered from the procedure log.
    pub fn register_existing(&self, key: NonceKey, proc_id: ProcedureId) {
        let slot = NonceSlot {
            cell: OnceCell::new_with(Some(Recorded {
                proc_id,
                at: Instant::now(),
            })),
        };
        self.slots.insert(key, Arc::new(slot));
    }

    pub fn get(&self, key: &NonceKey) -> Option<ProcedureId> {
        self.slots
            .get(key)
            .and_then(|slot| slot.cell.get().map(|r| r.proc_id))
    }

    /// Drop mappings older than `ttl`, plus empty slots nobody is waiting on.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot.cell.get() {
            Some(recorded) => recorded.at.elapsed() < ttl,
            None => Arc::strong_count(slot) > 1,
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of recorded mappings
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn key(nonce: u64) -> Option<NonceKey> {
        NonceKey::new(1, nonce)
    }

    #[tokio::test]
    async fn test_same_key_builds_once() {
        let dedup = NonceDeduplicator::new();
        let builds = AtomicU64::new(0);

        let first = dedup
            .submit(key(10), || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(ProcedureId(1))
            })
            .await
            .unwrap();
        let second = dedup
            .submit(key(10), || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(ProcedureId(2))
            })
            .await
            .unwrap();

        assert_eq!(first, ProcedureId(1));
        assert_eq!(second, ProcedureId(1));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.get(&NonceKey { group: 1, nonce: 10 }), Some(ProcedureId(1)));
    }

    #[tokio::test]
    async fn test_no_nonce_always_builds() {
        let dedup = NonceDeduplicator::new();
        let a = dedup.submit(None, || async { Ok(ProcedureId(1)) }).await.unwrap();
        let b = dedup.submit(None, || async { Ok(ProcedureId(2)) }).await.unwrap();
        assert_ne!(a, b);
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_failed_build_records_nothing() {
        let dedup = NonceDeduplicator::new();
        let err = dedup
            .submit(key(5), || async { Err(ProcedureError::invalid("table exists")) })
            .await;
        assert!(err.is_err());
        assert_eq!(dedup.get(&NonceKey { group: 1, nonce: 5 }), None);

        let retried = dedup.submit(key(5), || async { Ok(ProcedureId(9)) }).await.unwrap();
        assert_eq!(retried, ProcedureId(9));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_serialized() {
        let dedup = Arc::new(NonceDeduplicator::new());
        let builds = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let dedup = dedup.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .submit(key(42), || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(ProcedureId(100 + i))
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_ttl_eviction() {
        let dedup = NonceDeduplicator::new();
        dedup.register_existing(NonceKey { group: 2, nonce: 7 }, ProcedureId(3));
        assert_eq!(dedup.evict_expired(Duration::from_secs(60)), 0);
        assert_eq!(dedup.len(), 1);
        assert_eq!(dedup.evict_expired(Duration::ZERO), 1);
        assert_eq!(dedup.get(&NonceKey { group: 2, nonce: 7 }), None);
    }
}
