//! Hierarchical resource locks.
//!
//! Resources form a tree rooted at [`Resource::Global`]:
//!
//! ```text
//! GLOBAL ─┬─ NAMESPACE ── TABLE ── REGION
//!         └─ PEER
//! ```
//!
//! A lock on a resource covers its whole subtree. An EXCLUSIVE request conflicts
//! with any holder on the resource, on one of its ancestors or on one of its
//! descendants; a SHARED request conflicts only with EXCLUSIVE holders in that
//! chain. Holders that belong to the requesting procedure's own ancestry never
//! conflict, which is how child procedures run under their parent's locks.
//!
//! The manager itself is a plain data structure; the scheduler wraps it in a
//! mutex together with the per-resource wait queues.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::{ProcedureId, RegionId, TableName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Global,
    Namespace,
    Table,
    Region,
    Peer,
}

/// Flat identity of one node in the resource tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceType,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    Global,
    Namespace(String),
    Table(TableName),
    Region { table: TableName, region: RegionId },
    Peer(String),
}

impl Resource {
    pub fn region(table: &TableName, region: &RegionId) -> Self {
        Resource::Region {
            table: table.clone(),
            region: region.clone(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        let (kind, name) = match self {
            Resource::Global => (ResourceType::Global, String::new()),
            Resource::Namespace(ns) => (ResourceType::Namespace, ns.clone()),
            Resource::Table(table) => (ResourceType::Table, table.to_string()),
            Resource::Region { region, .. } => (ResourceType::Region, region.0.clone()),
            Resource::Peer(id) => (ResourceType::Peer, id.clone()),
        };
        ResourceKey { kind, name }
    }

    /// Keys from the root down to and including this resource.
    pub fn path(&self) -> Vec<ResourceKey> {
        let global = Resource::Global.key();
        match self {
            Resource::Global => vec![global],
            Resource::Namespace(_) | Resource::Peer(_) => vec![global, self.key()],
            Resource::Table(table) => vec![
                global,
                Resource::Namespace(table.namespace.clone()).key(),
                self.key(),
            ],
            Resource::Region { table, .. } => vec![
                global,
                Resource::Namespace(table.namespace.clone()).key(),
                Resource::Table(table.clone()).key(),
                self.key(),
            ],
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Resource::Global => 0,
            Resource::Namespace(_) | Resource::Peer(_) => 1,
            Resource::Table(_) => 2,
            Resource::Region { .. } => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: Resource,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn exclusive(resource: Resource) -> Self {
        Self {
            resource,
            mode: LockMode::Exclusive,
        }
    }

    pub fn shared(resource: Resource) -> Self {
        Self {
            resource,
            mode: LockMode::Shared,
        }
    }
}

impl fmt::Display for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            LockMode::Shared => "SHARED",
            LockMode::Exclusive => "EXCLUSIVE",
        };
        write!(f, "{} {}", mode, self.resource.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Blocked(ResourceKey),
}

#[derive(Debug)]
struct LockEntry {
    path: Vec<ResourceKey>,
    exclusive: Option<ProcedureId>,
    shared: BTreeSet<ProcedureId>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }

    fn holders(&self) -> impl Iterator<Item = ProcedureId> + '_ {
        self.exclusive.iter().copied().chain(self.shared.iter().copied())
    }
}

/// Point-in-time view of one locked resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedResourceSummary {
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub exclusive_owner: Option<ProcedureId>,
    pub shared_owners: Vec<ProcedureId>,
    pub waiting: Vec<ProcedureId>,
}

#[derive(Debug, Default)]
pub struct LockManager {
    entries: BTreeMap<ResourceKey, LockEntry>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every request or none of them.
    ///
    /// `ancestry` lists the requesting procedure first, then its parent, grandparent
    /// and so on. Requests are taken coarse to fine; on the first conflict everything
    /// granted during this call is released again and the blocking resource returned.
    pub fn try_acquire(
        &mut self,
        ancestry: &[ProcedureId],
        requests: &[LockRequest],
    ) -> LockOutcome {
        let Some(&proc_id) = ancestry.first() else {
            return LockOutcome::Granted;
        };

        let mut ordered: Vec<&LockRequest> = requests.iter().collect();
        ordered.sort_by_key(|r| r.resource.depth());

        let mut granted: Vec<(ResourceKey, LockMode)> = Vec::new();
        for request in ordered {
            let path = request.resource.path();
            if self.covered_by_ancestor(&path, &ancestry[1..]) {
                continue;
            }
            if let Some(blocker) = self.find_conflict(&path, request.mode, ancestry) {
                for (key, mode) in granted {
                    self.release_one(proc_id, &key, mode);
                }
                return LockOutcome::Blocked(blocker);
            }
            if self.insert(proc_id, path, request.mode) {
                granted.push((request.resource.key(), request.mode));
            }
        }
        LockOutcome::Granted
    }

    /// Install locks without conflict checks. Used when replaying held locks, which
    /// were mutually compatible when they were first granted.
    pub fn restore(
        &mut self,
        proc_id: ProcedureId,
        ancestry: &[ProcedureId],
        requests: &[LockRequest],
    ) {
        for request in requests {
            let path = request.resource.path();
            if ancestry.len() > 1 && self.covered_by_ancestor(&path, &ancestry[1..]) {
                continue;
            }
            self.insert(proc_id, path, request.mode);
        }
    }

    pub fn release(&mut self, proc_id: ProcedureId, resource: &Resource) -> bool {
        let key = resource.key();
        let mut released = false;
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.exclusive == Some(proc_id) {
                entry.exclusive = None;
                released = true;
            }
            released |= entry.shared.remove(&proc_id);
            if entry.is_free() {
                self.entries.remove(&key);
            }
        }
        released
    }

    /// Drop every lock held by `proc_id`, returning the freed resources.
    pub fn release_all(&mut self, proc_id: ProcedureId) -> Vec<ResourceKey> {
        let mut freed = Vec::new();
        self.entries.retain(|key, entry| {
            let mut touched = false;
            if entry.exclusive == Some(proc_id) {
                entry.exclusive = None;
                touched = true;
            }
            touched |= entry.shared.remove(&proc_id);
            if touched {
                freed.push(key.clone());
            }
            !entry.is_free()
        });
        freed
    }

    pub fn holds_any(&self, proc_id: ProcedureId) -> bool {
        self.entries.values().any(|e| e.holders().any(|h| h == proc_id))
    }

    pub fn is_locked(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Holders of every locked resource, ordered by resource. `waiting` is left empty
    /// for the scheduler to fill in.
    pub fn snapshot(&self) -> Vec<LockedResourceSummary> {
        self.entries
            .iter()
            .map(|(key, entry)| LockedResourceSummary {
                resource_type: key.kind,
                resource_name: key.name.clone(),
                exclusive_owner: entry.exclusive,
                shared_owners: entry.shared.iter().copied().collect(),
                waiting: Vec::new(),
            })
            .collect()
    }

    fn covered_by_ancestor(&self, path: &[ResourceKey], ancestors: &[ProcedureId]) -> bool {
        path.iter().any(|key| {
            self.entries
                .get(key)
                .and_then(|e| e.exclusive)
                .map_or(false, |owner| ancestors.contains(&owner))
        })
    }

    fn find_conflict(
        &self,
        path: &[ResourceKey],
        mode: LockMode,
        ancestry: &[ProcedureId],
    ) -> Option<ResourceKey> {
        for (key, entry) in &self.entries {
            let in_chain = entry.path.starts_with(path) || path.starts_with(&entry.path);
            if !in_chain {
                continue;
            }
            let conflicting = match mode {
                LockMode::Exclusive => entry.holders().any(|h| !ancestry.contains(&h)),
                LockMode::Shared => entry
                    .exclusive
                    .map_or(false, |owner| !ancestry.contains(&owner)),
            };
            if conflicting {
                return Some(key.clone());
            }
        }
        None
    }

    /// Returns whether a new hold was recorded.
    fn insert(&mut self, proc_id: ProcedureId, path: Vec<ResourceKey>, mode: LockMode) -> bool {
        let key = match path.last() {
            Some(key) => key.clone(),
            None => return false,
        };
        let entry = self.entries.entry(key).or_insert_with(|| LockEntry {
            path,
            exclusive: None,
            shared: BTreeSet::new(),
        });
        match mode {
            LockMode::Exclusive => {
                if entry.exclusive == Some(proc_id) {
                    return false;
                }
                entry.shared.remove(&proc_id);
                entry.exclusive = Some(proc_id);
                true
            }
            LockMode::Shared => {
                if entry.exclusive == Some(proc_id) {
                    return false;
                }
                entry.shared.insert(proc_id)
            }
        }
    }

    fn release_one(&mut self, proc_id: ProcedureId, key: &ResourceKey, mode: LockMode) {
        if let Some(entry) = self.entries.get_mut(key) {
            match mode {
                LockMode::Exclusive => {
                    if entry.exclusive == Some(proc_id) {
                        entry.exclusive = None;
                    }
                }
                LockMode::Shared => {
                    entry.shared.remove(&proc_id);
                }
            }
            if entry.is_free() {
                self.entries.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table(name: &str) -> Resource {
        Resource::Table(TableName::parse(name))
    }

    fn region(t: &str, r: &str) -> Resource {
        Resource::region(&TableName::parse(t), &RegionId::from(r))
    }

    fn p(id: u64) -> ProcedureId {
        ProcedureId(id)
    }

    #[test]
    fn test_exclusive_blocks_descendants_and_ancestors() {
        let mut locks = LockManager::new();
        assert_eq!(
            locks.try_acquire(&[p(1)], &[LockRequest::exclusive(table("t1"))]),
            LockOutcome::Granted
        );

        // region under the locked table
        assert_eq!(
            locks.try_acquire(&[p(2)], &[LockRequest::exclusive(region("t1", "r1"))]),
            LockOutcome::Blocked(table("t1").key())
        );
        // namespace above it
        assert_eq!(
            locks.try_acquire(
                &[p(3)],
                &[LockRequest::shared(Resource::Namespace("default".into()))]
            ),
            LockOutcome::Blocked(table("t1").key())
        );
        // unrelated table is fine
        assert_eq!(
            locks.try_acquire(&[p(4)], &[LockRequest::exclusive(table("t2"))]),
            LockOutcome::Granted
        );
    }

    #[test]
    fn test_shared_holders_coexist() {
        let mut locks = LockManager::new();
        assert_eq!(
            locks.try_acquire(&[p(1)], &[LockRequest::shared(table("t1"))]),
            LockOutcome::Granted
        );
        assert_eq!(
            locks.try_acquire(&[p(2)], &[LockRequest::shared(table("t1"))]),
            LockOutcome::Granted
        );
        assert_eq!(
            locks.try_acquire(&[p(3)], &[LockRequest::exclusive(table("t1"))]),
            LockOutcome::Blocked(table("t1").key())
        );

        let snapshot = locks.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].exclusive_owner, None);
        assert_eq!(snapshot[0].shared_owners, vec![p(1), p(2)]);
    }

    #[test]
    fn test_sibling_regions_do_not_conflict() {
        let mut locks = LockManager::new();
        assert_eq!(
            locks.try_acquire(&[p(1)], &[LockRequest::exclusive(region("t1", "a"))]),
            LockOutcome::Granted
        );
        assert_eq!(
            locks.try_acquire(&[p(2)], &[LockRequest::exclusive(region("t1", "b"))]),
            LockOutcome::Granted
        );
        assert_eq!(
            locks.try_acquire(&[p(3)], &[LockRequest::exclusive(table("t1"))]),
            LockOutcome::Blocked(region("t1", "a").key())
        );
    }

    #[test]
    fn test_all_or_nothing() {
        let mut locks = LockManager::new();
        locks.try_acquire(&[p(1)], &[LockRequest::exclusive(region("t1", "b"))]);

        let outcome = locks.try_acquire(
            &[p(2)],
            &[
                LockRequest::exclusive(region("t1", "a")),
                LockRequest::exclusive(region("t1", "b")),
            ],
        );
        assert_eq!(outcome, LockOutcome::Blocked(region("t1", "b").key()));
        // nothing from the failed attempt is left behind
        assert!(!locks.holds_any(p(2)));
        assert!(!locks.is_locked(&region("t1", "a").key()));
    }

    #[test]
    fn test_child_inherits_parent_exclusive() {
        let mut locks = LockManager::new();
        locks.try_acquire(&[p(1)], &[LockRequest::exclusive(table("t1"))]);

        let outcome =
            locks.try_acquire(&[p(5), p(1)], &[LockRequest::exclusive(region("t1", "r1"))]);
        assert_eq!(outcome, LockOutcome::Granted);
        // covered by the parent's table lock, so nothing new is recorded
        assert!(!locks.holds_any(p(5)));

        // an unrelated procedure still waits
        assert_eq!(
            locks.try_acquire(&[p(6)], &[LockRequest::shared(region("t1", "r2"))]),
            LockOutcome::Blocked(table("t1").key())
        );
    }

    #[test]
    fn test_peer_branch_is_independent() {
        let mut locks = LockManager::new();
        locks.try_acquire(&[p(1)], &[LockRequest::exclusive(Resource::Peer("peer1".into()))]);
        assert_eq!(
            locks.try_acquire(&[p(2)], &[LockRequest::exclusive(table("t1"))]),
            LockOutcome::Granted
        );
        assert_eq!(
            locks.try_acquire(&[p(3)], &[LockRequest::shared(Resource::Peer("peer1".into()))]),
            LockOutcome::Blocked(Resource::Peer("peer1".into()).key())
        );
        assert!(matches!(
            locks.try_acquire(&[p(3)], &[LockRequest::shared(Resource::Global)]),
            LockOutcome::Blocked(_)
        ));
    }

    #[test]
    fn test_release_all_frees_resources() {
        let mut locks = LockManager::new();
        locks.try_acquire(
            &[p(1)],
            &[
                LockRequest::exclusive(region("t1", "a")),
                LockRequest::exclusive(region("t1", "b")),
            ],
        );
        let mut freed = locks.release_all(p(1));
        freed.sort();
        assert_eq!(freed, vec![region("t1", "a").key(), region("t1", "b").key()]);
        assert!(locks.snapshot().is_empty());
        assert_eq!(
            locks.try_acquire(&[p(2)], &[LockRequest::exclusive(table("t1"))]),
            LockOutcome::Granted
        );
        assert!(locks.release(p(2), &table("t1")));
        assert!(!locks.release(p(2), &table("t1")));
    }
}
