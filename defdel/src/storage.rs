//! The deferred store (`spec.md` §4.2): four independent keyed partitions,
//! one per [`Group`], supporting an atomic "acquire a batch" operation that
//! never holds a lock across driver I/O.
//!
//! Two backends are provided, in the manner of empath-spool's pluggable
//! `BackingStore`: [`MemoryDeferredStorage`] for tests and short-lived
//! processes, and [`FileDeferredStorage`] for a real daemon, persisting each
//! group as one JSON file written atomically (temp file + rename, as the
//! teacher's deletion lists do).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::errors::StorageError;
use crate::model::{DeletionInfo, Group};

/// The keyed partition store the engine drives its tick phases against.
///
/// Implementations must guarantee that [`Self::acquire_batch`] removes the
/// returned items from the group atomically with respect to concurrent
/// callers: no two concurrent `acquire_batch` calls against the same group
/// may return the same key.
#[async_trait]
pub trait DeferredStorage: Send + Sync {
    /// Walks `group` in `next_check` ascending order and, for each item:
    /// drops it (removes, does not return it) if `total_retries` has already
    /// reached `max_total_retries`; otherwise skips it (leaves it in place)
    /// if `next_check > now`, continuing on to the rest of the group — a
    /// not-yet-due item never short-circuits the scan, since a later item
    /// (e.g. after a config reload lowers the budget) may still be over
    /// budget and need dropping; otherwise removes it and adds it to the
    /// returned batch, stopping once the batch reaches `limit` items. This is
    /// the whole of `spec.md` §4.5's "Acquire batch" step and runs as one
    /// atomic section per implementation.
    ///
    /// The caller owns the returned items: it is responsible for persisting
    /// them back (to this group or another) or dropping them for good.
    async fn acquire_batch(
        &self,
        group: Group,
        now: DateTime<Utc>,
        limit: usize,
        max_total_retries: u32,
    ) -> Result<Vec<DeletionInfo>, StorageError>;

    /// Inserts or overwrites one item in `group`, keyed by
    /// [`DeletionInfo::key`].
    async fn put(&self, group: Group, info: DeletionInfo) -> Result<(), StorageError>;

    /// Removes one item from `group` by key, if present.
    async fn remove(&self, group: Group, key: &str) -> Result<(), StorageError>;

    /// Every item currently in `group`, for diagnostics ([`crate::report`]).
    /// Read-only: does not participate in the atomic-acquire contract.
    async fn snapshot(&self, group: Group) -> Result<Vec<DeletionInfo>, StorageError>;
}

fn select_due(
    table: &mut HashMap<String, DeletionInfo>,
    now: DateTime<Utc>,
    limit: usize,
    max_total_retries: u32,
) -> Vec<DeletionInfo> {
    let mut keys: Vec<String> = table.keys().cloned().collect();
    keys.sort_by_key(|key| table[key].next_check);

    let mut acquired = Vec::new();
    for key in keys {
        let info = &table[&key];
        if info.total_retries >= max_total_retries {
            table.remove(&key);
            continue;
        }
        if info.next_check > now {
            continue;
        }
        if acquired.len() >= limit {
            break;
        }
        acquired.push(table.remove(&key).expect("key just observed present"));
    }
    acquired
}

/// In-memory backend. Nothing survives process restart; suitable for tests
/// and for embedding the engine in a process that persists state elsewhere.
pub struct MemoryDeferredStorage {
    groups: [RwLock<HashMap<String, DeletionInfo>>; 4],
}

impl Default for MemoryDeferredStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeferredStorage {
    pub fn new() -> Self {
        Self {
            groups: [
                RwLock::new(HashMap::new()),
                RwLock::new(HashMap::new()),
                RwLock::new(HashMap::new()),
                RwLock::new(HashMap::new()),
            ],
        }
    }

    fn table(&self, group: Group) -> &RwLock<HashMap<String, DeletionInfo>> {
        &self.groups[group as usize]
    }
}

#[async_trait]
impl DeferredStorage for MemoryDeferredStorage {
    async fn acquire_batch(
        &self,
        group: Group,
        now: DateTime<Utc>,
        limit: usize,
        max_total_retries: u32,
    ) -> Result<Vec<DeletionInfo>, StorageError> {
        let mut table = self.table(group).write().await;
        Ok(select_due(&mut table, now, limit, max_total_retries))
    }

    async fn put(&self, group: Group, info: DeletionInfo) -> Result<(), StorageError> {
        self.table(group).write().await.insert(info.key(), info);
        Ok(())
    }

    async fn remove(&self, group: Group, key: &str) -> Result<(), StorageError> {
        self.table(group).write().await.remove(key);
        Ok(())
    }

    async fn snapshot(&self, group: Group) -> Result<Vec<DeletionInfo>, StorageError> {
        let table = self.table(group).read().await;
        let mut items: Vec<DeletionInfo> = table.values().cloned().collect();
        items.sort_by_key(|info| info.next_check);
        Ok(items)
    }
}

/// File-backed implementation: one JSON file per group under `root`, each
/// holding a `{key: DeletionInfo}` map. Writes go to a `.tmp` sibling and are
/// renamed into place, so a crash mid-write never leaves a group file
/// half-written. An in-process [`RwLock`] per group serializes writers;
/// cross-process concurrent writers are not supported, matching the
/// single-daemon deployment model (`spec.md` §5 Non-goals).
pub struct FileDeferredStorage {
    root: PathBuf,
    groups: [RwLock<()>; 4],
}

impl FileDeferredStorage {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|source| StorageError::Io {
            group: "deferdel_worker",
            source,
        })?;
        Ok(Self {
            root,
            groups: [RwLock::new(()), RwLock::new(()), RwLock::new(()), RwLock::new(())],
        })
    }

    fn path_for(&self, group: Group) -> PathBuf {
        self.root.join(format!("{}.json", group.namespace()))
    }

    async fn read_table(&self, group: Group) -> Result<HashMap<String, DeletionInfo>, StorageError> {
        let path = self.path_for(group);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(source) => Err(StorageError::Io {
                group: group.namespace(),
                source,
            }),
        }
    }

    async fn write_table(&self, group: Group, table: &HashMap<String, DeletionInfo>) -> Result<(), StorageError> {
        let path = self.path_for(group);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(table)?;
        tokio::fs::write(&tmp, &bytes).await.map_err(|source| StorageError::Io {
            group: group.namespace(),
            source,
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|source| StorageError::Io {
            group: group.namespace(),
            source,
        })
    }
}

#[async_trait]
impl DeferredStorage for FileDeferredStorage {
    async fn acquire_batch(
        &self,
        group: Group,
        now: DateTime<Utc>,
        limit: usize,
        max_total_retries: u32,
    ) -> Result<Vec<DeletionInfo>, StorageError> {
        let _guard = self.groups[group as usize].write().await;
        let mut table = self.read_table(group).await?;
        let before = table.len();
        let batch = select_due(&mut table, now, limit, max_total_retries);
        if table.len() != before {
            self.write_table(group, &table).await?;
        }
        Ok(batch)
    }

    async fn put(&self, group: Group, info: DeletionInfo) -> Result<(), StorageError> {
        let _guard = self.groups[group as usize].write().await;
        let mut table = self.read_table(group).await?;
        table.insert(info.key(), info);
        self.write_table(group, &table).await
    }

    async fn remove(&self, group: Group, key: &str) -> Result<(), StorageError> {
        let _guard = self.groups[group as usize].write().await;
        let mut table = self.read_table(group).await?;
        if table.remove(key).is_some() {
            self.write_table(group, &table).await?;
        }
        Ok(())
    }

    async fn snapshot(&self, group: Group) -> Result<Vec<DeletionInfo>, StorageError> {
        let _guard = self.groups[group as usize].read().await;
        let table = self.read_table(group).await?;
        let mut items: Vec<DeletionInfo> = table.into_values().collect();
        items.sort_by_key(|info| info.next_check);
        Ok(items)
    }
}

/// Convenience alias used by the binary to pick a backend at startup.
pub type SharedStorage = Arc<dyn DeferredStorage>;

pub async fn open_file_storage(root: &Path) -> Result<SharedStorage, StorageError> {
    Ok(Arc::new(FileDeferredStorage::open(root).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use defer_ids::{ServiceUuid, VmId};

    fn item(vmid: &str, next_check: DateTime<Utc>) -> DeletionInfo {
        DeletionInfo::new(VmId::from(vmid), ServiceUuid::from("svc"), Utc::now(), next_check)
    }

    #[tokio::test]
    async fn memory_acquire_batch_only_returns_due_items_ordered() {
        let storage = MemoryDeferredStorage::new();
        let now = Utc::now();
        storage.put(Group::ToStop, item("late", now + chrono::Duration::seconds(10))).await.unwrap();
        storage.put(Group::ToStop, item("second", now - chrono::Duration::seconds(1))).await.unwrap();
        storage.put(Group::ToStop, item("first", now - chrono::Duration::seconds(5))).await.unwrap();

        let batch = storage.acquire_batch(Group::ToStop, now, 10, 100).await.unwrap();
        let vmids: Vec<String> = batch.iter().map(|i| i.vmid.to_string()).collect();
        assert_eq!(vmids, vec!["first", "second"]);

        // Acquired items are gone from the group.
        assert!(storage.snapshot(Group::ToStop).await.unwrap().iter().all(|i| i.vmid.as_str() == "late"));
    }

    #[tokio::test]
    async fn memory_acquire_batch_respects_limit() {
        let storage = MemoryDeferredStorage::new();
        let now = Utc::now();
        for i in 0..5 {
            storage.put(Group::Deleting, item(&format!("vm-{i}"), now)).await.unwrap();
        }
        let batch = storage.acquire_batch(Group::Deleting, now, 2, 100).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(storage.snapshot(Group::Deleting).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn memory_acquire_batch_drops_items_over_budget_even_if_not_due() {
        let storage = MemoryDeferredStorage::new();
        let now = Utc::now();
        let mut exhausted = item("vm-exhausted", now + chrono::Duration::seconds(100));
        exhausted.total_retries = 14;
        storage.put(Group::ToDelete, exhausted).await.unwrap();
        storage.put(Group::ToDelete, item("vm-due", now)).await.unwrap();

        let batch = storage.acquire_batch(Group::ToDelete, now, 10, 14).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].vmid.as_str(), "vm-due");
        assert!(storage.snapshot(Group::ToDelete).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_acquire_batch_drops_over_budget_items_scanned_after_a_not_due_item() {
        let storage = MemoryDeferredStorage::new();
        let now = Utc::now();

        // Sorts before `vm-exhausted` but is itself not due yet.
        storage.put(Group::ToDelete, item("vm-not-due", now + chrono::Duration::seconds(10))).await.unwrap();

        let mut exhausted = item("vm-exhausted", now + chrono::Duration::seconds(50));
        exhausted.total_retries = 14;
        storage.put(Group::ToDelete, exhausted).await.unwrap();

        let batch = storage.acquire_batch(Group::ToDelete, now, 10, 14).await.unwrap();
        assert!(batch.is_empty(), "nothing is due yet");

        let remaining = storage.snapshot(Group::ToDelete).await.unwrap();
        assert_eq!(remaining.len(), 1, "the over-budget item must be dropped even though it's scanned after a not-due item");
        assert_eq!(remaining[0].vmid.as_str(), "vm-not-due");
    }

    #[tokio::test]
    async fn file_storage_round_trips_and_survives_reopen() {
        let dir = tempdir();
        let now = Utc::now();
        {
            let storage = FileDeferredStorage::open(dir.clone()).await.unwrap();
            storage.put(Group::ToDelete, item("vm-a", now - chrono::Duration::seconds(1))).await.unwrap();
        }
        let reopened = FileDeferredStorage::open(dir.clone()).await.unwrap();
        let batch = reopened.acquire_batch(Group::ToDelete, now, 10, 100).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].vmid.as_str(), "vm-a");
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("defdel-test-{}", ulid::Ulid::new()));
        dir
    }
}
