//! Registry metadata: the blob and manifest tables, and the transactions
//! that change them.
//!
//! All metadata lives behind a single async `RwLock`. A [`Transaction`] holds
//! the write half for its whole lifetime and works on a copy of the tables.
//! On commit the copy is written to the storage bucket as a JSON snapshot and
//! only then swapped in; dropping a transaction discards the copy.
//!
//! Content that a transaction makes unreachable is purged after the swap,
//! while the metadata lock is still held, under the exclusive half of a
//! second lock. Readers take the shared half of that content lock before
//! letting go of the metadata lock, so an object is never removed while a
//! reader that resolved it is still streaming it.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::content::ContentStore;
use crate::error::RegistryResult;

mod blobs;
mod manifests;

pub use self::blobs::{Blob, CommitState};
pub(crate) use self::blobs::BlobTable;
pub use self::manifests::ManifestRecord;
pub(crate) use self::manifests::ManifestTable;

const SNAPSHOT_PATH: &str = "_meta/registry.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    pub(crate) blobs: BlobTable,
    pub(crate) manifests: ManifestTable,
}

#[derive(Debug)]
pub(crate) struct Metadata {
    tables: RwLock<Tables>,
    content_lock: Arc<RwLock<()>>,
    content: ContentStore,
}

/// Shared access to content resolved under the metadata lock. Owned, so a
/// response body can carry it until the last byte is sent.
pub(crate) type ContentGuard = OwnedRwLockReadGuard<()>;

impl Metadata {
    /// Load the snapshot from the bucket, or start empty if there is none.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %content.bucket().name()))]
    pub(crate) async fn open(content: ContentStore) -> RegistryResult<Self> {
        let mut data: Vec<u8> = Vec::new();
        let tables = match content
            .bucket()
            .download(Utf8Path::new(SNAPSHOT_PATH), &mut data)
            .await
        {
            Ok(()) => {
                let tables: Tables = serde_json::from_slice(&data)?;
                tracing::info!(blobs = tables.blobs.len(), "Loaded registry metadata");
                tables
            }
            Err(err) if err.is_not_found() => {
                tracing::info!("No registry metadata found, starting empty");
                Tables::default()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            tables: RwLock::new(tables),
            content_lock: Arc::new(RwLock::new(())),
            content,
        })
    }

    /// Shared access to the tables.
    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    /// Resolve something under the metadata read lock, then hand back a
    /// content guard that keeps it from being purged.
    pub(crate) async fn resolve<T, F>(&self, f: F) -> RegistryResult<(T, ContentGuard)>
    where
        F: FnOnce(&Tables) -> RegistryResult<T>,
    {
        let tables = self.tables.read().await;
        let value = f(&tables)?;
        let guard = Arc::clone(&self.content_lock).read_owned().await;
        drop(tables);
        Ok((value, guard))
    }

    /// Begin a write transaction.
    pub(crate) async fn transaction(&self) -> Transaction<'_> {
        let guard = self.tables.write().await;
        let staged = guard.clone();
        Transaction {
            guard,
            staged,
            purge: Vec::new(),
            written: Vec::new(),
            metadata: self,
        }
    }
}

/// An exclusive, all-or-nothing change to the metadata tables.
#[derive(Debug)]
pub(crate) struct Transaction<'a> {
    guard: RwLockWriteGuard<'a, Tables>,
    staged: Tables,
    purge: Vec<Utf8PathBuf>,
    written: Vec<Utf8PathBuf>,
    metadata: &'a Metadata,
}

impl Transaction<'_> {
    pub(crate) fn tables(&self) -> &Tables {
        &self.staged
    }

    pub(crate) fn blobs(&mut self) -> &mut BlobTable {
        &mut self.staged.blobs
    }

    pub(crate) fn manifests(&mut self) -> &mut ManifestTable {
        &mut self.staged.manifests
    }

    pub(crate) fn content(&self) -> &ContentStore {
        &self.metadata.content
    }

    /// Remove this object once the transaction commits.
    pub(crate) fn purge(&mut self, location: Utf8PathBuf) {
        self.purge.push(location);
    }

    /// Record an object this transaction created, so a rollback removes it.
    pub(crate) fn written(&mut self, location: Utf8PathBuf) {
        self.written.push(location);
    }

    /// Persist and publish the staged tables, then purge released content.
    pub(crate) async fn commit(self) -> RegistryResult<()> {
        let Transaction {
            mut guard,
            staged,
            purge,
            written,
            metadata,
        } = self;

        let persisted = match serde_json::to_vec(&staged) {
            Ok(snapshot) => metadata
                .content
                .put(Utf8Path::new(SNAPSHOT_PATH), &snapshot)
                .await,
            Err(err) => Err(err.into()),
        };

        if let Err(error) = persisted {
            tracing::error!(%error, "Failed to persist registry metadata");
            remove_all(&metadata.content, &written).await;
            return Err(error);
        }

        *guard = staged;

        if !purge.is_empty() {
            let _exclusive = metadata.content_lock.write().await;
            remove_all(&metadata.content, &purge).await;
        }

        drop(guard);
        Ok(())
    }

    /// Abandon the transaction, removing objects it wrote.
    pub(crate) async fn rollback(self) {
        remove_all(&self.metadata.content, &self.written).await;
    }
}

async fn remove_all(content: &ContentStore, locations: &[Utf8PathBuf]) {
    for location in locations {
        if let Err(error) = content.remove(location).await {
            tracing::warn!(%location, %error, "Failed to remove object");
        } else {
            tracing::debug!(%location, "Removed object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use storage::{MemoryStorage, Storage};

    async fn content(storage: &Storage) -> ContentStore {
        ContentStore::open(storage.bucket("meta"), None).await.unwrap()
    }

    #[tokio::test]
    async fn commit_persists_snapshot() {
        let storage: Storage = MemoryStorage::with_buckets(&["meta"]).into();
        let metadata = Metadata::open(content(&storage).await).await.unwrap();

        let digest = Digest::sha256(b"a");
        let mut tx = metadata.transaction().await;
        tx.blobs().create(digest.clone(), 1, ContentStore::blob_path(&digest));
        tx.blobs().mark_committed(&digest).unwrap();
        tx.commit().await.unwrap();

        assert!(metadata.read().await.blobs.exists(&digest));

        let reopened = Metadata::open(content(&storage).await).await.unwrap();
        assert!(reopened.read().await.blobs.exists(&digest));
    }

    #[tokio::test]
    async fn dropped_transaction_changes_nothing() {
        let storage: Storage = MemoryStorage::with_buckets(&["meta"]).into();
        let metadata = Metadata::open(content(&storage).await).await.unwrap();

        let digest = Digest::sha256(b"a");
        {
            let mut tx = metadata.transaction().await;
            tx.blobs().create(digest.clone(), 1, ContentStore::blob_path(&digest));
            tx.blobs().mark_committed(&digest).unwrap();
        }

        assert!(!metadata.read().await.blobs.exists(&digest));
        assert!(
            storage
                .metadata("meta", Utf8Path::new(SNAPSHOT_PATH))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn purge_runs_after_commit() {
        let storage: Storage = MemoryStorage::with_buckets(&["meta"]).into();
        let content = content(&storage).await;
        let metadata = Metadata::open(content.clone()).await.unwrap();

        let location = Utf8PathBuf::from("blobs/sha256/doomed");
        content.put(&location, b"bytes").await.unwrap();

        let mut tx = metadata.transaction().await;
        tx.purge(location.clone());
        tx.commit().await.unwrap();

        assert!(content.read(&location).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rollback_removes_written_objects() {
        let storage: Storage = MemoryStorage::with_buckets(&["meta"]).into();
        let content = content(&storage).await;
        let metadata = Metadata::open(content.clone()).await.unwrap();

        let location = Utf8PathBuf::from("manifests/library/app/sha256/new");
        let mut tx = metadata.transaction().await;
        tx.content().put(&location, b"{}").await.unwrap();
        tx.written(location.clone());
        tx.rollback().await;

        assert!(content.read(&location).await.is_err());
    }
}
