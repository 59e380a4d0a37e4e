//! The blob table: one row per stored digest, with its reference count.

use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::names::RepositoryName;

/// Whether a blob's content has been durably stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitState {
    /// The row exists but content is still being moved into place.
    Uploading,
    /// Content is stored under the blob's location.
    Committed,
}

/// A stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Content digest, the primary key.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Object path in the storage bucket.
    pub location: Utf8PathBuf,
    /// Number of manifest tags listing this digest.
    pub references: u64,
    /// Commit state.
    pub state: CommitState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct BlobTable {
    blobs: BTreeMap<Digest, Blob>,

    /// Blobs pushed to a repository that none of its manifests reference yet.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    unclaimed: BTreeMap<RepositoryName, BTreeSet<Digest>>,
}

impl BlobTable {
    /// True for committed blobs only.
    pub(crate) fn exists(&self, digest: &Digest) -> bool {
        self.blobs
            .get(digest)
            .is_some_and(|blob| blob.state == CommitState::Committed)
    }

    pub(crate) fn get(&self, digest: &Digest) -> RegistryResult<&Blob> {
        self.blobs
            .get(digest)
            .filter(|blob| blob.state == CommitState::Committed)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.to_string()))
    }

    /// Insert a row in the `Uploading` state with no references.
    pub(crate) fn create(&mut self, digest: Digest, size: u64, location: Utf8PathBuf) -> &Blob {
        self.blobs.entry(digest.clone()).or_insert(Blob {
            digest,
            size,
            location,
            references: 0,
            state: CommitState::Uploading,
        })
    }

    pub(crate) fn mark_committed(&mut self, digest: &Digest) -> RegistryResult<&Blob> {
        let blob = self
            .blobs
            .get_mut(digest)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.to_string()))?;
        blob.state = CommitState::Committed;
        Ok(&*blob)
    }

    pub(crate) fn increment(&mut self, digest: &Digest) -> RegistryResult<u64> {
        let blob = self
            .blobs
            .get_mut(digest)
            .filter(|blob| blob.state == CommitState::Committed)
            .ok_or_else(|| RegistryError::ManifestBlobUnknown(digest.clone()))?;
        blob.references += 1;
        Ok(blob.references)
    }

    /// Drop one reference. Returns the removed row when the count reaches
    /// zero; the caller is responsible for purging its content.
    pub(crate) fn decrement(&mut self, digest: &Digest) -> Option<Blob> {
        let Some(blob) = self.blobs.get_mut(digest) else {
            tracing::warn!(%digest, "Decrement of unknown blob");
            return None;
        };

        blob.references = blob.references.saturating_sub(1);
        if blob.references > 0 {
            return None;
        }

        self.forget(digest)
    }

    /// Remove an unreferenced blob.
    pub(crate) fn delete(&mut self, digest: &Digest) -> RegistryResult<Blob> {
        let blob = self.get(digest)?;
        if blob.references > 0 {
            return Err(RegistryError::BlobInUse {
                digest: digest.clone(),
                references: blob.references,
            });
        }

        self.forget(digest)
            .ok_or_else(|| RegistryError::BlobNotFound(digest.to_string()))
    }

    fn forget(&mut self, digest: &Digest) -> Option<Blob> {
        for pending in self.unclaimed.values_mut() {
            pending.remove(digest);
        }
        self.unclaimed.retain(|_, pending| !pending.is_empty());
        self.blobs.remove(digest)
    }

    /// Record a blob as pushed to `name` but not yet referenced there.
    pub(crate) fn claim(&mut self, name: &RepositoryName, digest: &Digest) {
        self.unclaimed
            .entry(name.clone())
            .or_default()
            .insert(digest.clone());
    }

    /// A manifest of `name` now lists these digests.
    pub(crate) fn settle<'d>(
        &mut self,
        name: &RepositoryName,
        digests: impl IntoIterator<Item = &'d Digest>,
    ) {
        if let Some(pending) = self.unclaimed.get_mut(name) {
            for digest in digests {
                pending.remove(digest);
            }
            if pending.is_empty() {
                self.unclaimed.remove(name);
            }
        }
    }

    pub(crate) fn unclaimed(&self, name: &RepositoryName) -> impl Iterator<Item = &Digest> {
        self.unclaimed.get(name).into_iter().flatten()
    }

    /// Remove the unclaimed blobs of `name` that nothing references and no
    /// other repository is still waiting on.
    pub(crate) fn recycle(&mut self, name: &RepositoryName) -> Vec<Blob> {
        let Some(pending) = self.unclaimed.remove(name) else {
            return Vec::new();
        };

        let doomed: Vec<Digest> = pending
            .into_iter()
            .filter(|digest| {
                self.blobs.get(digest).is_some_and(|b| b.references == 0)
                    && !self.unclaimed.values().any(|other| other.contains(digest))
            })
            .collect();

        doomed
            .into_iter()
            .filter_map(|digest| self.blobs.remove(&digest))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.blobs.len()
    }
}
