//! The manifest table: `(repository, tag) -> record`.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::names::{RepositoryName, Tag};

/// What the registry remembers about a published manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// Digest of the raw body.
    pub digest: Digest,
    /// 1 or 2.
    pub schema_version: u8,
    /// Media type the body is served with.
    pub media_type: String,
    /// Body size in bytes.
    pub size: u64,
    /// Object path of the raw body.
    pub location: Utf8PathBuf,
    /// Blobs this manifest depends on, in document order, without repeats.
    pub references: Vec<Digest>,
    /// Image id recorded by schema 1 manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ManifestTable {
    repositories: BTreeMap<RepositoryName, BTreeMap<Tag, ManifestRecord>>,
}

impl ManifestTable {
    pub(crate) fn get(&self, name: &RepositoryName, tag: &Tag) -> Option<&ManifestRecord> {
        self.repositories.get(name)?.get(tag)
    }

    pub(crate) fn find_by_digest(
        &self,
        name: &RepositoryName,
        digest: &Digest,
    ) -> Option<&ManifestRecord> {
        self.repositories
            .get(name)?
            .values()
            .find(|record| record.digest == *digest)
    }

    /// Every tag of `name` currently pointing at `digest`.
    pub(crate) fn tags_for(&self, name: &RepositoryName, digest: &Digest) -> Vec<Tag> {
        self.repositories
            .get(name)
            .into_iter()
            .flatten()
            .filter(|(_, record)| record.digest == *digest)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    pub(crate) fn digest_in_use(&self, name: &RepositoryName, digest: &Digest) -> bool {
        self.find_by_digest(name, digest).is_some()
    }

    /// Store a record, returning the one it replaced.
    pub(crate) fn insert(
        &mut self,
        name: RepositoryName,
        tag: Tag,
        record: ManifestRecord,
    ) -> Option<ManifestRecord> {
        self.repositories
            .entry(name)
            .or_default()
            .insert(tag, record)
    }

    /// Remove a record. A repository left without tags is dropped.
    pub(crate) fn remove(&mut self, name: &RepositoryName, tag: &Tag) -> Option<ManifestRecord> {
        let tags = self.repositories.get_mut(name)?;
        let record = tags.remove(tag);
        if tags.is_empty() {
            self.repositories.remove(name);
        }
        record
    }

    /// Tags of a repository in order, or `None` if it has none.
    pub(crate) fn tags(&self, name: &RepositoryName) -> Option<impl Iterator<Item = &Tag>> {
        self.repositories.get(name).map(|tags| tags.keys())
    }

    pub(crate) fn repositories(&self) -> impl Iterator<Item = &RepositoryName> {
        self.repositories.keys()
    }
}
