//! Storage engine for the registry.
//!
//! [`RegistryStorage`] ties together the content store, upload sessions, and
//! the metadata tables. Every operation that changes reference counts runs
//! inside one metadata transaction, so a blob's count always equals the number
//! of tags whose manifests list it, and content is only removed when that
//! count reaches zero.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use storage::StorageBucket;
use tokio::io::{AsyncRead, DuplexStream};
use uuid::Uuid;

use crate::content::ContentStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::{Blob, ManifestRecord, Metadata, Transaction};
use crate::names::{Reference, RepositoryName, Tag};
use crate::schema::Manifest;
use crate::upload::{UploadSessions, UploadStatus};

/// `n` / `last` pagination parameters for listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Page {
    /// Maximum number of entries to return.
    pub n: Option<usize>,
    /// Return entries sorting after this one.
    pub last: Option<String>,
}

impl Page {
    /// Apply to a sorted list. The flag is true when entries were cut off.
    pub(crate) fn apply(&self, items: Vec<String>) -> (Vec<String>, bool) {
        let mut items: Vec<String> = match &self.last {
            Some(last) => items.into_iter().filter(|item| item > last).collect(),
            None => items,
        };

        match self.n {
            Some(0) => (Vec::new(), false),
            Some(n) if items.len() > n => {
                items.truncate(n);
                (items, true)
            }
            _ => (items, false),
        }
    }
}

#[derive(Debug)]
struct Engine {
    metadata: Metadata,
    content: ContentStore,
    uploads: UploadSessions,
}

/// Handle to the registry's storage engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RegistryStorage {
    engine: Arc<Engine>,
}

impl RegistryStorage {
    /// Open the engine on a storage bucket, loading any saved metadata.
    ///
    /// Uploads are staged in `staging`, or in a temporary directory when
    /// `None`. Blobs larger than `max_upload_size` are refused.
    #[tracing::instrument(skip(bucket), fields(bucket = %bucket.name(), driver = bucket.driver()))]
    pub async fn open(
        bucket: StorageBucket,
        staging: Option<Utf8PathBuf>,
        max_upload_size: Option<u64>,
    ) -> RegistryResult<Self> {
        let content = ContentStore::open(bucket, staging).await?;
        let metadata = Metadata::open(content.clone()).await?;
        let uploads = UploadSessions::new(content.clone(), max_upload_size);

        Ok(Self {
            engine: Arc::new(Engine {
                metadata,
                content,
                uploads,
            }),
        })
    }

    // Blobs

    /// True if a committed blob exists.
    pub async fn blob_exists(&self, digest: &Digest) -> bool {
        self.engine.metadata.read().await.blobs.exists(digest)
    }

    /// The blob row for `digest`.
    pub async fn blob(&self, digest: &Digest) -> RegistryResult<Blob> {
        self.engine.metadata.read().await.blobs.get(digest).cloned()
    }

    /// Open a blob's content for streaming. The content stays in place until
    /// the returned reader has been drained or dropped.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn get_blob(&self, digest: &Digest) -> RegistryResult<(Blob, DuplexStream)> {
        let (blob, content) = self
            .engine
            .metadata
            .resolve(|tables| tables.blobs.get(digest).cloned())
            .await?;

        let reader = self
            .engine
            .content
            .stream(&blob.location, content)
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    tracing::error!(%digest, location = %blob.location, "Blob content is missing");
                    RegistryError::BlobNotFound(digest.to_string())
                } else {
                    err.into()
                }
            })?;

        Ok((blob, reader))
    }

    /// Remove a blob that no manifest references.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn delete_blob(&self, digest: &Digest) -> RegistryResult<()> {
        let mut tx = self.engine.metadata.transaction().await;
        let blob = tx.blobs().delete(digest)?;
        tx.purge(blob.location);
        tx.commit().await?;

        tracing::info!("Deleted blob");
        Ok(())
    }

    // Uploads

    /// Open an upload session for `name`.
    pub async fn start_upload(&self, name: &RepositoryName) -> RegistryResult<UploadStatus> {
        self.engine.uploads.open(name).await
    }

    /// Current state of an upload session.
    pub async fn upload_status(
        &self,
        name: &RepositoryName,
        id: Uuid,
    ) -> RegistryResult<UploadStatus> {
        self.engine.uploads.status(name, id).await
    }

    /// Append a chunk to an upload session. `start` is the first byte offset
    /// the client claims for this chunk, when it sent one.
    pub async fn append_upload<R>(
        &self,
        name: &RepositoryName,
        id: Uuid,
        chunk: R,
        start: Option<u64>,
    ) -> RegistryResult<UploadStatus>
    where
        R: AsyncRead + Unpin,
    {
        self.engine.uploads.append(name, id, chunk, start).await
    }

    /// Abandon an upload session.
    pub async fn abort_upload(&self, name: &RepositoryName, id: Uuid) -> RegistryResult<()> {
        self.engine.uploads.abort(name, id).await
    }

    /// Sessions opened before `cutoff`, for an external expiry policy.
    pub fn stale_uploads(&self, cutoff: DateTime<Utc>) -> Vec<(RepositoryName, Uuid)> {
        self.engine.uploads.started_before(cutoff)
    }

    /// Finish an upload: append the optional final chunk, verify the staged
    /// bytes hash to `digest`, and store them as a blob.
    ///
    /// If a blob with this digest already exists the staged bytes are
    /// discarded and the existing blob is returned.
    #[tracing::instrument(skip(self, chunk), fields(%name, %digest))]
    pub async fn commit_upload<R>(
        &self,
        name: &RepositoryName,
        id: Uuid,
        digest: &Digest,
        chunk: Option<R>,
    ) -> RegistryResult<Blob>
    where
        R: AsyncRead + Unpin,
    {
        let uploads = &self.engine.uploads;
        let mut session = uploads.lock(name, id).await?;
        if let Some(chunk) = chunk {
            uploads.write(&mut session, chunk, None).await?;
        }
        session.finalize();

        let actual = match self
            .engine
            .content
            .digest_staged(session.staged(), digest.algorithm())
            .await
        {
            Ok(actual) => actual,
            Err(err) => {
                uploads.close(&session, true).await;
                return Err(RegistryError::BlobUploadInvalid(err.to_string()));
            }
        };

        if actual != *digest {
            uploads.close(&session, true).await;
            return Err(RegistryError::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        match self
            .store_blob(session.name(), digest, session.received(), session.staged())
            .await
        {
            Ok(blob) => {
                uploads.close(&session, false).await;
                tracing::info!(size = blob.size, "Committed blob");
                Ok(blob)
            }
            Err(err) => {
                uploads.close(&session, true).await;
                Err(err)
            }
        }
    }

    async fn store_blob(
        &self,
        name: &RepositoryName,
        digest: &Digest,
        size: u64,
        staged: &Utf8Path,
    ) -> RegistryResult<Blob> {
        let mut tx = self.engine.metadata.transaction().await;

        let existing = tx.tables().blobs.get(digest).ok().cloned();
        let blob = if let Some(existing) = existing {
            tracing::debug!("Blob already stored, discarding upload");
            if let Err(error) = tx.content().discard(staged).await {
                tracing::warn!(%error, "Failed to discard staged upload");
            }
            existing
        } else {
            let location = ContentStore::blob_path(digest);
            tx.blobs().create(digest.clone(), size, location.clone());

            tx.written(location.clone());
            if let Err(err) = tx.content().commit(staged, &location).await {
                tx.rollback().await;
                return Err(err);
            }
            tx.blobs().mark_committed(digest)?.clone()
        };

        tx.blobs().claim(name, digest);
        tx.commit().await?;
        Ok(blob)
    }

    // Manifests

    /// Publish a manifest under a tag.
    ///
    /// Every blob the manifest lists must already be committed. On rejection
    /// the blobs pushed to this repository that no manifest uses are removed.
    #[tracing::instrument(skip(self, raw), fields(%name, %tag, size = raw.len()))]
    pub async fn put_manifest(
        &self,
        name: &RepositoryName,
        tag: &Tag,
        content_type: Option<&str>,
        raw: Bytes,
    ) -> RegistryResult<ManifestRecord> {
        let manifest = match Manifest::parse(&raw)
            .and_then(|manifest| manifest.check_content_type(content_type).map(|_| manifest))
        {
            Ok(manifest) => manifest,
            Err(err) => {
                self.recycle(name).await;
                return Err(err);
            }
        };

        let references = manifest.references();
        let missing = {
            let tables = self.engine.metadata.read().await;
            references
                .iter()
                .find(|digest| !tables.blobs.exists(digest))
                .cloned()
        };
        if let Some(missing) = missing {
            self.recycle(name).await;
            return Err(RegistryError::ManifestBlobUnknown(missing));
        }

        let digest = Digest::sha256(&raw);
        let record = ManifestRecord {
            location: ContentStore::manifest_path(name, &digest),
            digest,
            schema_version: manifest.schema_version(),
            media_type: manifest.media_type().to_owned(),
            size: raw.len() as u64,
            references,
            image_id: manifest.image_id(),
        };

        let mut tx = self.engine.metadata.transaction().await;
        match publish(&mut tx, name, tag, record, &raw).await {
            Ok(record) => {
                tx.commit().await?;
                tracing::info!(digest = %record.digest, "Published manifest");
                Ok(record)
            }
            Err(err) => {
                tx.rollback().await;
                if matches!(err, RegistryError::ManifestBlobUnknown(_)) {
                    self.recycle(name).await;
                }
                Err(err)
            }
        }
    }

    /// Fetch a manifest record and its raw body.
    #[tracing::instrument(skip(self), fields(%name, %reference))]
    pub async fn get_manifest(
        &self,
        name: &RepositoryName,
        reference: &Reference,
    ) -> RegistryResult<(ManifestRecord, Bytes)> {
        let (record, _content) = self
            .engine
            .metadata
            .resolve(|tables| {
                let record = match reference {
                    Reference::Tag(tag) => tables.manifests.get(name, tag),
                    Reference::Digest(digest) => tables.manifests.find_by_digest(name, digest),
                };
                record
                    .cloned()
                    .ok_or_else(|| RegistryError::ManifestNotFound(format!("{name}:{reference}")))
            })
            .await?;

        let body = self.engine.content.read(&record.location).await?;
        Ok((record, body))
    }

    /// Remove every tag of `name` pointing at `digest`, releasing the blobs
    /// those manifests listed.
    #[tracing::instrument(skip(self), fields(%name, %digest))]
    pub async fn delete_manifest(&self, name: &RepositoryName, digest: &Digest) -> RegistryResult<()> {
        let mut tx = self.engine.metadata.transaction().await;

        let tags = tx.tables().manifests.tags_for(name, digest);
        if tags.is_empty() {
            return Err(RegistryError::ManifestNotFound(format!("{name}@{digest}")));
        }

        for tag in &tags {
            let Some(record) = tx.manifests().remove(name, tag) else {
                continue;
            };
            release(&mut tx, &record.references);
            tx.purge(record.location);
        }

        tx.commit().await?;
        tracing::info!(tags = tags.len(), "Deleted manifest");
        Ok(())
    }

    /// Tags of a repository, sorted.
    pub async fn list_tags(
        &self,
        name: &RepositoryName,
        page: &Page,
    ) -> RegistryResult<(Vec<String>, bool)> {
        let tables = self.engine.metadata.read().await;
        let tags = tables
            .manifests
            .tags(name)
            .ok_or_else(|| RegistryError::RepositoryNotFound(name.to_string()))?
            .map(|tag| tag.to_string())
            .collect();
        Ok(page.apply(tags))
    }

    /// Repositories with at least one tag, sorted.
    pub async fn list_repositories(&self, page: &Page) -> (Vec<String>, bool) {
        let tables = self.engine.metadata.read().await;
        let mut names: Vec<String> = tables
            .manifests
            .repositories()
            .map(|name| name.to_string())
            .collect();
        names.sort();
        page.apply(names)
    }

    /// Remove blobs pushed to `name` that none of its manifests came to use.
    async fn recycle(&self, name: &RepositoryName) {
        let mut tx = self.engine.metadata.transaction().await;
        let removed = tx.blobs().recycle(name);
        if removed.is_empty() {
            return;
        }

        tracing::info!(%name, count = removed.len(), "Recycling unclaimed blobs");
        for blob in removed {
            tx.purge(blob.location);
        }

        if let Err(error) = tx.commit().await {
            tracing::warn!(%name, %error, "Failed to recycle unclaimed blobs");
        }
    }
}

/// Write a manifest record inside `tx`. The new references are counted
/// before the old ones are released, so a blob listed by both never reaches
/// zero.
async fn publish(
    tx: &mut Transaction<'_>,
    name: &RepositoryName,
    tag: &Tag,
    record: ManifestRecord,
    raw: &[u8],
) -> RegistryResult<ManifestRecord> {
    for digest in &record.references {
        tx.blobs().increment(digest)?;
    }

    let body_exists = tx.tables().manifests.digest_in_use(name, &record.digest);
    tx.content().put(&record.location, raw).await?;
    if !body_exists {
        tx.written(record.location.clone());
    }

    let previous = tx.manifests().insert(name.clone(), tag.clone(), record.clone());
    tx.blobs().settle(name, &record.references);

    if let Some(previous) = previous {
        release(tx, &previous.references);
        if previous.digest != record.digest
            && !tx.tables().manifests.digest_in_use(name, &previous.digest)
        {
            tx.purge(previous.location);
        }
    }

    Ok(record)
}

/// Drop one reference from each digest, purging blobs that reach zero.
fn release(tx: &mut Transaction<'_>, references: &[Digest]) {
    for digest in references {
        if let Some(blob) = tx.blobs().decrement(digest) {
            tracing::debug!(%digest, "Blob no longer referenced");
            tx.purge(blob.location);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::{schema1, schema2};
    use storage::{MemoryStorage, Storage};
    use tokio::io::AsyncReadExt;

    struct Fixture {
        storage: Storage,
        registry: RegistryStorage,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_limit(None).await
        }

        async fn with_limit(max_upload_size: Option<u64>) -> Self {
            let storage: Storage = MemoryStorage::with_buckets(&["test"]).into();
            let registry = RegistryStorage::open(storage.bucket("test"), None, max_upload_size)
                .await
                .unwrap();
            Self { storage, registry }
        }

        async fn push(&self, name: &RepositoryName, data: &[u8]) -> Digest {
            let digest = Digest::sha256(data);
            let status = self.registry.start_upload(name).await.unwrap();
            self.registry
                .append_upload(name, status.id, data, None)
                .await
                .unwrap();
            self.registry
                .commit_upload(name, status.id, &digest, None::<&[u8]>)
                .await
                .unwrap();
            digest
        }

        async fn references(&self, digest: &Digest) -> Option<u64> {
            self.registry.blob(digest).await.ok().map(|b| b.references)
        }

        async fn objects(&self, prefix: &str) -> Vec<String> {
            self.storage
                .list("test", Some(Utf8Path::new(prefix)))
                .await
                .unwrap()
        }
    }

    async fn drain(mut reader: DuplexStream) -> Vec<u8> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        data
    }

    fn repo(name: &str) -> RepositoryName {
        RepositoryName::new("library", name).unwrap()
    }

    fn tag(tag: &str) -> Tag {
        tag.parse().unwrap()
    }

    #[tokio::test]
    async fn empty_upload_commits_unreferenced_blob() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let empty = Digest::sha256(b"");

        let status = fx.registry.start_upload(&name).await.unwrap();
        fx.registry
            .append_upload(&name, status.id, &b""[..], None)
            .await
            .unwrap();
        let blob = fx
            .registry
            .commit_upload(&name, status.id, &empty, None::<&[u8]>)
            .await
            .unwrap();

        assert_eq!(blob.size, 0);
        assert!(fx.registry.blob_exists(&empty).await);
        assert_eq!(fx.references(&empty).await, Some(0));
    }

    #[tokio::test]
    async fn commit_with_final_chunk() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let digest = Digest::sha256(b"hello world");

        let status = fx.registry.start_upload(&name).await.unwrap();
        fx.registry
            .append_upload(&name, status.id, &b"hello "[..], Some(0))
            .await
            .unwrap();
        fx.registry
            .commit_upload(&name, status.id, &digest, Some(&b"world"[..]))
            .await
            .unwrap();

        let (blob, reader) = fx.registry.get_blob(&digest).await.unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(drain(reader).await, b"hello world");

        let err = fx
            .registry
            .upload_status(&name, status.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UploadNotFound(_)));
    }

    #[tokio::test]
    async fn digest_mismatch_discards_upload() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let claimed = Digest::sha256(b"something else");

        let status = fx.registry.start_upload(&name).await.unwrap();
        fx.registry
            .append_upload(&name, status.id, &b"payload"[..], None)
            .await
            .unwrap();
        let err = fx
            .registry
            .commit_upload(&name, status.id, &claimed, None::<&[u8]>)
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(!fx.registry.blob_exists(&claimed).await);
        assert!(!fx.registry.blob_exists(&Digest::sha256(b"payload")).await);
        assert!(fx.objects("blobs/").await.is_empty());
        assert!(fx.registry.upload_status(&name, status.id).await.is_err());
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let fx = Fixture::new().await;
        let (one, two) = (repo("one"), repo("two"));

        let config = fx.push(&one, b"config").await;
        let layer = fx.push(&one, b"shared layer").await;
        fx.push(&two, b"config").await;
        fx.push(&two, b"shared layer").await;

        let body = Bytes::from(schema2(&config, &[&layer]));
        fx.registry
            .put_manifest(&one, &tag("v1"), None, body.clone())
            .await
            .unwrap();
        fx.registry
            .put_manifest(&two, &tag("v1"), None, body)
            .await
            .unwrap();

        assert_eq!(fx.objects("blobs/").await.len(), 2);
        assert_eq!(fx.references(&layer).await, Some(2));
        assert_eq!(fx.references(&config).await, Some(2));
    }

    #[tokio::test]
    async fn manifest_with_unknown_blobs_is_rejected() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let config = Digest::sha256(b"config");
        let (a, b) = (Digest::sha256(b"a"), Digest::sha256(b"b"));

        let err = fx
            .registry
            .put_manifest(&name, &tag("v1"), None, schema2(&config, &[&a, &b]).into())
            .await
            .unwrap_err();

        match err {
            RegistryError::ManifestBlobUnknown(digest) => assert_eq!(digest, config),
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.registry.list_tags(&name, &Page::default()).await.is_err());
    }

    #[tokio::test]
    async fn replacing_a_tag_moves_references() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let a = fx.push(&name, b"a").await;
        let b = fx.push(&name, b"b").await;
        let c = fx.push(&name, b"c").await;

        let first = fx
            .registry
            .put_manifest(&name, &tag("v1"), None, schema1(&[&a, &b]).into())
            .await
            .unwrap();
        assert_eq!(first.schema_version, 1);
        assert_eq!(fx.references(&a).await, Some(1));

        fx.registry
            .put_manifest(&name, &tag("v1"), None, schema1(&[&b, &c]).into())
            .await
            .unwrap();

        assert_eq!(fx.references(&a).await, None);
        assert!(!fx.registry.blob_exists(&a).await);
        assert!(
            !fx.objects("blobs/")
                .await
                .contains(&ContentStore::blob_path(&a).into_string())
        );
        assert_eq!(fx.references(&b).await, Some(1));
        assert_eq!(fx.references(&c).await, Some(1));

        // The first body is gone with the only tag that named it.
        assert_eq!(fx.objects("manifests/").await.len(), 1);
        assert!(
            fx.registry
                .get_manifest(&name, &Reference::Digest(first.digest))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn republishing_same_manifest_keeps_counts() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let config = fx.push(&name, b"config").await;
        let body = Bytes::from(schema2(&config, &[]));

        for _ in 0..3 {
            fx.registry
                .put_manifest(&name, &tag("latest"), None, body.clone())
                .await
                .unwrap();
        }
        assert_eq!(fx.references(&config).await, Some(1));

        fx.registry
            .put_manifest(&name, &tag("stable"), None, body)
            .await
            .unwrap();
        assert_eq!(fx.references(&config).await, Some(2));
    }

    #[tokio::test]
    async fn delete_by_digest_twice() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let config = fx.push(&name, b"config").await;

        let record = fx
            .registry
            .put_manifest(&name, &tag("v1"), None, schema2(&config, &[]).into())
            .await
            .unwrap();

        fx.registry.delete_manifest(&name, &record.digest).await.unwrap();
        let err = fx
            .registry
            .delete_manifest(&name, &record.digest)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestNotFound(_)));

        assert!(!fx.registry.blob_exists(&config).await);
        assert!(fx.objects("manifests/").await.is_empty());
        assert!(fx.registry.list_repositories(&Page::default()).await.0.is_empty());
    }

    #[tokio::test]
    async fn shared_content_survives_tag_deletion() {
        let fx = Fixture::new().await;
        let (one, two) = (repo("one"), repo("two"));
        let config = fx.push(&one, b"config").await;
        let base = fx.push(&one, b"base").await;
        let extra = fx.push(&two, b"extra").await;

        fx.registry
            .put_manifest(&one, &tag("v1"), None, schema2(&config, &[&base]).into())
            .await
            .unwrap();
        let second = fx
            .registry
            .put_manifest(&two, &tag("v1"), None, schema2(&config, &[&base, &extra]).into())
            .await
            .unwrap();

        fx.registry.delete_manifest(&two, &second.digest).await.unwrap();

        assert_eq!(fx.references(&base).await, Some(1));
        assert_eq!(fx.references(&config).await, Some(1));
        assert!(!fx.registry.blob_exists(&extra).await);
        let (_, reader) = fx.registry.get_blob(&base).await.unwrap();
        assert_eq!(drain(reader).await, b"base");
    }

    #[tokio::test]
    async fn delete_blob_in_use_is_refused() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let config = fx.push(&name, b"config").await;
        let loose = fx.push(&name, b"loose").await;

        fx.registry
            .put_manifest(&name, &tag("v1"), None, schema2(&config, &[]).into())
            .await
            .unwrap();

        let err = fx.registry.delete_blob(&config).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobInUse { references: 1, .. }));

        fx.registry.delete_blob(&loose).await.unwrap();
        assert!(matches!(
            fx.registry.get_blob(&loose).await,
            Err(RegistryError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejected_manifest_recycles_unclaimed_blobs() {
        let fx = Fixture::new().await;
        let (one, two) = (repo("one"), repo("two"));
        let lonely = fx.push(&one, b"lonely").await;
        let shared = fx.push(&one, b"shared").await;
        fx.push(&two, b"shared").await;

        let err = fx
            .registry
            .put_manifest(&one, &tag("v1"), None, Bytes::from_static(b"{not json"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidManifest(_)));

        assert!(!fx.registry.blob_exists(&lonely).await);
        assert!(fx.registry.blob_exists(&shared).await);
        assert_eq!(fx.objects("blobs/").await.len(), 1);
    }

    #[tokio::test]
    async fn manifest_round_trip() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let config = fx.push(&name, b"config").await;
        let body = Bytes::from(schema2(&config, &[]));

        let record = fx
            .registry
            .put_manifest(
                &name,
                &tag("latest"),
                Some(crate::schema::SCHEMA2_MEDIA_TYPE),
                body.clone(),
            )
            .await
            .unwrap();
        assert_eq!(record.digest, Digest::sha256(&body));

        let (by_tag, data) = fx
            .registry
            .get_manifest(&name, &Reference::Tag(tag("latest")))
            .await
            .unwrap();
        assert_eq!(data, body);
        assert_eq!(by_tag, record);

        let (by_digest, _) = fx
            .registry
            .get_manifest(&name, &Reference::Digest(record.digest.clone()))
            .await
            .unwrap();
        assert_eq!(by_digest.digest, record.digest);

        assert!(
            fx.registry
                .get_manifest(&repo("other"), &Reference::Tag(tag("latest")))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn metadata_survives_reopen() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let config = fx.push(&name, b"config").await;
        fx.registry
            .put_manifest(&name, &tag("v1"), None, schema2(&config, &[]).into())
            .await
            .unwrap();

        let reopened = RegistryStorage::open(fx.storage.bucket("test"), None, None)
            .await
            .unwrap();
        assert_eq!(reopened.blob(&config).await.unwrap().references, 1);
        let (tags, _) = reopened.list_tags(&name, &Page::default()).await.unwrap();
        assert_eq!(tags, vec!["v1"]);
    }

    #[tokio::test]
    async fn listings_paginate() {
        let fx = Fixture::new().await;
        let config = fx.push(&repo("a"), b"config").await;
        let body = Bytes::from(schema2(&config, &[]));

        for (name, t) in [("a", "v1"), ("a", "v2"), ("a", "v3"), ("b", "v1"), ("c", "v1")] {
            fx.registry
                .put_manifest(&repo(name), &tag(t), None, body.clone())
                .await
                .unwrap();
        }

        let page = Page {
            n: Some(2),
            last: None,
        };
        let (repos, more) = fx.registry.list_repositories(&page).await;
        assert_eq!(repos, vec!["library/a", "library/b"]);
        assert!(more);

        let page = Page {
            n: Some(2),
            last: Some("library/b".into()),
        };
        let (repos, more) = fx.registry.list_repositories(&page).await;
        assert_eq!(repos, vec!["library/c"]);
        assert!(!more);

        let page = Page {
            n: None,
            last: Some("v1".into()),
        };
        let (tags, _) = fx.registry.list_tags(&repo("a"), &page).await.unwrap();
        assert_eq!(tags, vec!["v2", "v3"]);

        // An empty page never points at a next page
        let page = Page {
            n: Some(0),
            last: None,
        };
        let (repos, more) = fx.registry.list_repositories(&page).await;
        assert!(repos.is_empty());
        assert!(!more);
    }

    #[tokio::test]
    async fn oversized_upload_is_refused() {
        let fx = Fixture::with_limit(Some(3)).await;
        let name = repo("app");
        let status = fx.registry.start_upload(&name).await.unwrap();

        let err = fx
            .registry
            .commit_upload(&name, status.id, &Digest::sha256(b"four"), Some(&b"four"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TooLarge { limit: 3 }));
        assert!(fx.registry.upload_status(&name, status.id).await.is_err());
    }

    #[tokio::test]
    async fn failed_blob_commit_leaves_nothing_behind() {
        let fx = Fixture::new().await;
        let name = repo("app");
        let digest = Digest::sha256(b"gone");

        let err = fx
            .registry
            .store_blob(&name, &digest, 4, Utf8Path::new("/nonexistent/depot/staged"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(!fx.registry.blob_exists(&digest).await);
        assert!(fx.objects("blobs/").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tags_count_every_reference() {
        const TAGS: usize = 64;

        let fx = Fixture::new().await;
        let name = repo("app");
        let config = fx.push(&name, b"config").await;
        let body = Bytes::from(schema2(&config, &[]));

        let tasks: Vec<_> = (0..TAGS)
            .map(|i| {
                let registry = fx.registry.clone();
                let (name, body) = (name.clone(), body.clone());
                tokio::spawn(async move {
                    registry
                        .put_manifest(&name, &tag(&format!("t{i}")), None, body)
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fx.references(&config).await, Some(TAGS as u64));
        let (tags, _) = fx
            .registry
            .list_tags(&name, &Page::default())
            .await
            .unwrap();
        assert_eq!(tags.len(), TAGS);

        fx.registry
            .delete_manifest(&name, &Digest::sha256(&body))
            .await
            .unwrap();

        assert!(!fx.registry.blob_exists(&config).await);
        assert!(fx.objects("blobs/").await.is_empty());
        assert!(fx.objects("manifests/").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replacement_races_delete_on_shared_digests() {
        for _ in 0..16 {
            let fx = Fixture::new().await;
            let name = repo("app");
            let config = fx.push(&name, b"config").await;
            let a = fx.push(&name, b"a").await;
            let b = fx.push(&name, b"b").await;
            let c = fx.push(&name, b"c").await;

            fx.registry
                .put_manifest(&name, &tag("keep"), None, schema2(&config, &[&a, &b]).into())
                .await
                .unwrap();
            let doomed = fx
                .registry
                .put_manifest(&name, &tag("old"), None, schema2(&config, &[&b]).into())
                .await
                .unwrap();
            assert_eq!(fx.references(&b).await, Some(2));

            let replace = {
                let registry = fx.registry.clone();
                let name = name.clone();
                let body = Bytes::from(schema2(&config, &[&b, &c]));
                tokio::spawn(async move {
                    registry.put_manifest(&name, &tag("keep"), None, body).await
                })
            };
            let delete = {
                let registry = fx.registry.clone();
                let name = name.clone();
                tokio::spawn(async move { registry.delete_manifest(&name, &doomed.digest).await })
            };
            replace.await.unwrap().unwrap();
            delete.await.unwrap().unwrap();

            assert_eq!(fx.references(&config).await, Some(1));
            assert_eq!(fx.references(&a).await, None);
            assert_eq!(fx.references(&b).await, Some(1));
            assert_eq!(fx.references(&c).await, Some(1));
            assert_eq!(fx.objects("blobs/").await.len(), 3);
            assert_eq!(fx.objects("manifests/").await.len(), 1);
        }
    }
}
