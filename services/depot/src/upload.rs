//! Upload sessions.
//!
//! A session accumulates the bytes of one blob push in a staging file until
//! the client commits it under a digest or abandons it. Sessions only exist
//! in process memory. Each one sits behind its own mutex, so concurrent
//! requests against a single session are serialized while unrelated sessions
//! proceed in parallel.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::content::{ContentStore, Staged};
use crate::error::{RegistryError, RegistryResult};
use crate::names::RepositoryName;

/// The `Range` header value for an upload that has received `offset` bytes.
pub(crate) fn range_header(offset: u64) -> String {
    format!("0-{}", offset.saturating_sub(1))
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting chunks.
    Accumulating,
    /// Being verified and committed.
    Finalizing,
}

#[derive(Debug)]
pub(crate) struct UploadSession {
    id: Uuid,
    name: RepositoryName,
    staged: Utf8PathBuf,
    received: u64,
    state: SessionState,
    started: DateTime<Utc>,
}

impl UploadSession {
    pub(crate) fn name(&self) -> &RepositoryName {
        &self.name
    }

    pub(crate) fn staged(&self) -> &Utf8Path {
        &self.staged
    }

    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    pub(crate) fn finalize(&mut self) {
        self.state = SessionState::Finalizing;
    }

    pub(crate) fn status(&self) -> UploadStatus {
        UploadStatus {
            id: self.id,
            name: self.name.clone(),
            offset: self.received,
            state: self.state,
            started: self.started,
        }
    }
}

/// A snapshot of an upload session, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    /// Session id.
    pub id: Uuid,
    /// Repository the session belongs to.
    pub name: RepositoryName,
    /// Bytes received so far.
    pub offset: u64,
    /// Lifecycle state.
    pub state: SessionState,
    /// When the session was opened.
    pub started: DateTime<Utc>,
}

impl UploadStatus {
    /// Value for the `Range` response header.
    pub fn range(&self) -> String {
        range_header(self.offset)
    }

    /// URL path clients use to continue this upload.
    pub fn location(&self) -> String {
        format!("/v2/{}/blobs/uploads/{}", self.name, self.id)
    }
}

pub(crate) type SessionGuard = OwnedMutexGuard<UploadSession>;

#[derive(Debug)]
pub(crate) struct UploadSessions {
    sessions: DashMap<Uuid, Arc<Mutex<UploadSession>>>,
    content: ContentStore,
    max_size: Option<u64>,
}

impl UploadSessions {
    pub(crate) fn new(content: ContentStore, max_size: Option<u64>) -> Self {
        Self {
            sessions: DashMap::new(),
            content,
            max_size,
        }
    }

    /// Start a new session for `name`.
    #[tracing::instrument(level = "debug", skip(self), fields(%name))]
    pub(crate) async fn open(&self, name: &RepositoryName) -> RegistryResult<UploadStatus> {
        let id = Uuid::new_v4();
        let staged = self.content.staging_path(id);
        self.content
            .create_staged(&staged)
            .await
            .map_err(|err| RegistryError::BlobUploadInvalid(err.to_string()))?;

        let session = UploadSession {
            id,
            name: name.clone(),
            staged,
            received: 0,
            state: SessionState::Accumulating,
            started: Utc::now(),
        };
        let status = session.status();
        self.sessions.insert(id, Arc::new(Mutex::new(session)));

        tracing::debug!(%id, "Opened upload session");
        Ok(status)
    }

    /// Lock a session, checking that it belongs to `name`.
    pub(crate) async fn lock(&self, name: &RepositoryName, id: Uuid) -> RegistryResult<SessionGuard> {
        let unknown = || RegistryError::UploadNotFound(id.to_string());

        let handle = self
            .sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(unknown)?;

        let session = handle.lock_owned().await;

        // The session may have been closed while we waited for the lock.
        if session.name != *name || !self.sessions.contains_key(&id) {
            return Err(unknown());
        }

        Ok(session)
    }

    /// Append a chunk to a locked session. `start` is the offset the client
    /// claims the chunk begins at, if it sent one.
    pub(crate) async fn write<R>(
        &self,
        session: &mut SessionGuard,
        reader: R,
        start: Option<u64>,
    ) -> RegistryResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(start) = start
            && start != session.received
        {
            return Err(RegistryError::RangeNotSatisfiable {
                offset: session.received,
            });
        }

        let allowance = self
            .max_size
            .map_or(u64::MAX, |max| max.saturating_sub(session.received));

        match self.content.stage_write(&session.staged, reader, allowance).await {
            Ok(Staged::Written(n)) => {
                session.received += n;
                tracing::trace!(id = %session.id, offset = session.received, "Appended {n} bytes");
                Ok(session.received)
            }
            Ok(Staged::Exceeded) => {
                self.close(session, true).await;
                Err(RegistryError::TooLarge {
                    limit: self.max_size.unwrap_or(u64::MAX),
                })
            }
            Err(err) => {
                self.close(session, true).await;
                Err(RegistryError::BlobUploadInvalid(err.to_string()))
            }
        }
    }

    /// Append a chunk to a session.
    #[tracing::instrument(level = "debug", skip(self, reader), fields(%name))]
    pub(crate) async fn append<R>(
        &self,
        name: &RepositoryName,
        id: Uuid,
        reader: R,
        start: Option<u64>,
    ) -> RegistryResult<UploadStatus>
    where
        R: AsyncRead + Unpin,
    {
        let mut session = self.lock(name, id).await?;
        self.write(&mut session, reader, start).await?;
        Ok(session.status())
    }

    pub(crate) async fn status(
        &self,
        name: &RepositoryName,
        id: Uuid,
    ) -> RegistryResult<UploadStatus> {
        let session = self.lock(name, id).await?;
        Ok(session.status())
    }

    /// Abandon a session and purge its staged bytes.
    #[tracing::instrument(level = "debug", skip(self), fields(%name))]
    pub(crate) async fn abort(&self, name: &RepositoryName, id: Uuid) -> RegistryResult<()> {
        let session = self.lock(name, id).await?;
        self.close(&session, true).await;
        Ok(())
    }

    /// Forget a session, optionally discarding whatever is still staged.
    pub(crate) async fn close(&self, session: &UploadSession, discard: bool) {
        self.sessions.remove(&session.id);
        if discard {
            if let Err(error) = self.content.discard(&session.staged).await {
                tracing::warn!(id = %session.id, %error, "Failed to discard staged upload");
            }
            tracing::debug!(id = %session.id, "Aborted upload session");
        }
    }

    /// Ids of sessions opened before `cutoff`, for an external reaper.
    pub(crate) fn started_before(&self, cutoff: DateTime<Utc>) -> Vec<(RepositoryName, Uuid)> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value().try_lock().ok()?;
                (session.started < cutoff).then(|| (session.name.clone(), session.id))
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryStorage, Storage};

    async fn sessions(max_size: Option<u64>) -> UploadSessions {
        let storage: Storage = MemoryStorage::with_buckets(&["uploads"]).into();
        let content = ContentStore::open(storage.bucket("uploads"), None)
            .await
            .unwrap();
        UploadSessions::new(content, max_size)
    }

    fn name() -> RepositoryName {
        RepositoryName::new("library", "app").unwrap()
    }

    #[test]
    fn range_headers() {
        assert_eq!(range_header(0), "0-0");
        assert_eq!(range_header(1), "0-0");
        assert_eq!(range_header(1024), "0-1023");
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let uploads = sessions(None).await;
        let a = uploads.open(&name()).await.unwrap();
        let b = uploads.open(&name()).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.range(), "0-0");

        let status = uploads.append(&name(), a.id, &b"abc"[..], None).await.unwrap();
        assert_eq!(status.offset, 3);
        let status = uploads.append(&name(), a.id, &b"de"[..], Some(3)).await.unwrap();
        assert_eq!(status.offset, 5);

        assert_eq!(uploads.status(&name(), b.id).await.unwrap().offset, 0);
        assert_eq!(uploads.status(&name(), a.id).await.unwrap().range(), "0-4");
    }

    #[tokio::test]
    async fn session_belongs_to_its_repository() {
        let uploads = sessions(None).await;
        let status = uploads.open(&name()).await.unwrap();
        let other = RepositoryName::new("library", "other").unwrap();

        let err = uploads.append(&other, status.id, &b"x"[..], None).await.unwrap_err();
        assert!(matches!(err, RegistryError::UploadNotFound(_)));

        let err = uploads.status(&name(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::UploadNotFound(_)));
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected() {
        let uploads = sessions(None).await;
        let status = uploads.open(&name()).await.unwrap();
        uploads.append(&name(), status.id, &b"abc"[..], None).await.unwrap();

        let err = uploads
            .append(&name(), status.id, &b"zzz"[..], Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::RangeNotSatisfiable { offset: 3 }));

        // The session survives a rejected range.
        assert_eq!(uploads.status(&name(), status.id).await.unwrap().offset, 3);
    }

    #[tokio::test]
    async fn oversized_upload_aborts_session() {
        let uploads = sessions(Some(4)).await;
        let status = uploads.open(&name()).await.unwrap();

        uploads.append(&name(), status.id, &b"abcd"[..], None).await.unwrap();
        let err = uploads
            .append(&name(), status.id, &b"e"[..], None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TooLarge { limit: 4 }));
        assert_eq!(uploads.len(), 0);
    }

    #[tokio::test]
    async fn abort_discards_staging() {
        let uploads = sessions(None).await;
        let status = uploads.open(&name()).await.unwrap();
        uploads.append(&name(), status.id, &b"abc"[..], None).await.unwrap();

        let staged = uploads.lock(&name(), status.id).await.unwrap().staged().to_owned();
        assert!(staged.exists());

        uploads.abort(&name(), status.id).await.unwrap();
        assert!(!staged.exists());
        assert!(uploads.abort(&name(), status.id).await.is_err());
    }

    #[tokio::test]
    async fn reaper_candidates() {
        let uploads = sessions(None).await;
        let status = uploads.open(&name()).await.unwrap();

        assert!(uploads.started_before(status.started).is_empty());
        let stale = uploads.started_before(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(stale, vec![(name(), status.id)]);
    }
}
