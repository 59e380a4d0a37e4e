//! Content store: digest-addressed objects in the storage bucket, plus a
//! local staging directory for uploads in progress.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use storage::StorageBucket;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use uuid::Uuid;

use crate::digest::{Algorithm, Digest};
use crate::error::RegistryResult;
use crate::names::RepositoryName;

const HASH_BUFFER_SIZE: usize = 64 * 1024;
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of appending to a staged upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Staged {
    /// All bytes were written.
    Written(u64),
    /// The stream carried more bytes than the remaining allowance.
    Exceeded,
}

#[derive(Debug)]
struct StagingDir {
    root: Utf8PathBuf,
    _temp: Option<tempfile::TempDir>,
}

#[derive(Debug, Clone)]
pub(crate) struct ContentStore {
    bucket: StorageBucket,
    staging: Arc<StagingDir>,
}

impl ContentStore {
    /// Open a content store. Without a staging directory, a temporary one is
    /// created and removed when the last handle is dropped.
    pub(crate) async fn open(
        bucket: StorageBucket,
        staging: Option<Utf8PathBuf>,
    ) -> io::Result<Self> {
        let staging = match staging {
            Some(root) => {
                tokio::fs::create_dir_all(&root).await?;
                StagingDir { root, _temp: None }
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("depot-staging-")
                    .tempdir()?;
                let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).map_err(
                    |path| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("staging path is not UTF-8: {}", path.display()),
                        )
                    },
                )?;
                StagingDir {
                    root,
                    _temp: Some(temp),
                }
            }
        };

        tracing::debug!(staging = %staging.root, bucket = %bucket.name(), "Opened content store");
        Ok(Self {
            bucket,
            staging: Arc::new(staging),
        })
    }

    pub(crate) fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    pub(crate) fn staging_path(&self, id: Uuid) -> Utf8PathBuf {
        self.staging.root.join(id.to_string())
    }

    pub(crate) fn blob_path(digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("blobs/{}/{}", digest.algorithm(), digest.hex()))
    }

    pub(crate) fn manifest_path(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "manifests/{}/{}/{}/{}",
            name.namespace(),
            name.repository(),
            digest.algorithm(),
            digest.hex()
        ))
    }

    /// Create an empty staging file.
    pub(crate) async fn create_staged(&self, staged: &Utf8Path) -> io::Result<()> {
        tokio::fs::File::create(staged).await?;
        Ok(())
    }

    /// Append `reader` to a staging file, writing at most `allowance` bytes.
    #[tracing::instrument(level = "debug", skip(self, reader))]
    pub(crate) async fn stage_write<R>(
        &self,
        staged: &Utf8Path,
        reader: R,
        allowance: u64,
    ) -> io::Result<Staged>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(staged)
            .await?;

        let mut limited = reader.take(allowance.saturating_add(1));
        let written = io::copy(&mut limited, &mut file).await?;
        file.flush().await?;

        if written > allowance {
            return Ok(Staged::Exceeded);
        }

        file.sync_data().await?;
        Ok(Staged::Written(written))
    }

    /// Hash a staging file.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn digest_staged(
        &self,
        staged: &Utf8Path,
        algorithm: Algorithm,
    ) -> io::Result<Digest> {
        let mut file = tokio::fs::File::open(staged).await?;
        let mut hasher = algorithm.hasher();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finalize())
    }

    /// Move staged content to its final location.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn commit(&self, staged: &Utf8Path, location: &Utf8Path) -> RegistryResult<()> {
        self.bucket.upload_file(location, staged).await?;
        if let Err(error) = self.discard(staged).await {
            tracing::warn!(%staged, %error, "Failed to remove staged upload");
        }
        Ok(())
    }

    /// Remove staged content. A missing file is not an error.
    pub(crate) async fn discard(&self, staged: &Utf8Path) -> io::Result<()> {
        match tokio::fs::remove_file(staged).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, data), fields(size = data.len()))]
    pub(crate) async fn put(&self, location: &Utf8Path, data: &[u8]) -> RegistryResult<()> {
        let mut reader = data;
        self.bucket.upload(location, &mut reader).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn read(&self, location: &Utf8Path) -> Result<Bytes, storage::StorageError> {
        let mut data: Vec<u8> = Vec::new();
        self.bucket.download(location, &mut data).await?;
        Ok(Bytes::from(data))
    }

    /// Stream an object without buffering it. `guard` is held by the copying
    /// task until the last byte has been handed to the reader.
    #[tracing::instrument(level = "debug", skip(self, guard))]
    pub(crate) async fn stream<G>(
        &self,
        location: &Utf8Path,
        guard: G,
    ) -> Result<DuplexStream, storage::StorageError>
    where
        G: Send + 'static,
    {
        self.bucket.metadata(location).await?;

        let (mut writer, reader) = io::duplex(STREAM_BUFFER_SIZE);
        let bucket = self.bucket.clone();
        let location = location.to_owned();
        tokio::spawn(async move {
            let _guard = guard;
            match bucket.download(&location, &mut writer).await {
                Ok(()) => {
                    let _ = writer.shutdown().await;
                }
                Err(error) => tracing::warn!(%location, %error, "Object stream ended early"),
            }
        });

        Ok(reader)
    }

    /// Remove an object. A missing object is not an error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn remove(&self, location: &Utf8Path) -> Result<(), storage::StorageError> {
        match self.bucket.delete(location).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::debug!(%location, "Object already removed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
