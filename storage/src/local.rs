use camino::{Utf8Path, Utf8PathBuf};
use eyre::Context;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Storage driver backed by a directory on the local filesystem.
///
/// Objects live at `<root>/<bucket>/b/<path>`. Uploads are written to a
/// hidden sibling file and renamed into place, so readers never observe a
/// partially written object.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path.push(remote);
        path
    }

    fn error(&self, err: std::io::Error, bucket: &str, remote: &Utf8Path) -> StorageError {
        StorageError::builder(self.name(), StorageErrorKind::from_io(&err), err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }
}

fn partial_path(target: &Utf8Path) -> Utf8PathBuf {
    let name = target.file_name().unwrap_or("object");
    target.with_file_name(format!(".{name}.partial-{}", uuid::Uuid::new_v4()))
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(err, bucket, remote))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| self.error(err, bucket, remote))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| self.error(err, bucket, remote))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let target = self.path(bucket, remote);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.error(err, bucket, remote))?;
        }

        let partial = partial_path(&target);
        let written = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&partial).await?);
            tokio::io::copy_buf(local, &mut writer).await?;
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            tokio::fs::rename(&partial, &target).await
        }
        .await;

        if let Err(err) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::debug!(%partial, "partial upload not removed: {cleanup}");
            }
            return Err(self.error(err, bucket, remote));
        }

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.error(err, bucket, remote))?,
        );

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(|err| self.error(err, bucket, remote))?;

        local
            .flush()
            .await
            .map_err(|err| self.error(err, bucket, remote))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.path(bucket, Utf8Path::new(""));
        let start = match prefix {
            Some(part) => root.join(part),
            None => root.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&root, &start))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<String>> {
    let mut files = Vec::new();
    if start.is_dir() {
        visit(start, &mut files)?;
    }

    let mut items: Vec<String> = files
        .into_iter()
        .filter(|p| !p.file_name().is_some_and(|name| name.starts_with('.')))
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_string()))
        .collect();
    items.sort();
    Ok(items)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn upload_replaces_atomically() {
        let (_dir, driver) = driver();
        let remote = Utf8Path::new("blobs/sha256/abc");

        let mut reader: &[u8] = b"first";
        driver.upload("b", remote, &mut reader).await.unwrap();
        let mut reader: &[u8] = b"second";
        driver.upload("b", remote, &mut reader).await.unwrap();

        let mut out = Vec::new();
        driver.download("b", remote, &mut out).await.unwrap();
        assert_eq!(out, b"second");

        let listed = driver.list("b", None).await.unwrap();
        assert_eq!(listed, vec!["blobs/sha256/abc"]);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_dir, driver) = driver();
        let err = driver
            .delete("b", Utf8Path::new("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let mut out = Vec::new();
        let err = driver
            .download("b", Utf8Path::new("nope"), &mut out)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_with_prefix() {
        let (_dir, driver) = driver();
        for path in ["blobs/sha256/a", "manifests/lib/app/sha256/b"] {
            let mut reader: &[u8] = b"x";
            driver
                .upload("b", Utf8Path::new(path), &mut reader)
                .await
                .unwrap();
        }

        let blobs = driver
            .list("b", Some(Utf8Path::new("blobs")))
            .await
            .unwrap();
        assert_eq!(blobs, vec!["blobs/sha256/a"]);

        let empty = driver
            .list("b", Some(Utf8Path::new("missing")))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
