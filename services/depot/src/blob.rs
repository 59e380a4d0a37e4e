//! Blob operations for the registry

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use crate::api::{CONTENT_DIGEST_HEADER, Registry, UPLOAD_UUID_HEADER};
use crate::authz::Action;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::names::RepositoryName;
use crate::upload::UploadStatus;

/// Router for blob operations
pub(crate) fn router() -> Router<Registry> {
    Router::new()
        .route(
            "/v2/{namespace}/{repository}/blobs/{digest}",
            get(get_blob).head(head_blob).delete(delete_blob),
        )
        .route(
            "/v2/{namespace}/{repository}/blobs/uploads",
            post(start_blob_upload),
        )
        .route(
            "/v2/{namespace}/{repository}/blobs/uploads/",
            post(start_blob_upload),
        )
        .route(
            "/v2/{namespace}/{repository}/blobs/uploads/{uuid}",
            get(upload_status)
                .patch(append_blob_upload)
                .put(complete_blob_upload)
                .delete(cancel_blob_upload),
        )
}

/// Stream a request body without buffering it.
fn body_reader(body: Body) -> impl AsyncRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(std::io::Error::other))
}

/// Get a blob
async fn get_blob(
    State(registry): State<Registry>,
    Path((namespace, repository, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    registry
        .repository(&headers, &namespace, &repository, Action::Pull)
        .await?;
    let digest: Digest = digest.parse()?;

    let (blob, reader) = registry.storage().get_blob(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, blob.size.to_string()),
            (CONTENT_DIGEST_HEADER, blob.digest.to_string()),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(registry): State<Registry>,
    Path((namespace, repository, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    registry
        .repository(&headers, &namespace, &repository, Action::Pull)
        .await?;
    let digest: Digest = digest.parse()?;

    let blob = registry.storage().blob(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, blob.size.to_string()),
            (CONTENT_DIGEST_HEADER, blob.digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a blob
async fn delete_blob(
    State(registry): State<Registry>,
    Path((namespace, repository, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<StatusCode> {
    registry
        .repository(&headers, &namespace, &repository, Action::Delete)
        .await?;
    let digest: Digest = digest.parse()?;

    registry.storage().delete_blob(&digest).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct DigestQuery {
    digest: Option<String>,
}

impl DigestQuery {
    fn parse(&self) -> RegistryResult<Option<Digest>> {
        self.digest.as_deref().map(str::parse::<Digest>).transpose()
    }
}

fn upload_accepted(status: &UploadStatus) -> Response {
    (
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, status.location()),
            (header::RANGE, status.range()),
            (UPLOAD_UUID_HEADER, status.id.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

fn blob_created(name: &RepositoryName, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (CONTENT_DIGEST_HEADER, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response()
}

fn parse_upload_id(uuid: &str) -> RegistryResult<Uuid> {
    Uuid::parse_str(uuid).map_err(|_| RegistryError::UploadNotFound(uuid.to_owned()))
}

/// The first offset named by a `Content-Range` header, `<start>-<end>` with an
/// optional `bytes ` prefix. A header that cannot be parsed never matches the
/// current offset.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?;
    let start = value
        .to_str()
        .ok()
        .map(|v| v.trim().trim_start_matches("bytes").trim())
        .and_then(|v| v.split_once('-'))
        .and_then(|(start, _)| start.parse().ok());
    Some(start.unwrap_or(u64::MAX))
}

/// Start a blob upload session, or upload a whole blob in one request when a
/// `digest` is given.
async fn start_blob_upload(
    State(registry): State<Registry>,
    Path((namespace, repository)): Path<(String, String)>,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Push)
        .await?;
    let digest = query.parse()?;

    let status = registry.storage().start_upload(&name).await?;

    match digest {
        None => Ok(upload_accepted(&status)),
        Some(digest) => {
            let blob = registry
                .storage()
                .commit_upload(&name, status.id, &digest, Some(body_reader(body)))
                .await?;
            Ok(blob_created(&name, &blob.digest))
        }
    }
}

/// Report how much of an upload has been received
async fn upload_status(
    State(registry): State<Registry>,
    Path((namespace, repository, uuid)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Push)
        .await?;
    let id = parse_upload_id(&uuid)?;

    let status = registry.storage().upload_status(&name, id).await?;

    Ok((
        StatusCode::NO_CONTENT,
        [
            (header::LOCATION, status.location()),
            (header::RANGE, status.range()),
            (UPLOAD_UUID_HEADER, status.id.to_string()),
        ],
    )
        .into_response())
}

/// Append a chunk to an upload
async fn append_blob_upload(
    State(registry): State<Registry>,
    Path((namespace, repository, uuid)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Push)
        .await?;
    let id = parse_upload_id(&uuid)?;

    let status = registry
        .storage()
        .append_upload(&name, id, body_reader(body), content_range_start(&headers))
        .await?;

    Ok(upload_accepted(&status))
}

/// Complete a blob upload
async fn complete_blob_upload(
    State(registry): State<Registry>,
    Path((namespace, repository, uuid)): Path<(String, String, String)>,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Push)
        .await?;
    let digest = query
        .parse()?
        .ok_or_else(|| RegistryError::InvalidDigest("missing digest parameter".to_owned()))?;
    let id = parse_upload_id(&uuid)?;

    let blob = registry
        .storage()
        .commit_upload(&name, id, &digest, Some(body_reader(body)))
        .await?;

    Ok(blob_created(&name, &blob.digest))
}

/// Cancel a blob upload
async fn cancel_blob_upload(
    State(registry): State<Registry>,
    Path((namespace, repository, uuid)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<StatusCode> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Push)
        .await?;
    let id = parse_upload_id(&uuid)?;

    registry.storage().abort_upload(&name, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range_start(&headers), None);

        headers.insert(header::CONTENT_RANGE, "0-1023".parse().unwrap());
        assert_eq!(content_range_start(&headers), Some(0));

        headers.insert(header::CONTENT_RANGE, "bytes 1024-2047/*".parse().unwrap());
        assert_eq!(content_range_start(&headers), Some(1024));

        headers.insert(header::CONTENT_RANGE, "garbage".parse().unwrap());
        assert_eq!(content_range_start(&headers), Some(u64::MAX));
    }

    #[test]
    fn digest_query() {
        let query = DigestQuery { digest: None };
        assert!(query.parse().unwrap().is_none());

        let query = DigestQuery {
            digest: Some("sha256:nope".into()),
        };
        assert!(matches!(query.parse(), Err(RegistryError::InvalidDigest(_))));
    }
}
