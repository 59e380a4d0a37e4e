//! Manifest operations for the registry

use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;

use crate::api::{CONTENT_DIGEST_HEADER, Registry, next_link, with_link};
use crate::authz::Action;
use crate::error::{RegistryError, RegistryResult};
use crate::metadata::ManifestRecord;
use crate::names::Reference;
use crate::storage::Page;

/// Largest manifest body accepted on PUT.
pub(crate) const MANIFEST_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Router for manifest operations
pub(crate) fn router() -> Router<Registry> {
    Router::new()
        .route(
            "/v2/{namespace}/{repository}/manifests/{reference}",
            get(get_manifest)
                .head(head_manifest)
                .put(put_manifest)
                .delete(delete_manifest)
                .layer(DefaultBodyLimit::max(MANIFEST_BODY_LIMIT)),
        )
        .route("/v2/{namespace}/{repository}/tags/list", get(list_tags))
}

/// Turn a body extraction failure into a registry error.
fn manifest_body(body: Result<Bytes, BytesRejection>) -> RegistryResult<Bytes> {
    body.map_err(|rejection| match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => RegistryError::TooLarge {
            limit: MANIFEST_BODY_LIMIT as u64,
        },
        _ => RegistryError::InvalidManifest(rejection.body_text()),
    })
}

fn manifest_headers(record: &ManifestRecord) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, record.media_type.clone()),
        (CONTENT_DIGEST_HEADER, record.digest.to_string()),
        (header::CONTENT_LENGTH, record.size.to_string()),
    ]
}

/// Get a manifest
async fn get_manifest(
    State(registry): State<Registry>,
    Path((namespace, repository, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Pull)
        .await?;
    let reference: Reference = reference.parse()?;

    let (record, body) = registry.storage().get_manifest(&name, &reference).await?;

    Ok((StatusCode::OK, manifest_headers(&record), body).into_response())
}

/// Check if a manifest exists
async fn head_manifest(
    State(registry): State<Registry>,
    Path((namespace, repository, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Pull)
        .await?;
    let reference: Reference = reference.parse()?;

    let (record, _) = registry.storage().get_manifest(&name, &reference).await?;

    Ok((StatusCode::OK, manifest_headers(&record)).into_response())
}

/// Put a manifest
async fn put_manifest(
    State(registry): State<Registry>,
    Path((namespace, repository, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Push)
        .await?;
    let body = manifest_body(body)?;

    let tag = match reference.parse()? {
        Reference::Tag(tag) => tag,
        Reference::Digest(_) => {
            return Err(RegistryError::InvalidTag(format!(
                "{reference}: manifests are published by tag"
            )));
        }
    };

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let record = registry
        .storage()
        .put_manifest(&name, &tag, content_type, body)
        .await?;

    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION,
                format!("/v2/{name}/manifests/{}", record.digest),
            ),
            (CONTENT_DIGEST_HEADER, record.digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_owned()),
        ],
    )
        .into_response())
}

/// Delete a manifest
async fn delete_manifest(
    State(registry): State<Registry>,
    Path((namespace, repository, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> RegistryResult<StatusCode> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Delete)
        .await?;

    let digest = match reference.parse()? {
        Reference::Digest(digest) => digest,
        Reference::Tag(tag) => {
            return Err(RegistryError::InvalidDigest(format!(
                "{tag}: manifests are deleted by digest"
            )));
        }
    };

    registry.storage().delete_manifest(&name, &digest).await?;
    Ok(StatusCode::ACCEPTED)
}

/// List tags for a repository
async fn list_tags(
    State(registry): State<Registry>,
    Path((namespace, repository)): Path<(String, String)>,
    Query(page): Query<Page>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let name = registry
        .repository(&headers, &namespace, &repository, Action::Pull)
        .await?;

    let (tags, more) = registry.storage().list_tags(&name, &page).await?;
    let next = more.then(|| next_link(&format!("/v2/{name}/tags/list"), &page, tags.last()));

    Ok(with_link(
        Json(TagList {
            name: name.to_string(),
            tags,
        })
        .into_response(),
        next,
    ))
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}
