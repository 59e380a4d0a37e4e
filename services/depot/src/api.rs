//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use camino::Utf8PathBuf;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::authz::{self, Action, AllowAll, Authorizer, SharedAuthorizer};
use crate::config::RegistryConfig;
use crate::error::RegistryResult;
use crate::names::RepositoryName;
use crate::storage::{Page, RegistryStorage};

pub(crate) const API_VERSION_HEADER: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");
pub(crate) const CONTENT_DIGEST_HEADER: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) const UPLOAD_UUID_HEADER: HeaderName = HeaderName::from_static("docker-upload-uuid");

const DEFAULT_BUCKET: &str = "registry";

/// Registry builder for configuring and creating the registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    staging: Option<Utf8PathBuf>,
    max_upload_size: Option<u64>,
    authorizer: Option<SharedAuthorizer>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a builder from a configuration file, constructing the
    /// storage backend it names.
    pub async fn from_config(config: &RegistryConfig) -> RegistryResult<Self> {
        let storage = config.storage.clone().build().await?;
        let mut builder = Self::new()
            .storage(storage)
            .bucket(config.bucket.clone());
        builder.staging = config.staging.clone();
        builder.max_upload_size = config.max_upload_size;
        Ok(builder)
    }

    /// Set the storage backend. Defaults to in-memory storage.
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Stage uploads in this local directory instead of a temporary one.
    pub fn staging(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.staging = Some(path.into());
        self
    }

    /// Refuse blobs larger than `bytes`.
    pub fn max_upload_size(mut self, bytes: u64) -> Self {
        self.max_upload_size = Some(bytes);
        self
    }

    /// Decide who may pull, push, and delete. Defaults to [`AllowAll`].
    pub fn authorizer<A: Authorizer + 'static>(mut self, authorizer: A) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Open the storage engine.
    pub async fn open(self) -> RegistryResult<Registry> {
        let storage = self
            .storage
            .unwrap_or_else(|| storage::MemoryStorage::new().into());
        let bucket = storage.bucket(self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_owned()));

        let storage = RegistryStorage::open(bucket, self.staging, self.max_upload_size).await?;
        let authorizer = self.authorizer.unwrap_or_else(|| Arc::new(AllowAll));

        Ok(Registry {
            storage,
            authorizer,
        })
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub async fn build(self) -> RegistryResult<Router> {
        Ok(self.open().await?.router())
    }
}

/// An opened registry: the storage engine plus its access policy.
#[derive(Debug, Clone)]
pub struct Registry {
    storage: RegistryStorage,
    authorizer: SharedAuthorizer,
}

impl Registry {
    /// The storage engine.
    pub fn storage(&self) -> &RegistryStorage {
        &self.storage
    }

    /// The HTTP API.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v2/", get(api_version_check))
            .route("/v2/_catalog", get(catalog))
            .merge(crate::blob::router())
            .merge(crate::manifest::router())
            .with_state(self.clone())
            .layer(SetResponseHeaderLayer::overriding(
                API_VERSION_HEADER,
                HeaderValue::from_static("registry/2.0"),
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Validate a repository name from the URL and check that the caller
    /// may perform `action` on it.
    pub(crate) async fn repository(
        &self,
        headers: &HeaderMap,
        namespace: &str,
        repository: &str,
        action: Action,
    ) -> RegistryResult<RepositoryName> {
        let name = RepositoryName::new(namespace, repository)?;
        authz::check(self.authorizer.as_ref(), headers, &name, action).await?;
        Ok(name)
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

#[derive(Debug, serde::Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

async fn catalog(State(registry): State<Registry>, Query(page): Query<Page>) -> Response {
    let (repositories, more) = registry.storage.list_repositories(&page).await;
    let next = more.then(|| next_link("/v2/_catalog", &page, repositories.last()));
    with_link(Json(Catalog { repositories }).into_response(), next)
}

/// `Link` header value pointing at the page after `last`.
pub(crate) fn next_link(path: &str, page: &Page, last: Option<&String>) -> String {
    let mut url = format!("{path}?");
    if let Some(n) = page.n {
        url.push_str(&format!("n={n}&"));
    }
    if let Some(last) = last {
        url.push_str(&format!("last={last}"));
    }
    format!("<{}>; rel=\"next\"", url.trim_end_matches(['&', '?']))
}

pub(crate) fn with_link(mut response: Response, link: Option<String>) -> Response {
    if let Some(value) = link.and_then(|link| HeaderValue::from_str(&link).ok()) {
        response.headers_mut().insert(header::LINK, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let registry = RegistryBuilder::new()
            .storage(storage.into())
            .bucket("test")
            .max_upload_size(1024)
            .open()
            .await
            .unwrap();

        let _router = registry.router();
        assert!(registry.storage().list_repositories(&Page::default()).await.0.is_empty());
    }

    #[tokio::test]
    async fn builder_from_config() {
        let config = RegistryConfig::default();
        let router = RegistryBuilder::from_config(&config)
            .await
            .unwrap()
            .build()
            .await;
        assert!(router.is_ok());
    }

    #[test]
    fn next_links() {
        let page = Page {
            n: Some(2),
            last: None,
        };
        assert_eq!(
            next_link("/v2/_catalog", &page, Some(&"library/b".to_owned())),
            "</v2/_catalog?n=2&last=library/b>; rel=\"next\""
        );
    }
}
