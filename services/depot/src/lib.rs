//! # Depot: a Docker Registry V2 server
//!
//! Depot stores image layers ("blobs") and image manifests for many
//! repositories, deduplicating identical content by digest and serving it back
//! over the [Docker Registry HTTP API V2](https://distribution.github.io/distribution/spec/api/).
//!
//! ## Features
//!
//! - Chunked and monolithic blob uploads, verified against the client's digest
//! - Content-addressed blob storage with reference counting across repositories
//! - Schema 1 and schema 2 (including OCI image) manifests
//! - Pluggable storage backend via the `storage` crate
//! - Pluggable authorization via [`Authorizer`]
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use depot::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let app = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .build()
//!     .await?;
//!
//! // Serve `app` with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod authz;
mod blob;
mod config;
mod content;
mod digest;
mod error;
mod manifest;
mod metadata;
mod names;
mod schema;
mod storage;
mod upload;

pub use api::{Registry, RegistryBuilder};
pub use authz::{Action, AllowAll, Authorizer, Subject};
pub use config::RegistryConfig;
pub use digest::{Algorithm, Digest};
pub use error::{RegistryError, RegistryResult};
pub use metadata::{Blob, CommitState, ManifestRecord};
pub use names::{Reference, RepositoryName, Tag};
pub use schema::Manifest;
pub use self::storage::{Page, RegistryStorage};
pub use upload::{SessionState, UploadStatus};
