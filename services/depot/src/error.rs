//! Error types for the registry

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::digest::Digest;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository has no tags
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Upload session not found, or not owned by this repository
    #[error("upload not found: {0}")]
    UploadNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A manifest references a blob that was never committed
    #[error("manifest references unknown blob: {0}")]
    ManifestBlobUnknown(Digest),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: Digest,
        /// Actual digest
        actual: Digest,
    },

    /// Attempted to delete a blob that manifests still reference
    #[error("blob {digest} is referenced by {references} manifest(s)")]
    BlobInUse {
        /// The blob
        digest: Digest,
        /// Current reference count
        references: u64,
    },

    /// Upload exceeds the configured maximum size
    #[error("upload exceeds the maximum size of {limit} bytes")]
    TooLarge {
        /// Configured limit in bytes
        limit: u64,
    },

    /// Chunk does not start at the current upload offset
    #[error("range not satisfiable: upload is at offset {offset}")]
    RangeNotSatisfiable {
        /// Bytes received so far
        offset: u64,
    },

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// No credentials were presented and anonymous access was refused
    #[error("authentication required for {0}")]
    Unauthorized(String),

    /// Credentials were presented but do not grant access
    #[error("access denied for {0}")]
    Denied(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata snapshot could not be encoded or decoded
    #[error("metadata snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::RepositoryNotFound(_)
            | RegistryError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::ManifestBlobUnknown(_)
            | RegistryError::DigestMismatch { .. } => StatusCode::BAD_REQUEST,
            RegistryError::BlobInUse { .. } => StatusCode::CONFLICT,
            RegistryError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RegistryError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RegistryError::Denied(_) => StatusCode::FORBIDDEN,
            RegistryError::BlobUploadInvalid(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_)
            | RegistryError::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for V2 error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::BlobInUse { .. } | RegistryError::Denied(_) => "DENIED",
            RegistryError::TooLarge { .. } => "SIZE_INVALID",
            RegistryError::RangeNotSatisfiable { .. } | RegistryError::BlobUploadInvalid(_) => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::Unauthorized(_) => "UNAUTHORIZED",
            RegistryError::Storage(_) | RegistryError::Io(_) | RegistryError::Snapshot(_) => {
                "UNKNOWN"
            }
        }
    }
}

/// V2 error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%code, "{message}");
        } else {
            tracing::debug!(%code, "{message}");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let RegistryError::RangeNotSatisfiable { offset } = &self {
            if let Ok(range) = HeaderValue::from_str(&crate::upload::range_header(*offset)) {
                response.headers_mut().insert(header::RANGE, range);
            }
        }
        response
    }
}
