//! Authorization seam.
//!
//! The registry does not interpret credentials. Each repository-scoped
//! request hands the raw `Authorization` header, if any, to an
//! [`Authorizer`] together with the repository and the action requested.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};

use crate::error::{RegistryError, RegistryResult};
use crate::names::RepositoryName;

/// What a request wants to do to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read manifests, blobs, or tags.
    Pull,
    /// Upload blobs or publish manifests.
    Push,
    /// Remove manifests or blobs.
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Pull => f.write_str("pull"),
            Action::Push => f.write_str("push"),
            Action::Delete => f.write_str("delete"),
        }
    }
}

/// The opaque identity presented with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// No credentials were sent.
    Anonymous,
    /// The raw `Authorization` header value.
    Credentials(String),
}

impl Subject {
    /// Extract the subject from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map_or(Subject::Anonymous, |value| {
                Subject::Credentials(value.to_owned())
            })
    }

    /// True when no credentials were sent.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Subject::Anonymous)
    }
}

/// Decides whether a subject may perform an action on a repository.
#[async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Return true to allow the request.
    async fn authorize(&self, subject: &Subject, name: &RepositoryName, action: Action) -> bool;
}

/// Allows every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _subject: &Subject, _name: &RepositoryName, _action: Action) -> bool {
        true
    }
}

pub(crate) type SharedAuthorizer = Arc<dyn Authorizer>;

/// Ask `authorizer`, turning a refusal into the matching error.
pub(crate) async fn check(
    authorizer: &dyn Authorizer,
    headers: &HeaderMap,
    name: &RepositoryName,
    action: Action,
) -> RegistryResult<()> {
    let subject = Subject::from_headers(headers);
    if authorizer.authorize(&subject, name, action).await {
        return Ok(());
    }

    tracing::debug!(%name, %action, anonymous = subject.is_anonymous(), "Request refused");
    let scope = format!("{action} on {name}");
    if subject.is_anonymous() {
        Err(RegistryError::Unauthorized(scope))
    } else {
        Err(RegistryError::Denied(scope))
    }
}
