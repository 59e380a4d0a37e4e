//! Repository names and tags.

use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::RegistryError;

const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

/// `[a-z0-9]+(?:[._-][a-z0-9]+)*`
fn is_path_component(part: &str) -> bool {
    !part.is_empty()
        && part.split(['.', '_', '-']).all(|piece| {
            !piece.is_empty()
                && piece
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        })
}

/// A `namespace/repository` pair, the unit that owns tags and upload
/// sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName {
    namespace: String,
    repository: String,
}

impl RepositoryName {
    /// Validate and combine a namespace and repository.
    pub fn new(namespace: &str, repository: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidRepository(format!("{namespace}/{repository}"));

        if !is_path_component(namespace) || !is_path_component(repository) {
            return Err(invalid());
        }

        if namespace.len() + 1 + repository.len() > MAX_NAME_LENGTH {
            return Err(invalid());
        }

        Ok(Self {
            namespace: namespace.to_owned(),
            repository: repository.to_owned(),
        })
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The repository component.
    pub fn repository(&self) -> &str {
        &self.repository
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.repository)
    }
}

impl FromStr for RepositoryName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, repository) = s
            .split_once('/')
            .ok_or_else(|| RegistryError::InvalidRepository(s.to_owned()))?;
        RepositoryName::new(namespace, repository)
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RepositoryName> for String {
    fn from(value: RepositoryName) -> Self {
        value.to_string()
    }
}

/// A tag: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    /// The tag as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Tag {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

        let valid = match s.as_bytes() {
            [] => false,
            [first, rest @ ..] => {
                s.len() <= MAX_TAG_LENGTH
                    && word(*first)
                    && rest.iter().all(|&b| word(b) || b == b'.' || b == b'-')
            }
        };

        if valid {
            Ok(Tag(s.to_owned()))
        } else {
            Err(RegistryError::InvalidTag(s.to_owned()))
        }
    }
}

impl TryFrom<String> for Tag {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tag> for String {
    fn from(value: Tag) -> Self {
        value.0
    }
}

/// How a manifest is addressed in a URL: by tag or by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A tag such as `latest`.
    Tag(Tag),
    /// A manifest digest.
    Digest(Digest),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => fmt::Display::fmt(tag, f),
            Reference::Digest(digest) => fmt::Display::fmt(digest, f),
        }
    }
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse().map(Reference::Digest)
        } else {
            s.parse().map(Reference::Tag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        let name = RepositoryName::new("library", "ubuntu").unwrap();
        assert_eq!(name.to_string(), "library/ubuntu");
        assert_eq!("library/ubuntu".parse::<RepositoryName>().unwrap(), name);

        assert!(RepositoryName::new("my-org", "app.v2_x").is_ok());

        for (ns, repo) in [
            ("", "x"),
            ("Library", "x"),
            ("lib", "x--"),
            ("lib", "-x"),
            ("lib", "a..b"),
            ("lib", "a/b"),
            ("lib", ".."),
        ] {
            assert!(RepositoryName::new(ns, repo).is_err(), "{ns}/{repo}");
        }

        let long = "a".repeat(250);
        assert!(RepositoryName::new(&long, "abcdef").is_err());
    }

    #[test]
    fn tags() {
        for good in ["latest", "v1.0", "1", "_x", "A-b.C_d"] {
            assert!(good.parse::<Tag>().is_ok(), "{good}");
        }
        let max = "t".repeat(128);
        assert!(max.parse::<Tag>().is_ok());

        for bad in ["", ".x", "-x", "a:b", "a/b", "sha256:abc"] {
            assert!(bad.parse::<Tag>().is_err(), "{bad}");
        }
        let long = "t".repeat(129);
        assert!(long.parse::<Tag>().is_err());
    }

    #[test]
    fn references() {
        assert!(matches!("latest".parse::<Reference>(), Ok(Reference::Tag(_))));
        let digest = Digest::sha256(b"").to_string();
        assert!(matches!(digest.parse::<Reference>(), Ok(Reference::Digest(_))));
        assert!(matches!(
            "sha256:abc".parse::<Reference>(),
            Err(RegistryError::InvalidDigest(_))
        ));
        assert!(matches!(
            ".bad".parse::<Reference>(),
            Err(RegistryError::InvalidTag(_))
        ));
    }
}
