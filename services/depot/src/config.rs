//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};

use camino::Utf8PathBuf;
use serde::Deserialize;
use storage::StorageConfig;

/// Configuration for a registry server, usually read from TOML.
///
/// ```toml
/// bind = "0.0.0.0:5000"
/// bucket = "registry"
/// staging = "/var/tmp/depot"
/// max-upload-size = 10737418240
///
/// [storage.local]
/// path = "/var/lib/depot"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegistryConfig {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Storage bucket holding blobs, manifests, and the metadata snapshot.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Storage backend.
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Local directory for uploads in progress. A temporary directory is
    /// used when unset.
    #[serde(default)]
    pub staging: Option<Utf8PathBuf>,

    /// Largest blob accepted, in bytes.
    #[serde(default)]
    pub max_upload_size: Option<u64>,
}

fn default_bind() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 5000).into()
}

fn default_bucket() -> String {
    "registry".to_owned()
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            bucket: default_bucket(),
            storage: default_storage(),
            staging: None,
            max_upload_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: RegistryConfig = toml_edit::de::from_str("").unwrap();
        assert_eq!(config, RegistryConfig::default());
        assert_eq!(config.bind.port(), 5000);
    }

    #[test]
    fn full_file() {
        let config: RegistryConfig = toml_edit::de::from_str(
            r#"
            bind = "0.0.0.0:8080"
            bucket = "images"
            staging = "/tmp/staging"
            max-upload-size = 1024

            [storage.local]
            path = "/srv/depot"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.bucket, "images");
        assert_eq!(config.staging.as_deref(), Some(camino::Utf8Path::new("/tmp/staging")));
        assert_eq!(config.max_upload_size, Some(1024));
        assert_eq!(
            config.storage,
            StorageConfig::Local {
                path: "/srv/depot".into()
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml_edit::de::from_str::<RegistryConfig>("buckets = \"x\"").is_err());
    }
}
