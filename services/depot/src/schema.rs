//! Manifest documents.
//!
//! Two generations are accepted. Schema 1 lists layers as `fsLayers[].blobSum`
//! alongside a parallel `history` array; schema 2 (Docker v2 and OCI image
//! manifests) names a config blob and a list of layer descriptors. Both are
//! reduced to the ordered list of blob digests the manifest depends on.

use serde::Deserialize;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// Unsigned schema 1 manifest.
pub const SCHEMA1_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Signed schema 1 manifest.
pub const SCHEMA1_SIGNED_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 2 manifest.
pub const SCHEMA2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// OCI image manifest, handled as schema 2.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const LIST_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];

/// A parsed manifest.
#[derive(Debug, Clone)]
pub enum Manifest {
    /// Legacy schema 1.
    Schema1(SchemaOne),
    /// Schema 2 / OCI image manifest.
    Schema2(SchemaTwo),
}

/// Schema 1 document. Layers are listed most recent first.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaOne {
    /// Repository name recorded by the client.
    #[serde(default)]
    pub name: Option<String>,
    /// Tag recorded by the client.
    #[serde(default)]
    pub tag: Option<String>,
    /// Layer blobs, most recent first.
    pub fs_layers: Vec<FsLayer>,
    /// Per-layer image configuration, parallel to `fs_layers`.
    #[serde(default)]
    pub history: Vec<History>,
    #[serde(default)]
    signatures: Vec<serde_json::Value>,
}

/// One schema 1 layer.
#[derive(Debug, Clone, Deserialize)]
pub struct FsLayer {
    /// The layer digest.
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

/// One schema 1 history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct History {
    /// Embedded JSON image configuration.
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

#[derive(Debug, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    id: Option<String>,
}

impl SchemaOne {
    /// The id of the oldest image in the history, informational only.
    pub fn image_id(&self) -> Option<String> {
        let oldest = self.history.last()?;
        serde_json::from_str::<V1Compatibility>(&oldest.v1_compatibility)
            .ok()?
            .id
    }

    fn validate(&self) -> RegistryResult<()> {
        if self.fs_layers.is_empty() {
            return Err(RegistryError::InvalidManifest(
                "schema 1 manifest has no fsLayers".into(),
            ));
        }

        if self.history.len() != self.fs_layers.len() {
            return Err(RegistryError::InvalidManifest(format!(
                "schema 1 manifest has {} fsLayers but {} history entries",
                self.fs_layers.len(),
                self.history.len()
            )));
        }

        for (index, entry) in self.history.iter().enumerate() {
            serde_json::from_str::<V1Compatibility>(&entry.v1_compatibility).map_err(|err| {
                RegistryError::InvalidManifest(format!("history[{index}].v1Compatibility: {err}"))
            })?;
        }

        Ok(())
    }
}

/// Schema 2 document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaTwo {
    /// Declared media type, absent for some OCI manifests.
    #[serde(default)]
    pub media_type: Option<String>,
    /// The image configuration blob.
    pub config: Descriptor,
    /// Layer blobs, base layer first.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// A content descriptor inside a schema 2 manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Declared size of the referenced blob.
    #[serde(default)]
    pub size: u64,
    /// Digest of the referenced blob.
    pub digest: Digest,
}

impl Manifest {
    /// Parse a raw manifest body.
    pub fn parse(raw: &[u8]) -> RegistryResult<Self> {
        let document: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|err| RegistryError::InvalidManifest(format!("malformed JSON: {err}")))?;

        let version = document
            .get("schemaVersion")
            .ok_or_else(|| RegistryError::InvalidManifest("missing schemaVersion".into()))?;

        match version.as_u64() {
            Some(1) => {
                let manifest: SchemaOne = serde_json::from_value(document)
                    .map_err(|err| RegistryError::InvalidManifest(format!("schema 1: {err}")))?;
                manifest.validate()?;
                Ok(Manifest::Schema1(manifest))
            }
            Some(2) => {
                let is_list = document.get("manifests").is_some()
                    || document
                        .get("mediaType")
                        .and_then(|m| m.as_str())
                        .is_some_and(|m| LIST_MEDIA_TYPES.contains(&m));
                if is_list {
                    return Err(RegistryError::InvalidManifest(
                        "manifest lists are not supported".into(),
                    ));
                }

                let manifest: SchemaTwo = serde_json::from_value(document)
                    .map_err(|err| RegistryError::InvalidManifest(format!("schema 2: {err}")))?;
                Ok(Manifest::Schema2(manifest))
            }
            _ => Err(RegistryError::InvalidManifest(format!(
                "unsupported schemaVersion {version}"
            ))),
        }
    }

    /// 1 or 2.
    pub fn schema_version(&self) -> u8 {
        match self {
            Manifest::Schema1(_) => 1,
            Manifest::Schema2(_) => 2,
        }
    }

    /// The media type to serve this manifest with.
    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Schema1(m) if m.signatures.is_empty() => SCHEMA1_MEDIA_TYPE,
            Manifest::Schema1(_) => SCHEMA1_SIGNED_MEDIA_TYPE,
            Manifest::Schema2(m) => m.media_type.as_deref().unwrap_or(SCHEMA2_MEDIA_TYPE),
        }
    }

    /// Every blob this manifest depends on, in document order, without
    /// repeats. For schema 2 the config blob comes first.
    pub fn references(&self) -> Vec<Digest> {
        let all: Box<dyn Iterator<Item = &Digest>> = match self {
            Manifest::Schema1(m) => Box::new(m.fs_layers.iter().map(|layer| &layer.blob_sum)),
            Manifest::Schema2(m) => Box::new(
                std::iter::once(&m.config.digest).chain(m.layers.iter().map(|l| &l.digest)),
            ),
        };

        let mut references: Vec<Digest> = Vec::new();
        for digest in all {
            if !references.contains(digest) {
                references.push(digest.clone());
            }
        }
        references
    }

    /// Informational image id, schema 1 only.
    pub fn image_id(&self) -> Option<String> {
        match self {
            Manifest::Schema1(m) => m.image_id(),
            Manifest::Schema2(_) => None,
        }
    }

    /// Reject a request whose declared content type names the other schema
    /// generation. Unknown content types are ignored.
    pub fn check_content_type(&self, content_type: Option<&str>) -> RegistryResult<()> {
        let Some(content_type) = content_type else {
            return Ok(());
        };

        let declared = match content_type {
            SCHEMA1_MEDIA_TYPE | SCHEMA1_SIGNED_MEDIA_TYPE => 1,
            SCHEMA2_MEDIA_TYPE | OCI_MANIFEST_MEDIA_TYPE => 2,
            other if LIST_MEDIA_TYPES.contains(&other) => {
                return Err(RegistryError::InvalidManifest(
                    "manifest lists are not supported".into(),
                ));
            }
            _ => return Ok(()),
        };

        if declared != self.schema_version() {
            return Err(RegistryError::InvalidManifest(format!(
                "content type {content_type} does not match schemaVersion {}",
                self.schema_version()
            )));
        }

        Ok(())
    }
}
