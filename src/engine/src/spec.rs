//! OCI image-spec wire types.
//!
//! Serde representations of the JSON documents the engine reads and writes:
//! descriptors, indexes, manifests, the layout marker, and the image
//! configuration. The configuration carries the flattened Docker-compat
//! fields (`variant`, `os.version`, `os.features`) alongside the standard
//! ones; they are emitted only when present.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::Digest;

/// Name of the layout marker file inside an OCI image layout.
pub const IMAGE_LAYOUT_FILE: &str = "oci-layout";

/// The layout version this engine reads and writes.
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// Media types the engine knows how to interpret.
///
/// Closed enumeration with an explicit string mapping; anything else is
/// preserved verbatim in [`MediaType::Other`] so unknown descriptors survive
/// a round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    /// `application/vnd.oci.image.index.v1+json`
    ImageIndex,
    /// `application/vnd.docker.distribution.manifest.list.v2+json`
    DockerManifestList,
    /// `application/vnd.oci.image.manifest.v1+json`
    ImageManifest,
    /// `application/vnd.docker.distribution.manifest.v2+json`
    DockerManifest,
    /// `application/vnd.oci.image.config.v1+json`
    ImageConfig,
    /// `application/vnd.oci.image.layer.v1.tar+gzip`
    ImageLayerGzip,
    /// `application/vnd.docker.image.rootfs.diff.tar.gzip`
    DockerLayerGzip,
    /// `application/vnd.docker.image.rootfs.foreign.diff.tar.gzip`
    DockerForeignLayerGzip,
    /// `application/vnd.oci.image.layer.nondistributable.v1.tar+gzip`
    LayerNonDistributableGzip,
    Other(String),
}

const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const MEDIA_TYPE_IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const MEDIA_TYPE_DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
const MEDIA_TYPE_LAYER_NONDISTRIBUTABLE_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
const MEDIA_TYPE_LAYER_NONDISTRIBUTABLE_PREFIX: &str =
    "application/vnd.oci.image.layer.nondistributable.";

impl MediaType {
    pub fn as_str(&self) -> &str {
        match self {
            MediaType::ImageIndex => MEDIA_TYPE_IMAGE_INDEX,
            MediaType::DockerManifestList => MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MediaType::ImageManifest => MEDIA_TYPE_IMAGE_MANIFEST,
            MediaType::DockerManifest => MEDIA_TYPE_DOCKER_MANIFEST,
            MediaType::ImageConfig => MEDIA_TYPE_IMAGE_CONFIG,
            MediaType::ImageLayerGzip => MEDIA_TYPE_IMAGE_LAYER_GZIP,
            MediaType::DockerLayerGzip => MEDIA_TYPE_DOCKER_LAYER_GZIP,
            MediaType::DockerForeignLayerGzip => MEDIA_TYPE_DOCKER_FOREIGN_LAYER_GZIP,
            MediaType::LayerNonDistributableGzip => MEDIA_TYPE_LAYER_NONDISTRIBUTABLE_GZIP,
            MediaType::Other(s) => s,
        }
    }

    /// True for the media types accepted as image indexes (manifest lists).
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::ImageIndex | MediaType::DockerManifestList)
    }

    /// True for the media types accepted as single-image manifests.
    pub fn is_manifest(&self) -> bool {
        matches!(self, MediaType::ImageManifest | MediaType::DockerManifest)
    }

    /// Rewrite Docker layer media types to their OCI equivalents.
    ///
    /// The Docker gzip layer becomes the OCI gzip layer; the foreign variant
    /// becomes the OCI nondistributable type, which the loader then rejects.
    pub fn normalized_layer(self) -> MediaType {
        match self {
            MediaType::DockerLayerGzip => MediaType::ImageLayerGzip,
            MediaType::DockerForeignLayerGzip => MediaType::LayerNonDistributableGzip,
            other => other,
        }
    }

    /// True for layer types that carry redistribution restrictions.
    pub fn is_nondistributable(&self) -> bool {
        match self {
            MediaType::LayerNonDistributableGzip => true,
            MediaType::Other(s) => s.starts_with(MEDIA_TYPE_LAYER_NONDISTRIBUTABLE_PREFIX),
            _ => false,
        }
    }
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        match s {
            MEDIA_TYPE_IMAGE_INDEX => MediaType::ImageIndex,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST => MediaType::DockerManifestList,
            MEDIA_TYPE_IMAGE_MANIFEST => MediaType::ImageManifest,
            MEDIA_TYPE_DOCKER_MANIFEST => MediaType::DockerManifest,
            MEDIA_TYPE_IMAGE_CONFIG => MediaType::ImageConfig,
            MEDIA_TYPE_IMAGE_LAYER_GZIP => MediaType::ImageLayerGzip,
            MEDIA_TYPE_DOCKER_LAYER_GZIP => MediaType::DockerLayerGzip,
            MEDIA_TYPE_DOCKER_FOREIGN_LAYER_GZIP => MediaType::DockerForeignLayerGzip,
            MEDIA_TYPE_LAYER_NONDISTRIBUTABLE_GZIP => MediaType::LayerNonDistributableGzip,
            other => MediaType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MediaType::from(s.as_str()))
    }
}

/// A reference to a blob: its media type, digest, and exact byte length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The target execution environment of a platform-specific image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(
        rename = "os.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
    #[serde(
        rename = "os.features",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// OCI image index (or Docker manifest list): a collection of manifest
/// descriptors selecting per-platform images.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// OCI image manifest: one config blob plus ordered layer blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Contents of the `oci-layout` marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub version: String,
}

/// OCI image configuration, including the flattened Docker-compat platform
/// fields the upstream spec describes but many tools omit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(
        rename = "os.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
    #[serde(
        rename = "os.features",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecConfig>,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// The execution parameters of an image config (`config` key).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(
        rename = "ExposedPorts",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Volumes", default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "StopSignal", default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

/// The `rootfs` key of an image config: ordered diff IDs of the layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        RootFs {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One entry of an image config's `history` array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}
