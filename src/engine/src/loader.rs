//! Loading images through a polymorphic manifest/blob source.
//!
//! A [`Loader`] hands out byte streams for manifests and blobs; [`load`]
//! turns one into an [`Index`] of lazily constructed images. Manifest and
//! config bytes are verified against their digests as they are read; layer
//! blobs are passed through unverified because the engine never retains
//! them.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::image::{
    read_blob, BlobReader, BlobSource, Image, ImageSource, Index, IndexEntry, Layer,
};
use crate::spec::{Descriptor, ImageConfig, ImageIndex, Manifest, MediaType, Platform};

/// A source of manifest and blob bytes for container images.
///
/// Implemented by the in-memory archive layout and by the remote registry
/// client. Manifest streams are digest-verified by the consumer; blob
/// streams are not.
#[async_trait]
pub trait Loader: Send + Sync {
    /// The digest of the root manifest, when the source knows it. If
    /// present, the root manifest's content is verified against it.
    fn root_digest(&self) -> Option<Digest> {
        None
    }

    /// A reader over the JSON entrypoint manifest, which may be an image
    /// index, a manifest list, or a single image manifest.
    async fn open_root_manifest(&self, cancel: &CancellationToken) -> Result<BlobReader>;

    /// A reader over the manifest or index with the given digest.
    async fn open_manifest(&self, digest: &Digest, cancel: &CancellationToken)
        -> Result<BlobReader>;

    /// A reader over the raw blob with the given digest.
    async fn open_blob(&self, digest: &Digest, cancel: &CancellationToken) -> Result<BlobReader>;
}

/// Build an image index from `loader`. The returned index and every image
/// materialized from it keep using the same loader for configuration and
/// layer access.
pub async fn load(loader: Arc<dyn Loader>, cancel: &CancellationToken) -> Result<Index> {
    let mut core = ImageLoader {
        loader,
        root_index: ImageIndex::default(),
        nested: HashMap::new(),
        manifests: RwLock::new(HashMap::new()),
        configs: RwLock::new(HashMap::new()),
    };
    core.init_root_index(cancel).await?;
    core.load_nested_indexes(cancel).await?;
    Arc::new(core).build_index(cancel).await
}

struct ImageLoader {
    loader: Arc<dyn Loader>,

    // Root and nested indexes are fully resolved before any image handle is
    // handed out, so they are read without locking afterwards.
    root_index: ImageIndex,
    nested: HashMap<Digest, ImageIndex>,

    // Keyed by digest; deferred image handles may be driven from several
    // worker threads at once. The first writer for a digest wins, and since
    // values are content-addressed a racing second fetch computes the same
    // value anyway.
    manifests: RwLock<HashMap<Digest, Manifest>>,
    configs: RwLock<HashMap<Digest, ImageConfig>>,
}

impl ImageLoader {
    async fn init_root_index(&mut self, cancel: &CancellationToken) -> Result<()> {
        let reader = self.loader.open_root_manifest(cancel).await?;
        let content = read_blob(reader, cancel).await?;
        if let Some(expected) = self.loader.root_digest() {
            verify_bytes(&content, &expected)?;
        }

        #[derive(Deserialize)]
        struct RootPeek {
            #[serde(rename = "mediaType", default)]
            media_type: Option<MediaType>,
            #[serde(default)]
            manifests: Option<Vec<serde_json::Value>>,
        }

        let peek: RootPeek = serde_json::from_slice(&content)
            .map_err(|e| ImageError::SchemaViolation(format!("decoding root manifest: {e}")))?;

        let looks_like_index = peek.media_type.as_ref().is_some_and(MediaType::is_index)
            || peek.manifests.as_ref().is_some_and(|m| !m.is_empty());

        if looks_like_index {
            self.root_index = serde_json::from_slice(&content)
                .map_err(|e| ImageError::SchemaViolation(format!("decoding root index: {e}")))?;
            Ok(())
        } else if peek.media_type.as_ref().is_some_and(MediaType::is_manifest) {
            self.init_root_with_manifest(&content)
        } else {
            Err(ImageError::UnsupportedMediaType(
                peek.media_type
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "no media type on root manifest".to_string()),
            ))
        }
    }

    /// Synthesize a singleton index around a bare image manifest. The
    /// manifest is cached under its computed digest so later lookups stay
    /// local even when the loader cannot serve the root by digest.
    fn init_root_with_manifest(&mut self, content: &[u8]) -> Result<()> {
        let manifest: Manifest = serde_json::from_slice(content)
            .map_err(|e| ImageError::SchemaViolation(format!("decoding root manifest: {e}")))?;

        let digest = Digest::from_bytes(content);
        debug!(%digest, "treating root manifest as a singleton index");
        self.manifests
            .write()
            .unwrap()
            .insert(digest.clone(), manifest);

        self.root_index = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: vec![Descriptor {
                media_type: MediaType::ImageManifest,
                digest,
                size: content.len() as i64,
                platform: None,
                annotations: None,
            }],
            annotations: None,
        };
        Ok(())
    }

    /// Resolve the indexes referenced by the root index. Indexes nested
    /// deeper than one level are not followed.
    async fn load_nested_indexes(&mut self, cancel: &CancellationToken) -> Result<()> {
        for descriptor in self.root_index.manifests.clone() {
            if !descriptor.media_type.is_index() || self.nested.contains_key(&descriptor.digest) {
                continue;
            }
            let nested: ImageIndex = self.read_json_manifest(&descriptor.digest, cancel).await?;
            self.nested.insert(descriptor.digest.clone(), nested);
        }
        Ok(())
    }

    /// All manifest descriptors across the root index and its nested
    /// indexes, in index order.
    fn all_manifest_descriptors(&self) -> Vec<Descriptor> {
        let mut indexes: Vec<&ImageIndex> = vec![&self.root_index];
        for descriptor in &self.root_index.manifests {
            if descriptor.media_type.is_index() {
                if let Some(nested) = self.nested.get(&descriptor.digest) {
                    indexes.push(nested);
                }
            }
        }

        indexes
            .into_iter()
            .flat_map(|index| index.manifests.iter())
            .filter(|descriptor| descriptor.media_type.is_manifest())
            .cloned()
            .collect()
    }

    async fn build_index(self: Arc<Self>, cancel: &CancellationToken) -> Result<Index> {
        let descriptors = self.all_manifest_descriptors();
        let mut entries = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let platform = self.platform_for(&descriptor, cancel).await?;
            entries.push(IndexEntry::new(
                platform,
                Arc::new(LoaderImageSource {
                    loader: Arc::clone(&self),
                    descriptor,
                }),
            ));
        }
        Ok(Index::new(entries))
    }

    async fn platform_for(
        &self,
        descriptor: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<Platform> {
        if let Some(platform) = &descriptor.platform {
            return Ok(platform.clone());
        }

        let manifest = self.manifest(&descriptor.digest, cancel).await?;
        let config = self.config(&manifest.config.digest, cancel).await?;
        Ok(Platform {
            os: config.os.clone(),
            architecture: config.architecture.clone(),
            os_version: config.os_version.clone(),
            os_features: config.os_features.clone().filter(|f| !f.is_empty()),
            variant: config.variant.clone(),
        })
    }

    async fn build_image(
        &self,
        descriptor: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<Image> {
        let platform = self.platform_for(descriptor, cancel).await?;
        let manifest = self.manifest(&descriptor.digest, cancel).await?;
        let config = self.config(&manifest.config.digest, cancel).await?;

        if manifest.layers.len() != config.rootfs.diff_ids.len() {
            return Err(ImageError::SchemaViolation(
                "manifest layer count does not match diff ID count".to_string(),
            ));
        }

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (layer_descriptor, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
            if layer_descriptor.size < 0 {
                return Err(ImageError::SchemaViolation(format!(
                    "layer {} has a negative size",
                    layer_descriptor.digest
                )));
            }

            let mut descriptor = layer_descriptor.clone();
            descriptor.media_type = descriptor.media_type.normalized_layer();
            if descriptor.media_type.is_nondistributable() {
                return Err(ImageError::UnsupportedMediaType(format!(
                    "nondistributable layer {}",
                    descriptor.digest
                )));
            }

            let digest = descriptor.digest.clone();
            layers.push(Layer::new(
                descriptor,
                diff_id.clone(),
                Arc::new(LoaderBlob {
                    loader: Arc::clone(&self.loader),
                    digest,
                }),
            ));
        }

        Ok(Image {
            config,
            layers,
            platform,
            annotations: manifest.annotations,
        })
    }

    async fn manifest(&self, digest: &Digest, cancel: &CancellationToken) -> Result<Manifest> {
        {
            let cache = self.manifests.read().unwrap();
            if let Some(manifest) = cache.get(digest) {
                return Ok(manifest.clone());
            }
        }

        let manifest: Manifest = self.read_json_manifest(digest, cancel).await?;
        let mut cache = self.manifests.write().unwrap();
        Ok(cache.entry(digest.clone()).or_insert(manifest).clone())
    }

    async fn config(&self, digest: &Digest, cancel: &CancellationToken) -> Result<ImageConfig> {
        {
            let cache = self.configs.read().unwrap();
            if let Some(config) = cache.get(digest) {
                return Ok(config.clone());
            }
        }

        let config: ImageConfig = self.read_json_blob(digest, cancel).await?;
        let mut cache = self.configs.write().unwrap();
        Ok(cache.entry(digest.clone()).or_insert(config).clone())
    }

    async fn read_json_manifest<T: DeserializeOwned>(
        &self,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let reader = self.loader.open_manifest(digest, cancel).await?;
        let content = read_verified(reader, digest, cancel).await?;
        serde_json::from_slice(&content)
            .map_err(|e| ImageError::SchemaViolation(format!("decoding manifest {digest}: {e}")))
    }

    async fn read_json_blob<T: DeserializeOwned>(
        &self,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let reader = self.loader.open_blob(digest, cancel).await?;
        let content = read_verified(reader, digest, cancel).await?;
        serde_json::from_slice(&content)
            .map_err(|e| ImageError::SchemaViolation(format!("decoding blob {digest}: {e}")))
    }
}

/// A deferred image handle: the shared loader core plus the manifest
/// descriptor to materialize on demand.
struct LoaderImageSource {
    loader: Arc<ImageLoader>,
    descriptor: Descriptor,
}

#[async_trait]
impl ImageSource for LoaderImageSource {
    async fn get(&self, cancel: &CancellationToken) -> Result<Image> {
        self.loader.build_image(&self.descriptor, cancel).await
    }
}

/// A layer blob that defers to the loader on every open.
struct LoaderBlob {
    loader: Arc<dyn Loader>,
    digest: Digest,
}

#[async_trait]
impl BlobSource for LoaderBlob {
    async fn open(&self, cancel: &CancellationToken) -> Result<BlobReader> {
        self.loader.open_blob(&self.digest, cancel).await
    }
}

fn verify_bytes(content: &[u8], digest: &Digest) -> Result<()> {
    let mut verifier = digest.verifier();
    verifier.write_all(content)?;
    if !verifier.verified() {
        return Err(ImageError::DigestMismatch {
            digest: digest.clone(),
        });
    }
    Ok(())
}

async fn read_verified(
    reader: BlobReader,
    digest: &Digest,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let content = read_blob(reader, cancel).await?;
    verify_bytes(&content, digest)?;
    Ok(content)
}
