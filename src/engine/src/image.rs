//! Core types representing container images and their filesystem layers.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::spec::{Descriptor, ImageConfig, Platform};

/// A byte stream produced by a blob source or loader.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A factory for readers over one blob's bytes.
///
/// Every call to `open` returns an independently owned reader over the same
/// bytes, so distinct consumers (for example concurrent layer uploads) can
/// each stream the blob from the start.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn open(&self, cancel: &CancellationToken) -> Result<BlobReader>;
}

/// A blob held in memory. Opening it is free and never does I/O.
pub struct MemoryBlob {
    bytes: Bytes,
}

impl MemoryBlob {
    pub fn new(bytes: Bytes) -> MemoryBlob {
        MemoryBlob { bytes }
    }
}

#[async_trait]
impl BlobSource for MemoryBlob {
    async fn open(&self, _cancel: &CancellationToken) -> Result<BlobReader> {
        Ok(Box::new(io::Cursor::new(self.bytes.clone())))
    }
}

/// A single filesystem layer in a container image.
///
/// `descriptor.digest` names the compressed bytes; `diff_id` names the
/// uncompressed tar bytes, as recorded in the image config's rootfs.
#[derive(Clone)]
pub struct Layer {
    pub descriptor: Descriptor,
    pub diff_id: Digest,
    blob: Arc<dyn BlobSource>,
}

impl Layer {
    pub fn new(descriptor: Descriptor, diff_id: Digest, blob: Arc<dyn BlobSource>) -> Layer {
        Layer {
            descriptor,
            diff_id,
            blob,
        }
    }

    /// Open a fresh reader over the layer's compressed bytes.
    pub async fn open_blob(&self, cancel: &CancellationToken) -> Result<BlobReader> {
        self.blob.open(cancel).await
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("descriptor", &self.descriptor)
            .field("diff_id", &self.diff_id)
            .finish_non_exhaustive()
    }
}

/// A platform-specific container image.
#[derive(Debug, Clone, Default)]
pub struct Image {
    /// The OCI image configuration for this image.
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
    /// The `platform` value for this image in the `manifests` array of an
    /// OCI image index.
    pub platform: Platform,
    /// The `annotations` value of the image manifest.
    pub annotations: Option<std::collections::BTreeMap<String, String>>,
}

impl Image {
    /// Append `layer` and keep the config's diff IDs in sync.
    pub fn append_layer(&mut self, layer: Layer) {
        self.config.rootfs.diff_ids.push(layer.diff_id.clone());
        self.layers.push(layer);
    }

    /// Set the image platform and mirror it into the config fields.
    pub fn set_platform(&mut self, platform: Platform) {
        self.config.os = platform.os.clone();
        self.config.architecture = platform.architecture.clone();
        self.config.variant = platform.variant.clone();
        self.config.os_version = platform.os_version.clone();
        self.config.os_features = platform.os_features.clone();
        self.platform = platform;
    }
}

/// Deferred construction of one image out of an index.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn get(&self, cancel: &CancellationToken) -> Result<Image>;
}

/// A reference to a platform-specific image in an index, with deferred
/// image materialization.
#[derive(Clone)]
pub struct IndexEntry {
    pub platform: Platform,
    source: Arc<dyn ImageSource>,
}

impl IndexEntry {
    pub fn new(platform: Platform, source: Arc<dyn ImageSource>) -> IndexEntry {
        IndexEntry { platform, source }
    }

    /// Materialize the image this entry refers to.
    pub async fn get_image(&self, cancel: &CancellationToken) -> Result<Image> {
        self.source.get(cancel).await
    }
}

impl fmt::Debug for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexEntry")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

/// An image index: references to platform-specific images.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new(entries: Vec<IndexEntry>) -> Index {
        Index { entries }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The subset of entries whose platform satisfies `platform`, in the
    /// original index order.
    pub fn select_by_platform(&self, platform: &Platform) -> Index {
        Index {
            entries: self
                .entries
                .iter()
                .filter(|entry| platform.matches(&entry.platform))
                .cloned()
                .collect(),
        }
    }
}

/// Read a blob stream to the end, observing cancellation at every chunk
/// boundary.
pub(crate) async fn read_blob(
    mut reader: BlobReader,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 32 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(ImageError::Cancelled);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..n]);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::spec::MediaType;

    fn test_layer(content: &[u8]) -> Layer {
        let bytes = Bytes::copy_from_slice(content);
        let digest = Digest::from_bytes(content);
        Layer::new(
            Descriptor {
                media_type: MediaType::ImageLayerGzip,
                digest: digest.clone(),
                size: content.len() as i64,
                platform: None,
                annotations: None,
            },
            // Not a real diff ID, but fine for bookkeeping tests.
            Digest::from_bytes(&[content, &b"-uncompressed"[..]].concat()),
            Arc::new(MemoryBlob::new(bytes)),
        )
    }

    #[test]
    fn test_append_layer_keeps_diff_ids_in_sync() {
        let mut image = Image::default();
        for content in [&b"first"[..], &b"second"[..], &b"third"[..]] {
            image.append_layer(test_layer(content));
        }

        assert_eq!(image.layers.len(), image.config.rootfs.diff_ids.len());
        for (layer, diff_id) in image.layers.iter().zip(&image.config.rootfs.diff_ids) {
            assert_eq!(&layer.diff_id, diff_id);
        }
    }

    #[test]
    fn test_set_platform_mirrors_config_fields() {
        let mut image = Image::default();
        image.set_platform(Platform::parse("linux/arm/v7").unwrap());
        assert_eq!(image.config.os, "linux");
        assert_eq!(image.config.architecture, "arm");
        assert_eq!(image.config.variant.as_deref(), Some("v7"));
    }

    #[tokio::test]
    async fn test_memory_blob_supports_repeated_opens() {
        let blob = MemoryBlob::new(Bytes::from_static(b"blob bytes"));
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let reader = blob.open(&cancel).await.unwrap();
            let data = read_blob(reader, &cancel).await.unwrap();
            assert_eq!(data, b"blob bytes");
        }
    }

    #[tokio::test]
    async fn test_read_blob_observes_cancellation() {
        let blob = MemoryBlob::new(Bytes::from_static(b"blob bytes"));
        let cancel = CancellationToken::new();
        let reader = blob.open(&cancel).await.unwrap();
        cancel.cancel();
        let err = read_blob(reader, &cancel).await.unwrap_err();
        assert!(matches!(err, ImageError::Cancelled));
    }

    mod select_by_platform {
        use super::*;

        struct StubSource;

        #[async_trait]
        impl ImageSource for StubSource {
            async fn get(&self, _cancel: &CancellationToken) -> Result<Image> {
                Ok(Image::default())
            }
        }

        fn index_of(platforms: &[Platform]) -> Index {
            Index::new(
                platforms
                    .iter()
                    .map(|p| IndexEntry::new(p.clone(), Arc::new(StubSource)))
                    .collect(),
            )
        }

        fn platforms_of(index: &Index) -> Vec<String> {
            index
                .entries()
                .iter()
                .map(|e| e.platform.to_string())
                .collect()
        }

        #[test]
        fn test_full_match_for_single_platform() {
            let index = index_of(&[
                Platform::parse("linux/arm/v7").unwrap(),
                Platform::parse("linux/arm64/v8").unwrap(),
            ]);
            let selected = index.select_by_platform(&Platform::parse("linux/arm64/v8").unwrap());
            assert_eq!(platforms_of(&selected), ["linux/arm64/v8"]);
        }

        #[test]
        fn test_partial_match_ignores_missing_request_fields() {
            let index = index_of(&[
                Platform::parse("linux/arm/v7").unwrap(),
                Platform::parse("linux/arm64/v8").unwrap(),
            ]);
            let selected = index.select_by_platform(&Platform::parse("linux/arm64").unwrap());
            assert_eq!(platforms_of(&selected), ["linux/arm64/v8"]);
        }

        #[test]
        fn test_multiple_matches_keep_input_order() {
            let index = index_of(&[
                Platform::parse("linux/arm/v6").unwrap(),
                Platform::parse("linux/arm/v7").unwrap(),
                Platform::parse("linux/arm64/v8").unwrap(),
            ]);
            let selected = index.select_by_platform(&Platform::parse("linux/arm").unwrap());
            assert_eq!(platforms_of(&selected), ["linux/arm/v6", "linux/arm/v7"]);
        }

        #[test]
        fn test_no_match_yields_empty_index() {
            let index = index_of(&[
                Platform::parse("linux/amd64").unwrap(),
                Platform::parse("linux/arm64").unwrap(),
            ]);
            let selected = index.select_by_platform(&Platform::parse("windows/amd64").unwrap());
            assert!(selected.is_empty());
        }
    }
}
