//! Parsing an OCI Image Layout out of a tar stream.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::digest::{Algorithm, Digest};
use crate::error::{ImageError, Result};
use crate::image::BlobReader;
use crate::loader::Loader;
use crate::spec::{ImageIndex, ImageLayout, IMAGE_LAYOUT_FILE};

/// An OCI image layout buffered in memory: the layout version, the root
/// index, and every blob keyed by its verified digest.
///
/// Built once by [`ArchiveLayout::load`] and immutable afterwards. Serves
/// as a [`Loader`] over its own blobs.
#[derive(Debug)]
pub struct ArchiveLayout {
    version: String,
    index: ImageIndex,
    index_bytes: Bytes,
    blobs: HashMap<Digest, Bytes>,
}

impl ArchiveLayout {
    /// Read an archive sequentially, collecting the layout marker, the root
    /// index, and all blobs. Each blob is verified against the digest its
    /// path spells out; other entries are ignored, and a later blob at the
    /// same path replaces an earlier one.
    pub fn load<R: Read>(reader: R) -> Result<ArchiveLayout> {
        let mut archive = tar::Archive::new(reader);
        let mut version: Option<String> = None;
        let mut index_bytes: Option<Vec<u8>> = None;
        let mut blobs = HashMap::new();

        let entries = archive
            .entries()
            .map_err(|e| ImageError::InvalidArchive(format!("reading archive: {e}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| ImageError::InvalidArchive(format!("reading archive: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            if name == IMAGE_LAYOUT_FILE {
                let layout: ImageLayout = read_json_entry(&mut entry, &name)?;
                version = Some(layout.version);
            } else if name == "index.json" {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                index_bytes = Some(content);
            } else if name.starts_with("blobs/") {
                let (digest, content) = read_blob_entry(&mut entry, &name)?;
                blobs.insert(digest, content);
            }
            // The layout spec permits additional files; they are skipped.
        }

        let version = match version {
            Some(v) if !v.is_empty() => v,
            _ => {
                return Err(ImageError::InvalidArchive(format!(
                    "missing or invalid {IMAGE_LAYOUT_FILE}"
                )))
            }
        };
        let index_bytes = index_bytes
            .ok_or_else(|| ImageError::InvalidArchive("missing index.json".to_string()))?;
        let index: ImageIndex = serde_json::from_slice(&index_bytes)
            .map_err(|e| ImageError::InvalidArchive(format!("decoding index.json: {e}")))?;

        debug!(blobs = blobs.len(), manifests = index.manifests.len(), "loaded image layout");
        Ok(ArchiveLayout {
            version,
            index,
            index_bytes: Bytes::from(index_bytes),
            blobs,
        })
    }

    pub fn layout_version(&self) -> &str {
        &self.version
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    fn blob_reader(&self, digest: &Digest) -> Result<BlobReader> {
        let bytes = self
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(format!("blob {digest} in archive")))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

#[async_trait]
impl Loader for ArchiveLayout {
    async fn open_root_manifest(&self, _cancel: &CancellationToken) -> Result<BlobReader> {
        Ok(Box::new(Cursor::new(self.index_bytes.clone())))
    }

    async fn open_manifest(
        &self,
        digest: &Digest,
        _cancel: &CancellationToken,
    ) -> Result<BlobReader> {
        self.blob_reader(digest)
    }

    async fn open_blob(&self, digest: &Digest, _cancel: &CancellationToken) -> Result<BlobReader> {
        self.blob_reader(digest)
    }
}

fn read_json_entry<T: serde::de::DeserializeOwned, R: Read>(
    entry: &mut R,
    name: &str,
) -> Result<T> {
    let mut content = Vec::new();
    entry.read_to_end(&mut content)?;
    serde_json::from_slice(&content)
        .map_err(|e| ImageError::InvalidArchive(format!("decoding {name}: {e}")))
}

/// Stream one `blobs/<alg>/<enc>` entry into memory, verifying it against
/// the digest its path names.
fn read_blob_entry<R: Read>(entry: &mut R, name: &str) -> Result<(Digest, Bytes)> {
    let digest = digest_from_blob_path(name)?;

    let mut content = Vec::new();
    let mut verifier = digest.verifier();
    let mut chunk = [0u8; 32 * 1024];
    loop {
        let n = entry.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        content.extend_from_slice(&chunk[..n]);
        verifier.write_all(&chunk[..n])?;
    }

    if !verifier.verified() {
        return Err(ImageError::DigestMismatch { digest });
    }
    Ok((digest, Bytes::from(content)))
}

/// Interpret the last two components of a blob path as `(algorithm,
/// encoded)`.
fn digest_from_blob_path(name: &str) -> Result<Digest> {
    let mut components = name.rsplit('/');
    let encoded = components.next();
    let algorithm = components.next();
    match (algorithm, encoded) {
        (Some(algorithm), Some(encoded)) => {
            let algorithm: Algorithm = algorithm.parse().map_err(|_| bad_blob_name(name))?;
            Digest::from_encoded(algorithm, encoded).map_err(|_| bad_blob_name(name))
        }
        _ => Err(bad_blob_name(name)),
    }
}

fn bad_blob_name(name: &str) -> ImageError {
    ImageError::InvalidArchive(format!(
        "blob name {name:?} does not match any supported digest format"
    ))
}
