//! Serializing an image back into an OCI Image Layout tar.

use std::io::Write;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::image::{read_blob, Image};
use crate::spec::{
    Descriptor, ImageIndex, ImageLayout, Manifest, MediaType, IMAGE_LAYOUT_FILE,
    IMAGE_LAYOUT_VERSION,
};
use crate::tarbuild;

/// Write `image` as a tar archive complying with the OCI Image Layout
/// Specification: every layer blob, the config blob, the manifest blob, an
/// `index.json` whose single descriptor carries the image platform, and the
/// `oci-layout` marker.
pub async fn write_image<W: Write>(
    image: &Image,
    cancel: &CancellationToken,
    sink: W,
) -> Result<()> {
    let mut writer = ImageWriter {
        tar: tarbuild::Builder::new(sink),
    };
    writer.write(image, cancel).await
}

struct ImageWriter<W: Write> {
    tar: tarbuild::Builder<W>,
}

impl<W: Write> ImageWriter<W> {
    async fn write(&mut self, image: &Image, cancel: &CancellationToken) -> Result<()> {
        for layer in &image.layers {
            if layer.descriptor.size < 0 {
                return Err(ImageError::SchemaViolation(format!(
                    "layer {} has a negative size",
                    layer.descriptor.digest
                )));
            }

            let reader = layer.open_blob(cancel).await?;
            let content = read_blob(reader, cancel).await?;
            if content.len() as i64 != layer.descriptor.size {
                return Err(ImageError::SchemaViolation(format!(
                    "layer {} is {} bytes, but its descriptor says {}",
                    layer.descriptor.digest,
                    content.len(),
                    layer.descriptor.size
                )));
            }

            debug!(digest = %layer.descriptor.digest, size = layer.descriptor.size, "writing layer blob");
            self.add_blob(&layer.descriptor.digest, layer.descriptor.size, &content)?;
        }

        let config_descriptor = self.add_json_blob(MediaType::ImageConfig, &image.config)?;

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MediaType::ImageManifest),
            config: config_descriptor,
            layers: image.layers.iter().map(|l| l.descriptor.clone()).collect(),
            annotations: image.annotations.clone(),
        };
        let mut manifest_descriptor = self.add_json_blob(MediaType::ImageManifest, &manifest)?;
        manifest_descriptor.platform = Some(image.platform.clone());

        self.add_json_file(
            "index.json",
            &ImageIndex {
                schema_version: 2,
                media_type: None,
                manifests: vec![manifest_descriptor],
                annotations: None,
            },
        )?;
        self.add_json_file(
            IMAGE_LAYOUT_FILE,
            &ImageLayout {
                version: IMAGE_LAYOUT_VERSION.to_string(),
            },
        )?;

        self.tar.finish()
    }

    fn add_blob(&mut self, digest: &Digest, size: i64, content: &[u8]) -> Result<()> {
        let mod_time = self.tar.default_mod_time();
        self.tar.add(
            &blob_path(digest),
            tarbuild::File {
                reader: content,
                size: size as u64,
                mode: 0o644,
                mod_time,
            },
        )
    }

    fn add_json_blob<T: Serialize>(&mut self, media_type: MediaType, value: &T) -> Result<Descriptor> {
        let encoded = must_json(value);
        let descriptor = Descriptor {
            media_type,
            digest: Digest::from_bytes(&encoded),
            size: encoded.len() as i64,
            platform: None,
            annotations: None,
        };
        self.tar.add_content(&blob_path(&descriptor.digest), &encoded)?;
        Ok(descriptor)
    }

    fn add_json_file<T: Serialize>(&mut self, path: &str, value: &T) -> Result<()> {
        self.tar.add_content(path, &must_json(value))
    }
}

fn blob_path(digest: &Digest) -> String {
    format!("blobs/{}/{}", digest.algorithm(), digest.encoded())
}

/// JSON-encode a spec value. The spec types are designed to represent JSON
/// documents, so a failure here is a programming error rather than a
/// runtime condition.
fn must_json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("OCI spec types are JSON-serializable")
}
