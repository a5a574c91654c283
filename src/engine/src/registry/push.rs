//! Pushing a finished image to a registry.
//!
//! Blob uploads follow the two-step Distribution flow: a POST opens an
//! upload session, a PUT with the digest query completes it. The config and
//! all layers are uploaded by a small pool of concurrent workers that fails
//! fast: the first error cancels the remaining uploads.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::{header, Method, Url};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::image::{Image, Layer};
use crate::spec::{Descriptor, Manifest, MediaType};

use super::{RegistryClient, ImageReference};

/// Layer uploads running at once.
const CONCURRENT_LAYER_UPLOADS: usize = 3;

/// Push `image` to the repository and tag named by `reference`.
pub async fn push(image: &Image, reference: &str, cancel: &CancellationToken) -> Result<()> {
    let reference = ImageReference::parse(reference)?;
    let tag = reference
        .tag
        .clone()
        .ok_or_else(|| ImageError::SchemaViolation(format!("push target {reference} has no tag")))?;
    let client = Arc::new(RegistryClient::new(reference)?);

    let config_encoded = serde_json::to_vec(&image.config)
        .map_err(|e| ImageError::SchemaViolation(format!("encoding image config: {e}")))?;
    let config_descriptor = Descriptor {
        media_type: MediaType::ImageConfig,
        digest: Digest::from_bytes(&config_encoded),
        size: config_encoded.len() as i64,
        platform: None,
        annotations: None,
    };

    let failed = cancel.child_token();
    let permits = Arc::new(Semaphore::new(CONCURRENT_LAYER_UPLOADS));
    let mut uploads = JoinSet::new();

    {
        let client = Arc::clone(&client);
        let cancel = failed.clone();
        let digest = config_descriptor.digest.clone();
        let bytes = Bytes::from(config_encoded);
        uploads.spawn(async move { client.upload_blob_bytes(&digest, bytes, &cancel).await });
    }

    for layer in &image.layers {
        let client = Arc::clone(&client);
        let cancel = failed.clone();
        let permits = Arc::clone(&permits);
        let layer = layer.clone();
        uploads.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| ImageError::Cancelled)?;
            if cancel.is_cancelled() {
                return Err(ImageError::Cancelled);
            }
            client.upload_layer(&layer, &cancel).await
        });
    }

    let mut first_error: Option<ImageError> = None;
    while let Some(joined) = uploads.join_next().await {
        let result = joined
            .unwrap_or_else(|e| Err(ImageError::Transport(format!("upload task failed: {e}"))));
        if let Err(err) = result {
            if first_error.is_none() {
                failed.cancel();
                first_error = Some(err);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    client
        .upload_manifest(image, config_descriptor, &tag, cancel)
        .await?;
    info!(reference = %client.reference(), "pushed image");
    Ok(())
}

impl RegistryClient {
    async fn has_blob(&self, digest: &Digest, cancel: &CancellationToken) -> Result<bool> {
        let url = self.v2_url(&format!("blobs/{digest}"));
        match self.request(Method::HEAD, &url, &[], None, cancel).await {
            Ok(_) => Ok(true),
            Err(ImageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Open an upload session and return the location to PUT the blob to.
    async fn blob_upload_url(&self, cancel: &CancellationToken) -> Result<Url> {
        let url = self.v2_url("blobs/uploads/");
        let response = self.request(Method::POST, &url, &[], None, cancel).await?;
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ImageError::Transport("upload session response had no Location".to_string())
            })?;

        let base = Url::parse(&url).map_err(|e| ImageError::Transport(e.to_string()))?;
        base.join(location)
            .map_err(|e| ImageError::Transport(e.to_string()))
    }

    async fn upload_blob_bytes(
        &self,
        digest: &Digest,
        bytes: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.has_blob(digest, cancel).await? {
            debug!(%digest, "blob already present, skipping upload");
            return Ok(());
        }

        let mut url = self.blob_upload_url(cancel).await?;
        url.query_pairs_mut().append_pair("digest", &digest.to_string());
        let size = bytes.len() as u64;
        self.request_streaming(Method::PUT, url, size, reqwest::Body::from(bytes), cancel)
            .await?;
        Ok(())
    }

    async fn upload_layer(&self, layer: &Layer, cancel: &CancellationToken) -> Result<()> {
        let digest = &layer.descriptor.digest;
        if self.has_blob(digest, cancel).await? {
            debug!(%digest, "layer already present, skipping upload");
            return Ok(());
        }

        debug!(%digest, size = layer.descriptor.size, "uploading layer");
        let mut url = self.blob_upload_url(cancel).await?;
        url.query_pairs_mut().append_pair("digest", &digest.to_string());

        let reader = layer.open_blob(cancel).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        self.request_streaming(
            Method::PUT,
            url,
            layer.descriptor.size as u64,
            body,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn upload_manifest(
        &self,
        image: &Image,
        config: Descriptor,
        tag: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MediaType::ImageManifest),
            config,
            layers: image.layers.iter().map(|l| l.descriptor.clone()).collect(),
            annotations: image.annotations.clone(),
        };
        let encoded = serde_json::to_vec(&manifest)
            .map_err(|e| ImageError::SchemaViolation(format!("encoding manifest: {e}")))?;

        let url = self.v2_url(&format!("manifests/{tag}"));
        self.request(
            Method::PUT,
            &url,
            &[(header::CONTENT_TYPE, MediaType::ImageManifest.to_string())],
            Some(encoded),
            cancel,
        )
        .await?;
        Ok(())
    }
}
