//! Remote registries implementing the OCI Distribution Specification.
//!
//! The [`load`] entry point builds an image index over a registry-backed
//! [`Loader`]; [`push`] uploads a finished image. Transport,
//! authentication, and not-found failures surface as the corresponding
//! [`ImageError`](crate::error::ImageError) variants so callers can tell
//! them apart.

mod auth;
mod push;
mod reference;

pub use push::push;
pub use reference::ImageReference;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{header, Method, StatusCode, Url};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::digest::Digest;
use crate::error::{ImageError, Result};
use crate::image::{BlobReader, Index};
use crate::loader::Loader;

use auth::{parse_challenge, Authenticator};

/// Accept header offered when fetching manifests.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json,\
application/vnd.docker.distribution.manifest.list.v2+json,\
application/vnd.oci.image.manifest.v1+json,\
application/vnd.docker.distribution.manifest.v2+json";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Load an image index from a remote registry reference.
pub async fn load(reference: &str, cancel: &CancellationToken) -> Result<Index> {
    let reference = ImageReference::parse(reference)?;
    debug!(%reference, "loading image from registry");
    let client = Arc::new(RegistryClient::new(reference)?);
    crate::loader::load(Arc::new(RegistryLoader { client }), cancel).await
}

/// HTTP plumbing for one repository: URL construction, bearer-token
/// acquisition, and error mapping.
pub(crate) struct RegistryClient {
    http: reqwest::Client,
    auth: Authenticator,
    reference: ImageReference,
    token: tokio::sync::Mutex<Option<String>>,
}

impl RegistryClient {
    pub(crate) fn new(reference: ImageReference) -> Result<RegistryClient> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ImageError::Transport(e.to_string()))?;
        let auth = Authenticator::from_env(http.clone());
        Ok(RegistryClient {
            http,
            auth,
            reference,
            token: tokio::sync::Mutex::new(None),
        })
    }

    pub(crate) fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn registry_host(&self) -> &str {
        // Docker Hub's registry lives on a different host than the name
        // used in references.
        if self.reference.registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            &self.reference.registry
        }
    }

    pub(crate) fn v2_url(&self, tail: &str) -> String {
        format!(
            "https://{}/v2/{}/{}",
            self.registry_host(),
            self.reference.repository,
            tail
        )
    }

    /// Perform a request with a retryable body, re-authenticating once if
    /// the registry answers 401 with a usable bearer challenge.
    pub(crate) async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(header::HeaderName, String)],
        body: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let build = |token: Option<String>| {
            let mut request = self.http.request(method.clone(), url);
            for (name, value) in headers {
                request = request.header(name, value.as_str());
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            request
        };

        let token = self.token.lock().await.clone();
        let response = self.send(build(token), cancel).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response, url);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .ok_or_else(|| {
                ImageError::Auth(format!(
                    "registry demanded authentication for {url} without a usable challenge"
                ))
            })?;
        let token = self.auth.fetch_token(&challenge).await?;
        *self.token.lock().await = Some(token.clone());

        let response = self.send(build(Some(token)), cancel).await?;
        check_status(response, url)
    }

    /// Perform a request whose body can only be streamed once. The bearer
    /// token must already have been established by a prior request.
    pub(crate) async fn request_streaming(
        &self,
        method: Method,
        url: Url,
        content_length: u64,
        body: reqwest::Body,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method, url.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, content_length)
            .body(body);
        if let Some(token) = self.token.lock().await.clone() {
            request = request.bearer_auth(token);
        }
        let response = self.send(request, cancel).await?;
        check_status(response, url.as_str())
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ImageError::Cancelled),
            response = request.send() => {
                response.map_err(|e| ImageError::Transport(e.to_string()))
            }
        }
    }
}

fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => ImageError::NotFound(url.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ImageError::Auth(format!("registry returned {status} for {url}"))
        }
        _ => ImageError::Transport(format!("unexpected status {status} from {url}")),
    })
}

fn response_reader(response: reqwest::Response) -> BlobReader {
    let stream = response.bytes_stream().map_err(io::Error::other);
    Box::new(StreamReader::new(Box::pin(stream)))
}

/// [`Loader`] implementation over the Distribution API.
struct RegistryLoader {
    client: Arc<RegistryClient>,
}

#[async_trait]
impl Loader for RegistryLoader {
    fn root_digest(&self) -> Option<Digest> {
        self.client.reference().digest.clone()
    }

    async fn open_root_manifest(&self, cancel: &CancellationToken) -> Result<BlobReader> {
        let url = self
            .client
            .v2_url(&format!("manifests/{}", self.client.reference().identifier()));
        let response = self
            .client
            .request(
                Method::GET,
                &url,
                &[(header::ACCEPT, MANIFEST_ACCEPT.to_string())],
                None,
                cancel,
            )
            .await?;
        Ok(response_reader(response))
    }

    async fn open_manifest(
        &self,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<BlobReader> {
        let url = self.client.v2_url(&format!("manifests/{digest}"));
        let response = self
            .client
            .request(
                Method::GET,
                &url,
                &[(header::ACCEPT, MANIFEST_ACCEPT.to_string())],
                None,
                cancel,
            )
            .await?;
        Ok(response_reader(response))
    }

    async fn open_blob(&self, digest: &Digest, cancel: &CancellationToken) -> Result<BlobReader> {
        let url = self.client.v2_url(&format!("blobs/{digest}"));
        let response = self
            .client
            .request(Method::GET, &url, &[], None, cancel)
            .await?;
        Ok(response_reader(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v2_url_shapes() {
        let client =
            RegistryClient::new(ImageReference::parse("ghcr.io/org/image:v1").unwrap()).unwrap();
        assert_eq!(
            client.v2_url("manifests/v1"),
            "https://ghcr.io/v2/org/image/manifests/v1"
        );
        assert_eq!(
            client.v2_url("blobs/uploads/"),
            "https://ghcr.io/v2/org/image/blobs/uploads/"
        );
    }

    #[test]
    fn test_docker_hub_host_rewrite() {
        let client = RegistryClient::new(ImageReference::parse("nginx").unwrap()).unwrap();
        assert_eq!(
            client.v2_url("manifests/latest"),
            "https://registry-1.docker.io/v2/library/nginx/manifests/latest"
        );
    }
}
