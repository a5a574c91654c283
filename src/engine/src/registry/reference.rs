//! OCI image reference parsing.
//!
//! Parses references like `ghcr.io/org/image:v1.2.3` or
//! `nginx@sha256:...` into structured components.

use std::fmt;

use crate::digest::Digest;
use crate::error::{ImageError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither a tag nor a digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port (e.g. `ghcr.io`,
    /// `localhost:5000`).
    pub registry: String,
    /// Repository path (e.g. `library/nginx`).
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Single names default to the Docker Hub library namespace, so
    /// `nginx` becomes `docker.io/library/nginx:latest`.
    pub fn parse(reference: &str) -> Result<ImageReference> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageError::SchemaViolation(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((left, digest)) => (left, Some(digest.parse::<Digest>()?)),
            None => (reference, None),
        };

        // A tag is whatever follows the last colon, as long as that colon
        // comes after the last slash; otherwise the colon belongs to a
        // registry port.
        let slash = name_tag.rfind('/');
        let colon = name_tag.rfind(':');
        let (name, tag) = match (slash, colon) {
            (_, None) => (name_tag, None),
            (Some(s), Some(c)) if c > s => (&name_tag[..c], Some(name_tag[c + 1..].to_string())),
            (Some(_), Some(_)) => (name_tag, None),
            (None, Some(c)) => {
                let after = &name_tag[c + 1..];
                if after.bytes().all(|b| b.is_ascii_digit()) {
                    (name_tag, None)
                } else {
                    (&name_tag[..c], Some(after.to_string()))
                }
            }
        };

        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(ImageError::SchemaViolation(format!(
                    "empty tag in image reference {reference:?}"
                )));
            }
        }

        let (registry, repository) = split_registry_repository(name)?;
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The identifier to fetch the root manifest by: the digest when
    /// present, else the tag.
    pub fn identifier(&self) -> String {
        if let Some(digest) = &self.digest {
            digest.to_string()
        } else {
            self.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string())
        }
    }
}

/// Split a name into registry and repository. The first path component is
/// a registry when it looks like a hostname (contains a dot or colon, or
/// is `localhost`).
fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some(slash) = name.find('/') {
        let first = &name[..slash];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repository = &name[slash + 1..];
            if repository.is_empty() {
                return Err(ImageError::SchemaViolation(format!(
                    "empty repository in image reference {name:?}"
                )));
            }
            return Ok((first.to_string(), repository.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
