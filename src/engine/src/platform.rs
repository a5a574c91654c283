//! Platform parsing, formatting, and matching.

use std::fmt;

use crate::error::{ImageError, Result};
use crate::spec::Platform;

impl Platform {
    /// Parse a platform from the slash-separated `os/arch[/variant]` form.
    pub fn parse(s: &str) -> Result<Platform> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(ImageError::SchemaViolation(format!(
                "platform {s:?} must have 2 or 3 slash separated parts"
            )));
        }
        if parts[0].is_empty() {
            return Err(ImageError::SchemaViolation(format!(
                "platform {s:?} is missing an OS"
            )));
        }
        if parts[1].is_empty() {
            return Err(ImageError::SchemaViolation(format!(
                "platform {s:?} is missing an architecture"
            )));
        }

        let mut platform = Platform {
            os: parts[0].to_string(),
            architecture: parts[1].to_string(),
            ..Platform::default()
        };
        if let Some(&variant) = parts.get(2) {
            if variant.is_empty() {
                return Err(ImageError::SchemaViolation(format!(
                    "platform {s:?} has an empty variant"
                )));
            }
            platform.variant = Some(variant.to_string());
        }
        Ok(platform)
    }

    /// The platform of the machine running this process, in the names used
    /// by container images.
    pub fn host() -> Platform {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            ..Platform::default()
        }
    }

    /// Whether `candidate` satisfies this platform when used as a request.
    ///
    /// Empty request fields are wildcards. Every requested `os_features`
    /// entry must appear in the candidate's features.
    pub fn matches(&self, candidate: &Platform) -> bool {
        if !self.architecture.is_empty() && self.architecture != candidate.architecture {
            return false;
        }
        if !self.os.is_empty() && self.os != candidate.os {
            return false;
        }
        if let Some(version) = &self.os_version {
            if candidate.os_version.as_ref() != Some(version) {
                return false;
            }
        }
        if let Some(features) = &self.os_features {
            let candidate_features: &[String] =
                candidate.os_features.as_deref().unwrap_or(&[]);
            if !features.iter().all(|f| candidate_features.contains(f)) {
                return false;
            }
        }
        if let Some(variant) = &self.variant {
            if candidate.variant.as_ref() != Some(variant) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Platform {
    /// Formats as `os/arch[/variant]`; version and feature fields do not
    /// take part in the slash-separated form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}
