use std::fmt;

use crate::digest;
use crate::error::{OciError, Result};

/// Docker Hub's registry API host.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest reference (e.g. "latest" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    /// - `docker.io/library/nginx:1.25` (normalized to Docker Hub's API host)
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(invalid(raw, "empty image reference"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid(raw, "contains whitespace"));
        }

        // Split off the reference (tag or digest).
        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            // A digest wins over any tag in front of it (`repo:tag@sha256:…`).
            let name = &raw[..at_pos];
            let name = match name.rfind(':') {
                Some(c) if c > name.rfind('/').map(|p| p + 1).unwrap_or(0) => &name[..c],
                _ => name,
            };
            let digest = &raw[at_pos + 1..];
            if !digest::is_sha256_digest(digest) {
                return Err(invalid(raw, "digest must be sha256:<64 hex chars>"));
            }
            (name, digest.to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/', otherwise the
            // colon belongs to a registry port (e.g. "localhost:5000/repo").
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        if !digest::is_sha256_digest(&reference) && !valid_tag(&reference) {
            return Err(invalid(raw, "invalid tag"));
        }

        // A component is treated as a registry hostname when it contains a
        // dot or a colon (port), or is "localhost".
        let (registry, repository) = match name_part.find('/') {
            Some(slash_pos) => {
                let first = &name_part[..slash_pos];
                if first.contains('.') || first.contains(':') || first == "localhost" {
                    (
                        normalize_registry(first),
                        name_part[slash_pos + 1..].to_string(),
                    )
                } else {
                    (DOCKER_HUB_REGISTRY.to_string(), name_part.to_string())
                }
            }
            None => (DOCKER_HUB_REGISTRY.to_string(), name_part.to_string()),
        };

        // Docker Hub official images live under "library/".
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        if !valid_repository(&repository) {
            return Err(invalid(raw, "invalid repository name"));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Returns `true` when the reference pins a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        digest::is_sha256_digest(&self.reference)
    }

    /// The same repository and reference on another registry.
    pub fn with_registry(&self, registry: &str) -> Self {
        Self {
            registry: normalize_registry(registry.trim_end_matches('/')),
            repository: self.repository.clone(),
            reference: self.reference.clone(),
        }
    }

    /// Replace the project (first path component) of the repository.  A
    /// single-component repository gains `project` as its first component.
    pub fn with_project(&self, project: &str) -> Self {
        let name = match self.repository.split_once('/') {
            Some((_, rest)) => rest,
            None => self.repository.as_str(),
        };
        Self {
            registry: self.registry.clone(),
            repository: format!("{}/{}", project.trim_matches('/'), name),
            reference: self.reference.clone(),
        }
    }

    /// The same repository pointing at another tag or digest.
    pub fn with_reference(&self, reference: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: reference.to_string(),
        }
    }

    /// First path component of the repository (Harbor's project name).
    pub fn project(&self) -> &str {
        self.repository
            .split('/')
            .next()
            .unwrap_or(self.repository.as_str())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, sep, self.reference
        )
    }
}

impl std::str::FromStr for ImageRef {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
pub fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

fn normalize_registry(host: &str) -> String {
    match host {
        "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

fn valid_repository(repo: &str) -> bool {
    !repo.is_empty()
        && repo.split('/').all(|c| {
            !c.is_empty()
                && c.bytes().all(|b| {
                    b.is_ascii_lowercase()
                        || b.is_ascii_digit()
                        || b == b'.'
                        || b == b'_'
                        || b == b'-'
                })
        })
}

fn invalid(raw: &str, reason: &str) -> OciError {
    OciError::InvalidReference {
        reference: raw.to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
