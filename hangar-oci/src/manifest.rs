use serde::{Deserialize, Serialize};

use crate::digest;
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Wire documents
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json or
/// application/vnd.docker.distribution.manifest.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

/// An OCI image index (application/vnd.oci.image.index.v1+json or
/// application/vnd.docker.distribution.manifest.list.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub manifests: Vec<Descriptor>,
}

/// A content-addressable descriptor used in both manifests and image indexes.
///
/// Two descriptors with the same digest refer to the same physical blob no
/// matter which image they came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: String,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform filter
// ---------------------------------------------------------------------------

/// Which children of an index a run keeps.  An empty list matches any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformFilter {
    architectures: Vec<String>,
    os: Vec<String>,
}

impl PlatformFilter {
    /// Build a filter.  Architecture aliases (`x86_64`, `aarch64`) are folded
    /// onto their OCI names; blank entries are ignored.
    pub fn new<A, O>(architectures: A, os: O) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        O: IntoIterator,
        O::Item: AsRef<str>,
    {
        let clean = |v: &str| v.trim().to_ascii_lowercase();
        Self {
            architectures: architectures
                .into_iter()
                .map(|a| normalize_arch(&clean(a.as_ref())))
                .filter(|a| !a.is_empty())
                .collect(),
            os: os
                .into_iter()
                .map(|o| clean(o.as_ref()))
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    /// True when the filter keeps every platform.
    pub fn is_empty(&self) -> bool {
        self.architectures.is_empty() && self.os.is_empty()
    }

    /// Whether a child with `platform` is kept.  A child without a platform
    /// only passes an empty filter.
    pub fn matches(&self, platform: Option<&Platform>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(p) = platform else {
            return false;
        };
        let arch = normalize_arch(&p.architecture.to_ascii_lowercase());
        let os = p.os.to_ascii_lowercase();
        (self.architectures.is_empty() || self.architectures.contains(&arch))
            && (self.os.is_empty() || self.os.contains(&os))
    }
}

impl std::fmt::Display for PlatformFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = |v: &[String]| if v.is_empty() { "*".to_string() } else { v.join(",") };
        write!(f, "os={} arch={}", list(&self.os), list(&self.architectures))
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" | "x86-64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// A pulled manifest or index, kept together with its original bytes so it
/// can be re-emitted verbatim.  The digest always describes `raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub media_type: String,
    pub digest: String,
    /// Config followed by layers for an image manifest; child manifests for
    /// an index.
    pub descriptors: Vec<Descriptor>,
    pub raw: Vec<u8>,
}

impl Manifest {
    /// Parse raw manifest bytes.  `content_type` is the registry's
    /// `Content-Type` header and is only consulted when the document does not
    /// carry its own `mediaType`.
    pub fn from_bytes(raw: Vec<u8>, content_type: Option<&str>) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| OciError::Manifest(format!("invalid manifest JSON: {}", e)))?;

        let declared = value.get("mediaType").and_then(|v| v.as_str());
        let schema = value
            .get("schemaVersion")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if schema == 1 {
            return Err(OciError::UnsupportedMediaType(
                MEDIA_TYPE_DOCKER_SCHEMA1.to_string(),
            ));
        }

        let media_type = match declared.or(content_type.map(strip_params)) {
            Some(mt) if !mt.is_empty() => mt.to_string(),
            // OCI manifests may omit mediaType entirely; fall back to shape.
            _ if value.get("manifests").is_some() => MEDIA_TYPE_OCI_INDEX.to_string(),
            _ => MEDIA_TYPE_OCI_MANIFEST.to_string(),
        };

        let descriptors = if is_index_media_type(&media_type) {
            let idx: ImageIndex = serde_json::from_value(value)?;
            idx.manifests
        } else if is_manifest_media_type(&media_type) {
            let m: OciManifest = serde_json::from_value(value)?;
            let mut d = Vec::with_capacity(m.layers.len() + 1);
            d.push(m.config);
            d.extend(m.layers);
            d
        } else {
            return Err(OciError::UnsupportedMediaType(media_type));
        };

        for desc in &descriptors {
            if !digest::is_sha256_digest(&desc.digest) {
                return Err(OciError::Manifest(format!(
                    "descriptor has unsupported digest {:?}",
                    desc.digest
                )));
            }
        }

        Ok(Self {
            digest: digest::sha256_digest(&raw),
            media_type,
            descriptors,
            raw,
        })
    }

    /// Returns `true` for image indexes / manifest lists.
    pub fn is_index(&self) -> bool {
        is_index_media_type(&self.media_type)
    }

    /// Blobs referenced directly by an image manifest (config + layers).
    /// Empty for an index, whose descriptors are manifests, not blobs.
    pub fn blobs(&self) -> &[Descriptor] {
        if self.is_index() {
            &[]
        } else {
            &self.descriptors
        }
    }

    /// Child manifests of an index.  Empty for an image manifest.
    pub fn children(&self) -> &[Descriptor] {
        if self.is_index() {
            &self.descriptors
        } else {
            &[]
        }
    }

    /// Narrow an index to the children `filter` keeps.
    ///
    /// Image manifests and indexes whose children all match come back
    /// unchanged.  Otherwise the index is re-encoded without the dropped
    /// entries, every other field left as it was, and gets a new digest.
    /// `None` means no child matched.
    pub fn select_platforms(&self, filter: &PlatformFilter) -> Result<Option<Manifest>> {
        if !self.is_index() {
            return Ok(Some(self.clone()));
        }
        let kept: Vec<Descriptor> = self
            .descriptors
            .iter()
            .filter(|d| filter.matches(d.platform.as_ref()))
            .cloned()
            .collect();
        if kept.is_empty() {
            return Ok(None);
        }
        if kept.len() == self.descriptors.len() {
            return Ok(Some(self.clone()));
        }

        let mut value: serde_json::Value = serde_json::from_slice(&self.raw)?;
        if let Some(entries) = value.get_mut("manifests").and_then(|m| m.as_array_mut()) {
            entries.retain(|entry| {
                entry
                    .get("digest")
                    .and_then(|d| d.as_str())
                    .map(|d| kept.iter().any(|k| k.digest == d))
                    .unwrap_or(false)
            });
        }
        let raw = serde_json::to_vec(&value)?;
        Ok(Some(Self {
            media_type: self.media_type.clone(),
            digest: digest::sha256_digest(&raw),
            descriptors: kept,
            raw,
        }))
    }
}

fn strip_params(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or(content_type).trim()
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";

/// Accept header sent when pulling manifests.
pub fn accept_header() -> String {
    [
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST,
    ]
    .join(", ")
}

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const D_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const D_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const D_C: &str = "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    fn sample_manifest() -> String {
        format!(
            r#"{{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {{
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "{D_A}",
                "size": 1234
            }},
            "layers": [
                {{
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "{D_B}",
                    "size": 5678
                }},
                {{
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "{D_C}",
                    "size": 91011
                }}
            ]
        }}"#
        )
    }

    fn sample_index() -> String {
        format!(
            r#"{{
            "schemaVersion": 2,
            "manifests": [
                {{
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "{D_A}",
                    "size": 100,
                    "platform": {{ "architecture": "amd64", "os": "linux" }}
                }},
                {{
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "{D_B}",
                    "size": 200,
                    "platform": {{ "architecture": "arm64", "os": "linux", "variant": "v8" }}
                }}
            ]
        }}"#
        )
    }

    #[test]
    fn parse_image_manifest() {
        let raw = sample_manifest().into_bytes();
        let m = Manifest::from_bytes(raw.clone(), None).unwrap();
        assert_eq!(m.media_type, MEDIA_TYPE_OCI_MANIFEST);
        assert!(!m.is_index());
        assert_eq!(m.blobs().len(), 3);
        assert_eq!(m.blobs()[0].digest, D_A);
        assert_eq!(m.blobs()[2].size, 91011);
        assert!(m.children().is_empty());
        assert_eq!(m.digest, digest::sha256_digest(&raw));
        assert_eq!(m.raw, raw);
    }

    #[test]
    fn parse_index_without_media_type() {
        let m = Manifest::from_bytes(sample_index().into_bytes(), None).unwrap();
        assert!(m.is_index());
        assert!(m.blobs().is_empty());
        assert_eq!(m.children().len(), 2);
        let platform = m.children()[1].platform.as_ref().unwrap();
        assert_eq!(platform.to_string(), "linux/arm64/v8");
    }

    #[test]
    fn content_type_used_when_document_is_silent() {
        let raw = sample_index().into_bytes();
        let m = Manifest::from_bytes(
            raw,
            Some("application/vnd.docker.distribution.manifest.list.v2+json; charset=utf-8"),
        )
        .unwrap();
        assert_eq!(m.media_type, MEDIA_TYPE_DOCKER_MANIFEST_LIST);
    }

    #[test]
    fn schema1_is_rejected() {
        let raw = br#"{"schemaVersion": 1, "name": "x", "tag": "y", "fsLayers": []}"#.to_vec();
        assert!(matches!(
            Manifest::from_bytes(raw, None),
            Err(OciError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn bad_descriptor_digest_is_rejected() {
        let raw = sample_manifest().replace(D_C, "sha256:short").into_bytes();
        assert!(matches!(
            Manifest::from_bytes(raw, None),
            Err(OciError::Manifest(_))
        ));
    }

    #[test]
    fn platform_filter_narrows_an_index() {
        let index = Manifest::from_bytes(sample_index().into_bytes(), None).unwrap();

        let all = index.select_platforms(&PlatformFilter::default()).unwrap().unwrap();
        assert_eq!(all, index);

        let arm = index
            .select_platforms(&PlatformFilter::new(["aarch64"], ["linux"]))
            .unwrap()
            .unwrap();
        assert_eq!(arm.children().len(), 1);
        assert_eq!(arm.children()[0].digest, D_B);
        assert_ne!(arm.digest, index.digest);
        assert_eq!(arm.digest, digest::sha256_digest(&arm.raw));
        let reparsed = Manifest::from_bytes(arm.raw.clone(), None).unwrap();
        assert_eq!(reparsed.children(), arm.children());

        let both = PlatformFilter::new(["x86_64", "arm64"], Vec::<String>::new());
        assert_eq!(index.select_platforms(&both).unwrap().unwrap(), index);

        let none = PlatformFilter::new(["s390x"], Vec::<String>::new());
        assert!(index.select_platforms(&none).unwrap().is_none());
        let windows = PlatformFilter::new(Vec::<String>::new(), ["windows"]);
        assert!(index.select_platforms(&windows).unwrap().is_none());
    }

    #[test]
    fn platform_filter_leaves_single_manifests_alone() {
        let m = Manifest::from_bytes(sample_manifest().into_bytes(), None).unwrap();
        let filter = PlatformFilter::new(["s390x"], ["windows"]);
        assert_eq!(m.select_platforms(&filter).unwrap(), Some(m.clone()));
        assert!(!filter.matches(None));
        assert!(PlatformFilter::new([" "], [""]).is_empty());
    }

    #[test]
    fn media_type_helpers() {
        assert!(is_index_media_type(MEDIA_TYPE_OCI_INDEX));
        assert!(is_index_media_type(MEDIA_TYPE_DOCKER_MANIFEST_LIST));
        assert!(!is_index_media_type(MEDIA_TYPE_OCI_MANIFEST));

        assert!(is_manifest_media_type(MEDIA_TYPE_OCI_MANIFEST));
        assert!(is_manifest_media_type(MEDIA_TYPE_DOCKER_MANIFEST));
        assert!(!is_manifest_media_type(MEDIA_TYPE_OCI_INDEX));
    }
}
