//! On-disk archive format for saved images.
//!
//! An archive is either a directory or a single tar stream, optionally
//! compressed and optionally cut into numbered parts.
//!
//! ## Layout
//!
//! ```text
//! blobs/sha256/<hex>     one entry per blob or manifest, named by digest
//! images/<key>.json      one ImageRecord per saved image
//! index.json             trailer summary, always the last entry
//! ```
//!
//! Every tar entry is a self-describing frame: the header carries the entry
//! name (the content digest) and the payload size.  Headers are
//! deterministic (mode 0644, mtime 0, uid/gid 0) so that identical inputs
//! produce identical streams.
//!
//! The compressor is flushed after every entry.  Segmented output is cut
//! only right after such a flush, so concatenating `<name>.part0`,
//! `<name>.part1`, ... reproduces the unsegmented stream byte for byte.

pub mod parts;
pub mod reader;
pub mod writer;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use hangar_oci::digest;
use serde::{Deserialize, Serialize};

pub use reader::{open, OpenedArchive};
pub use writer::{ArchiveSummary, ArchiveWriter, Content, Entry, PendingImage};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors raised while writing or reading archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive part {part} of {base} is missing")]
    MissingPart { base: String, part: u32 },

    #[error("incomplete archive {path}: {reason}")]
    Incomplete { path: String, reason: String },

    #[error("digest mismatch for {entry}: expected {expected}, got {actual}")]
    DigestMismatch {
        entry: String,
        expected: String,
        actual: String,
    },

    #[error("malformed archive entry {entry}: {reason}")]
    MalformedEntry { entry: String, reason: String },

    #[error("{image} is already archived with manifest {existing}")]
    ConflictingImage { image: String, existing: String },

    #[error("unsupported archive format: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Directory holding content-addressed entries.
pub const BLOBS_DIR: &str = "blobs/sha256";

/// Directory holding image records.
pub const IMAGES_DIR: &str = "images";

/// Trailer entry name.  Written last; its absence marks an incomplete
/// archive.
pub const INDEX_FILE: &str = "index.json";

/// Trailer format version.
pub const FORMAT_VERSION: u32 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

/// Stream compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Identify the compression of a stream from its first bytes.
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if head.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// File name suffix for a stream archive.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => ".tar",
            Compression::Gzip => ".tar.gz",
            Compression::Zstd => ".tar.zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

/// Archive layout selected with `--compress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Directory,
    Stream(Compression),
}

impl Default for ArchiveFormat {
    fn default() -> Self {
        ArchiveFormat::Stream(Compression::Gzip)
    }
}

impl ArchiveFormat {
    /// The path an archive named `name` is written to.  Stream archives get
    /// the compression's suffix unless `name` already carries it.
    pub fn output_path(&self, name: &str) -> PathBuf {
        match self {
            ArchiveFormat::Directory => PathBuf::from(name.trim_end_matches('/')),
            ArchiveFormat::Stream(c) => {
                if name.ends_with(c.extension()) {
                    PathBuf::from(name)
                } else {
                    PathBuf::from(format!("{}{}", name, c.extension()))
                }
            }
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(ArchiveFormat::Stream(Compression::Gzip)),
            "zstd" => Ok(ArchiveFormat::Stream(Compression::Zstd)),
            "none" | "tar" => Ok(ArchiveFormat::Stream(Compression::None)),
            "dir" | "directory" => Ok(ArchiveFormat::Directory),
            other => Err(format!(
                "unknown compress format {:?} (expected gzip, zstd, dir or none)",
                other
            )),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveFormat::Directory => write!(f, "dir"),
            ArchiveFormat::Stream(c) => write!(f, "{}", c),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One saved image.  The loader and validator enumerate an archive's
/// images through these records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// The reference as written in the input list.
    pub job: String,
    /// Canonical source reference.
    pub source: String,
    pub manifest_digest: String,
    pub media_type: String,
}

impl ImageRecord {
    /// File-name key derived from the canonical source.  Bytes outside
    /// `[A-Za-z0-9.-]` become `_XX` (uppercase hex), so distinct sources
    /// never share a key.
    pub fn key(&self) -> String {
        let mut key = String::with_capacity(self.source.len() + 8);
        for b in self.source.bytes() {
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' {
                key.push(char::from(b));
            } else {
                key.push_str(&format!("_{:02X}", b));
            }
        }
        key
    }

    /// Entry name of this record inside the archive.
    pub fn entry_name(&self) -> String {
        format!("{}/{}.json", IMAGES_DIR, self.key())
    }
}

/// The final entry of every complete archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    pub version: u32,
    /// Canonical sources of the saved images, in write order.
    pub images: Vec<String>,
    /// Number of content entries (blobs and manifests).
    pub blobs: u64,
}

// ---------------------------------------------------------------------------
// Entry naming
// ---------------------------------------------------------------------------

/// What an archive entry holds, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Blob(String),
    Image,
    Trailer,
    Unknown,
}

impl EntryKind {
    pub fn classify(name: &str) -> Self {
        let name = name.trim_start_matches("./");
        if name == INDEX_FILE {
            return EntryKind::Trailer;
        }
        if let Some(hex) = name
            .strip_prefix(BLOBS_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            let d = format!("{}{}", digest::SHA256_PREFIX, hex);
            if digest::is_sha256_digest(&d) {
                return EntryKind::Blob(d);
            }
            return EntryKind::Unknown;
        }
        if name.starts_with(IMAGES_DIR) && name.ends_with(".json") {
            return EntryKind::Image;
        }
        EntryKind::Unknown
    }
}

/// Entry name for a content digest.
pub fn blob_entry_name(digest: &str) -> String {
    format!("{}/{}", BLOBS_DIR, digest::hex_part(digest))
}

/// Location of a content digest inside a directory archive rooted at
/// `root`.
pub fn blob_path(root: &Path, digest: &str) -> PathBuf {
    root.join(blob_entry_name(digest))
}

/// A tar header for a regular-file entry of `size` bytes.  Path and
/// checksum are filled in when the entry is appended.
pub fn entry_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn sniff_magic_bytes() {
        assert_eq!(Compression::sniff(&[0x1f, 0x8b, 0x08, 0x00]), Compression::Gzip);
        assert_eq!(Compression::sniff(&[0x28, 0xb5, 0x2f, 0xfd]), Compression::Zstd);
        assert_eq!(Compression::sniff(b"blobs/sh"), Compression::None);
        assert_eq!(Compression::sniff(&[]), Compression::None);
    }

    #[test]
    fn output_naming() {
        let gz = ArchiveFormat::Stream(Compression::Gzip);
        assert_eq!(gz.output_path("saved-images"), PathBuf::from("saved-images.tar.gz"));
        assert_eq!(gz.output_path("load.tar.gz"), PathBuf::from("load.tar.gz"));
        let zstd: ArchiveFormat = "zstd".parse().unwrap();
        assert_eq!(zstd.output_path("load"), PathBuf::from("load.tar.zstd"));
        let none: ArchiveFormat = "none".parse().unwrap();
        assert_eq!(none.output_path("x"), PathBuf::from("x.tar"));
        assert_eq!(
            ArchiveFormat::Directory.output_path("load-directory/"),
            PathBuf::from("load-directory")
        );
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn classify_entries() {
        assert_eq!(
            EntryKind::classify(&format!("blobs/sha256/{}", HEX)),
            EntryKind::Blob(format!("sha256:{}", HEX))
        );
        assert_eq!(EntryKind::classify("blobs/sha256/zz"), EntryKind::Unknown);
        assert_eq!(EntryKind::classify("images/a.json"), EntryKind::Image);
        assert_eq!(EntryKind::classify("./index.json"), EntryKind::Trailer);
        assert_eq!(EntryKind::classify("README"), EntryKind::Unknown);
        assert_eq!(
            blob_entry_name(&format!("sha256:{}", HEX)),
            format!("blobs/sha256/{}", HEX)
        );
    }

    #[test]
    fn record_key_is_file_name_safe() {
        let r = ImageRecord {
            job: "nginx:1.25".into(),
            source: "registry-1.docker.io/library/nginx:1.25".into(),
            manifest_digest: format!("sha256:{}", HEX),
            media_type: hangar_oci::manifest::MEDIA_TYPE_OCI_MANIFEST.into(),
        };
        assert_eq!(r.key(), "registry-1.docker.io_2Flibrary_2Fnginx_3A1.25");
        assert_eq!(
            r.entry_name(),
            "images/registry-1.docker.io_2Flibrary_2Fnginx_3A1.25.json"
        );
    }

    #[test]
    fn record_keys_do_not_collide() {
        let record = |source: &str| ImageRecord {
            job: source.into(),
            source: source.into(),
            manifest_digest: format!("sha256:{}", HEX),
            media_type: hangar_oci::manifest::MEDIA_TYPE_OCI_MANIFEST.into(),
        };
        let sources = [
            "src.local/a_b:1",
            "src.local/a/b:1",
            "src.local/a:b:1",
            "src.local/a_2Fb:1",
        ];
        let keys: std::collections::HashSet<String> =
            sources.iter().map(|s| record(s).key()).collect();
        assert_eq!(keys.len(), sources.len());
    }

    #[test]
    fn header_is_deterministic() {
        let a = entry_header(42);
        let b = entry_header(42);
        assert_eq!(a.as_bytes()[..], b.as_bytes()[..]);
        assert_eq!(a.mode().unwrap(), 0o644);
        assert_eq!(a.mtime().unwrap(), 0);
        assert_eq!(a.size().unwrap(), 42);
    }
}
