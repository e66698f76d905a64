//! Opening archives for load and validation.
//!
//! Directory archives are read in place.  Stream archives, segmented or
//! not, are reassembled, decompressed and extracted into a work directory
//! with the directory layout, verifying every content entry on the way.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use hangar_oci::digest;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::parts;
use crate::{
    blob_path, ArchiveError, Compression, EntryKind, ImageRecord, Result, Trailer, IMAGES_DIR,
    INDEX_FILE,
};

/// An archive ready for reading through the directory layout at `root`.
#[derive(Debug)]
pub struct OpenedArchive {
    /// Directory holding `blobs/`, `images/` and `index.json`.
    pub root: PathBuf,
    /// Files the archive was read from.
    pub files: Vec<PathBuf>,
    pub records: Vec<ImageRecord>,
    pub trailer: Option<Trailer>,
    /// Problems that did not prevent reading the rest of the archive:
    /// corrupt entries, truncation, a missing trailer.
    pub problems: Vec<ArchiveError>,
}

impl OpenedArchive {
    /// Location of a content entry.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        blob_path(&self.root, digest)
    }

    /// Read and verify a content entry.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let data = fs::read(self.blob_path(digest))?;
        let actual = digest::sha256_digest(&data);
        if actual != digest {
            return Err(ArchiveError::DigestMismatch {
                entry: crate::blob_entry_name(digest),
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(data)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }
}

/// Open the archive at `source`.  Stream archives are extracted into
/// `work_dir`; directory archives are read where they are.
///
/// Missing parts fail before anything is parsed.  Damage found while
/// reading is reported in [`OpenedArchive::problems`] alongside whatever
/// could still be recovered.
pub fn open(source: &Path, work_dir: &Path) -> Result<OpenedArchive> {
    if source.is_dir() {
        return open_directory(source);
    }
    let files = parts::resolve(source)?;
    info!(
        source = %source.display(),
        parts = files.len(),
        work_dir = %work_dir.display(),
        "extracting archive"
    );
    let reader = parts::concat_reader(&files)?;
    let mut opened = extract(reader, work_dir, &source.display().to_string())?;
    opened.files = files;
    Ok(opened)
}

fn open_directory(root: &Path) -> Result<OpenedArchive> {
    let mut problems = Vec::new();
    let mut records = Vec::new();

    let images = root.join(IMAGES_DIR);
    let mut names: Vec<PathBuf> = match fs::read_dir(&images) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    names.sort();
    for path in names {
        let data = fs::read(&path)?;
        match serde_json::from_slice::<ImageRecord>(&data) {
            Ok(r) => records.push(r),
            Err(e) => problems.push(ArchiveError::MalformedEntry {
                entry: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    let trailer = match fs::read(root.join(INDEX_FILE)) {
        Ok(data) => match serde_json::from_slice::<Trailer>(&data) {
            Ok(t) => Some(t),
            Err(e) => {
                problems.push(ArchiveError::MalformedEntry {
                    entry: INDEX_FILE.to_string(),
                    reason: e.to_string(),
                });
                None
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            problems.push(missing_trailer(root));
            None
        }
        Err(e) => return Err(e.into()),
    };

    Ok(OpenedArchive {
        root: root.to_path_buf(),
        files: vec![root.to_path_buf()],
        records,
        trailer,
        problems,
    })
}

fn missing_trailer(path: &Path) -> ArchiveError {
    ArchiveError::Incomplete {
        path: path.display().to_string(),
        reason: format!("no {} trailer", INDEX_FILE),
    }
}

/// Peek at the stream's first bytes and wrap it in the matching decoder.
fn decompressor(mut reader: Box<dyn Read + Send>) -> Result<(Compression, Box<dyn Read + Send>)> {
    let mut head = Vec::with_capacity(4);
    (&mut reader).take(4).read_to_end(&mut head)?;
    let compression = Compression::sniff(&head);
    let stream: Box<dyn Read + Send> = Box::new(Cursor::new(head).chain(reader));
    let decoded: Box<dyn Read + Send> = match compression {
        Compression::None => stream,
        Compression::Gzip => Box::new(GzDecoder::new(stream)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(stream)?),
    };
    Ok((compression, decoded))
}

/// Extract a stream archive into `dest` using the directory layout.
pub fn extract(reader: Box<dyn Read + Send>, dest: &Path, label: &str) -> Result<OpenedArchive> {
    fs::create_dir_all(dest.join(crate::BLOBS_DIR))?;
    fs::create_dir_all(dest.join(IMAGES_DIR))?;

    let (compression, decoded) = decompressor(reader)?;
    debug!(%compression, source = label, "detected archive compression");

    let mut archive = tar::Archive::new(decoded);
    let mut records = Vec::new();
    let mut trailer = None;
    let mut problems = Vec::new();
    let incomplete = |reason: String| ArchiveError::Incomplete {
        path: label.to_string(),
        reason,
    };

    let entries = match archive.entries() {
        Ok(e) => e,
        Err(e) => {
            problems.push(incomplete(e.to_string()));
            return Ok(OpenedArchive {
                root: dest.to_path_buf(),
                files: Vec::new(),
                records,
                trailer,
                problems,
            });
        }
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(e) => e,
            Err(e) => {
                problems.push(incomplete(e.to_string()));
                break;
            }
        };
        let name = match entry.path() {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(e) => {
                problems.push(incomplete(e.to_string()));
                break;
            }
        };
        let size = entry.size();
        if trailer.is_some() {
            warn!(entry = %name, "content after trailer");
        }

        match EntryKind::classify(&name) {
            EntryKind::Blob(d) => match copy_verified(&mut entry, dest, &d, size) {
                Ok(()) => {}
                Err(CopyError::Truncated(reason)) => {
                    problems.push(incomplete(format!("{} truncated: {}", name, reason)));
                    break;
                }
                Err(CopyError::Mismatch(actual)) => {
                    warn!(entry = %name, "content digest mismatch");
                    problems.push(ArchiveError::DigestMismatch {
                        entry: name,
                        expected: d,
                        actual,
                    });
                }
                Err(CopyError::Local(e)) => return Err(e.into()),
            },
            kind @ (EntryKind::Image | EntryKind::Trailer) => {
                let mut data = Vec::with_capacity(size as usize);
                if let Err(e) = entry.read_to_end(&mut data) {
                    problems.push(incomplete(format!("{} truncated: {}", name, e)));
                    break;
                }
                if (data.len() as u64) < size {
                    problems.push(incomplete(format!("{} truncated", name)));
                    break;
                }
                if kind == EntryKind::Trailer {
                    match serde_json::from_slice::<Trailer>(&data) {
                        Ok(t) => trailer = Some(t),
                        Err(e) => problems.push(ArchiveError::MalformedEntry {
                            entry: name,
                            reason: e.to_string(),
                        }),
                    }
                } else {
                    match serde_json::from_slice::<ImageRecord>(&data) {
                        Ok(r) => {
                            fs::write(dest.join(r.entry_name()), &data)?;
                            records.push(r);
                        }
                        Err(e) => problems.push(ArchiveError::MalformedEntry {
                            entry: name,
                            reason: e.to_string(),
                        }),
                    }
                }
            }
            EntryKind::Unknown => {
                debug!(entry = %name, "skipping unknown entry");
            }
        }
    }

    match &trailer {
        Some(t) => fs::write(dest.join(INDEX_FILE), serde_json::to_vec_pretty(t)?)?,
        None => {
            if !problems
                .iter()
                .any(|p| matches!(p, ArchiveError::Incomplete { .. }))
            {
                problems.push(missing_trailer(Path::new(label)));
            }
            // A stale trailer from an earlier extraction must not vouch for
            // this one.
            let stale = dest.join(INDEX_FILE);
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }
    }

    info!(
        source = label,
        images = records.len(),
        problems = problems.len(),
        "archive extracted"
    );
    Ok(OpenedArchive {
        root: dest.to_path_buf(),
        files: Vec::new(),
        records,
        trailer,
        problems,
    })
}

enum CopyError {
    /// The archive ended inside the entry.
    Truncated(String),
    /// The payload does not hash to its name; carries the actual digest.
    Mismatch(String),
    /// Writing the extracted copy failed.
    Local(io::Error),
}

/// Stream one content entry to `<dest>/blobs/sha256/<hex>`, hashing as it
/// goes.  The file only appears under its final name once verified.
fn copy_verified<R: Read>(entry: &mut R, dest: &Path, expected: &str, size: u64) -> std::result::Result<(), CopyError> {
    let path = blob_path(dest, expected);
    let tmp = path.with_extension("partial");
    let mut out = File::create(&tmp).map_err(CopyError::Local)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;

    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(CopyError::Truncated(e.to_string()));
            }
        };
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).map_err(CopyError::Local)?;
        copied += n as u64;
    }
    drop(out);

    if copied < size {
        let _ = fs::remove_file(&tmp);
        return Err(CopyError::Truncated(format!("{} of {} bytes", copied, size)));
    }
    let actual = format!(
        "{}{}",
        digest::SHA256_PREFIX,
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    );
    if actual != expected {
        let _ = fs::remove_file(&tmp);
        return Err(CopyError::Mismatch(actual));
    }
    fs::rename(&tmp, &path).map_err(CopyError::Local)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::part_path;
    use crate::writer::{ArchiveWriter, Content, Entry, PendingImage};
    use crate::ArchiveFormat;
    use hangar_oci::digest::sha256_digest;

    fn pending(source: &str, layer: &[u8]) -> PendingImage {
        let manifest = format!("{{\"image\":\"{}\"}}", source).into_bytes();
        let manifest_digest = sha256_digest(&manifest);
        PendingImage {
            blobs: vec![Entry {
                digest: sha256_digest(layer),
                content: Content::Bytes(layer.to_vec()),
            }],
            manifests: vec![Entry {
                digest: manifest_digest.clone(),
                content: Content::Bytes(manifest),
            }],
            record: ImageRecord {
                job: source.to_string(),
                source: source.to_string(),
                manifest_digest,
                media_type: hangar_oci::manifest::MEDIA_TYPE_OCI_MANIFEST.to_string(),
            },
        }
    }

    fn layer(seed: u8) -> Vec<u8> {
        (0..20_000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8 ^ seed)
            .collect()
    }

    fn save(path: &Path, format: ArchiveFormat, part_size: Option<u64>) -> Vec<PathBuf> {
        let mut w = ArchiveWriter::create(path, format, part_size).unwrap();
        for (i, src) in ["r.local/a:1", "r.local/b:1", "r.local/c:1"].iter().enumerate() {
            w.append_image(pending(src, &layer(i as u8))).unwrap();
        }
        w.finish().unwrap().files
    }

    #[test]
    fn extract_every_compression() {
        for format in ["gzip", "zstd", "none"] {
            let tmp = tempfile::tempdir().unwrap();
            let format: ArchiveFormat = format.parse().unwrap();
            let path = format.output_path(tmp.path().join("s").to_str().unwrap());
            save(&path, format, None);

            let opened = open(&path, &tmp.path().join("cache")).unwrap();
            assert!(opened.problems.is_empty(), "{:?}", opened.problems);
            assert_eq!(opened.records.len(), 3);
            assert_eq!(opened.trailer.as_ref().unwrap().images.len(), 3);
            let rec = &opened.records[1];
            assert_eq!(rec.source, "r.local/b:1");
            opened.read_blob(&rec.manifest_digest).unwrap();
            assert!(opened.has_blob(&sha256_digest(&layer(1))));
            assert!(tmp.path().join("cache").join(INDEX_FILE).is_file());
        }
    }

    #[test]
    fn open_segmented_from_first_part() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("p.tar.gz");
        let files = save(&path, "gzip".parse().unwrap(), Some(8 * 1024));
        assert!(files.len() >= 2);

        let opened = open(&part_path(&path, 0), &tmp.path().join("cache")).unwrap();
        assert!(opened.problems.is_empty(), "{:?}", opened.problems);
        assert_eq!(opened.files, files);
        assert_eq!(opened.records.len(), 3);
    }

    #[test]
    fn missing_middle_part_fails_before_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("p.tar");
        let files = save(&path, "none".parse().unwrap(), Some(8 * 1024));
        assert!(files.len() >= 3);
        fs::remove_file(&files[1]).unwrap();

        let cache = tmp.path().join("cache");
        let err = open(&files[0], &cache).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingPart { part: 1, .. }));
        assert!(!cache.exists());
    }

    #[test]
    fn truncated_stream_keeps_recovered_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.tar");
        let files = save(&path, "none".parse().unwrap(), None);
        let data = fs::read(&files[0]).unwrap();
        // Cut inside the last image's layer.
        fs::write(&path, &data[..data.len() * 3 / 4]).unwrap();

        let opened = open(&path, &tmp.path().join("cache")).unwrap();
        assert!(opened.trailer.is_none());
        assert!(opened
            .problems
            .iter()
            .any(|p| matches!(p, ArchiveError::Incomplete { .. })));
        assert!(!opened.records.is_empty());
        assert!(opened.records.len() < 3);
        for rec in &opened.records {
            opened.read_blob(&rec.manifest_digest).unwrap();
        }
    }

    #[test]
    fn corrupt_entry_is_reported_not_extracted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("c.tar");
        save(&path, "none".parse().unwrap(), None);

        // Flip a byte inside the first layer's payload (after its header).
        let mut data = fs::read(&path).unwrap();
        data[512 + 100] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let opened = open(&path, &tmp.path().join("cache")).unwrap();
        assert!(opened
            .problems
            .iter()
            .any(|p| matches!(p, ArchiveError::DigestMismatch { .. })));
        assert!(!opened.has_blob(&sha256_digest(&layer(0))));
        assert_eq!(opened.records.len(), 3);
        assert!(opened.trailer.is_some());
    }

    #[test]
    fn directory_archive_is_read_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("dir");
        save(&root, ArchiveFormat::Directory, None);

        let opened = open(&root, &tmp.path().join("unused")).unwrap();
        assert_eq!(opened.root, root);
        assert!(opened.problems.is_empty());
        assert_eq!(opened.records.len(), 3);
        assert!(!tmp.path().join("unused").exists());

        fs::remove_file(root.join(INDEX_FILE)).unwrap();
        let opened = open(&root, &tmp.path().join("unused")).unwrap();
        assert!(matches!(
            opened.problems.as_slice(),
            [ArchiveError::Incomplete { .. }]
        ));
    }
}
