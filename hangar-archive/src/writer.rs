//! Archive writer for directory and stream layouts.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use tracing::{debug, info};

use crate::parts::PartWriter;
use crate::{
    blob_entry_name, blob_path, entry_header, ArchiveError, ArchiveFormat, Compression,
    ImageRecord, Result, Trailer, FORMAT_VERSION, IMAGES_DIR, INDEX_FILE,
};

/// Payload of one content entry.
#[derive(Debug, Clone)]
pub enum Content {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A content-addressed entry waiting to be written.
#[derive(Debug, Clone)]
pub struct Entry {
    pub digest: String,
    pub content: Content,
}

/// Everything one saved image contributes to the archive.  Written as a
/// contiguous run: blobs, then manifests (children before their index),
/// then the record.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub blobs: Vec<Entry>,
    pub manifests: Vec<Entry>,
    pub record: ImageRecord,
}

/// What [`ArchiveWriter::finish`] produced.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Files written: the archive itself, its parts, or the directory.
    pub files: Vec<PathBuf>,
    pub images: usize,
    pub blobs: u64,
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(compression: Compression, inner: W) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => Encoder::Plain(inner),
            Compression::Gzip => {
                Encoder::Gzip(GzEncoder::new(inner, flate2::Compression::default()))
            }
            Compression::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(inner, 0)?),
        })
    }

    fn sink_mut(&mut self) -> &mut W {
        match self {
            Encoder::Plain(w) => w,
            Encoder::Gzip(e) => e.get_mut(),
            Encoder::Zstd(e) => e.get_mut(),
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Plain(w) => Ok(w),
            Encoder::Gzip(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

// ---------------------------------------------------------------------------
// ArchiveWriter
// ---------------------------------------------------------------------------

enum Sink {
    Directory(PathBuf),
    Stream(tar::Builder<Encoder<PartWriter>>),
}

/// Writes one archive.  Not thread safe; callers serialize access.
pub struct ArchiveWriter {
    path: PathBuf,
    sink: Sink,
    written: HashSet<String>,
    images: Vec<String>,
    /// Record entry name to manifest digest.
    records: HashMap<String, String>,
    poisoned: Option<String>,
}

impl ArchiveWriter {
    /// Create the archive at `path`.  `part_size` only applies to stream
    /// formats.
    pub fn create(path: &Path, format: ArchiveFormat, part_size: Option<u64>) -> Result<Self> {
        let sink = match format {
            ArchiveFormat::Directory => {
                fs::create_dir_all(path.join(crate::BLOBS_DIR))?;
                fs::create_dir_all(path.join(IMAGES_DIR))?;
                // The trailer marks a finished archive; drop one left by an
                // earlier run until this one completes.
                let index = path.join(INDEX_FILE);
                if index.exists() {
                    fs::remove_file(index)?;
                }
                Sink::Directory(path.to_path_buf())
            }
            ArchiveFormat::Stream(compression) => {
                let parts = PartWriter::create(path, part_size)?;
                Sink::Stream(tar::Builder::new(Encoder::new(compression, parts)?))
            }
        };
        info!(path = %path.display(), %format, ?part_size, "creating archive");
        Ok(Self {
            path: path.to_path_buf(),
            sink,
            written: HashSet::new(),
            images: Vec::new(),
            records: HashMap::new(),
            poisoned: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `digest` has already been written.
    pub fn contains(&self, digest: &str) -> bool {
        self.written.contains(digest)
    }

    /// Append one image.  Content already in the archive is skipped, and so
    /// is an image whose record is already there with the same manifest.
    /// The same image with a different manifest is rejected before anything
    /// is written.
    ///
    /// A failure while bytes are going into a stream leaves the stream
    /// unusable, so every later call (including [`ArchiveWriter::finish`])
    /// fails too.  Failures before the first byte (a missing source file)
    /// only fail this image.
    pub fn append_image(&mut self, image: PendingImage) -> Result<()> {
        if let Some(reason) = &self.poisoned {
            return Err(ArchiveError::Incomplete {
                path: self.path.display().to_string(),
                reason: reason.clone(),
            });
        }

        let entry_name = image.record.entry_name();
        if let Some(existing) = self.records.get(&entry_name) {
            if *existing == image.record.manifest_digest {
                debug!(image = %image.record.source, "image already archived");
                return Ok(());
            }
            return Err(ArchiveError::ConflictingImage {
                image: image.record.source.clone(),
                existing: existing.clone(),
            });
        }

        for entry in image.blobs.iter().chain(image.manifests.iter()) {
            if self.written.contains(&entry.digest) {
                continue;
            }
            self.put_content(entry)?;
            self.written.insert(entry.digest.clone());
        }

        let record = serde_json::to_vec_pretty(&image.record)?;
        match &mut self.sink {
            Sink::Directory(root) => {
                write_atomic(&root.join(&entry_name), &record)?;
            }
            Sink::Stream(builder) => {
                append_entry(builder, &entry_name, record.len() as u64, &record[..])
                    .map_err(|e| poison(&mut self.poisoned, e))?;
            }
        }
        debug!(image = %image.record.source, "archived image record");
        self.records
            .insert(entry_name, image.record.manifest_digest.clone());
        self.images.push(image.record.source);
        Ok(())
    }

    fn put_content(&mut self, entry: &Entry) -> Result<()> {
        let name = blob_entry_name(&entry.digest);
        match (&mut self.sink, &entry.content) {
            (Sink::Directory(root), Content::File(src)) => {
                let dest = blob_path(root, &entry.digest);
                if dest != *src && !dest.exists() {
                    let tmp = dest.with_extension("partial");
                    fs::copy(src, &tmp)?;
                    fs::rename(&tmp, &dest)?;
                }
            }
            (Sink::Directory(root), Content::Bytes(data)) => {
                let dest = blob_path(root, &entry.digest);
                if !dest.exists() {
                    write_atomic(&dest, data)?;
                }
            }
            (Sink::Stream(builder), Content::File(src)) => {
                let file = File::open(src)?;
                let size = file.metadata()?.len();
                append_entry(builder, &name, size, file).map_err(|e| poison(&mut self.poisoned, e))?;
            }
            (Sink::Stream(builder), Content::Bytes(data)) => {
                append_entry(builder, &name, data.len() as u64, &data[..])
                    .map_err(|e| poison(&mut self.poisoned, e))?;
            }
        }
        debug!(digest = %entry.digest, "archived content");
        Ok(())
    }

    /// Write the trailer and close the archive.
    pub fn finish(self) -> Result<ArchiveSummary> {
        if let Some(reason) = self.poisoned {
            return Err(ArchiveError::Incomplete {
                path: self.path.display().to_string(),
                reason,
            });
        }
        let trailer = Trailer {
            version: FORMAT_VERSION,
            images: self.images,
            blobs: self.written.len() as u64,
        };
        let body = serde_json::to_vec_pretty(&trailer)?;

        let files = match self.sink {
            Sink::Directory(root) => {
                write_atomic(&root.join(INDEX_FILE), &body)?;
                vec![root]
            }
            Sink::Stream(mut builder) => {
                append_entry(&mut builder, INDEX_FILE, body.len() as u64, &body[..])?;
                let encoder = builder.into_inner()?;
                let parts = encoder.finish()?;
                parts.finish()?
            }
        };

        info!(
            path = %self.path.display(),
            images = trailer.images.len(),
            blobs = trailer.blobs,
            files = files.len(),
            "archive complete"
        );
        Ok(ArchiveSummary {
            path: self.path,
            files,
            images: trailer.images.len(),
            blobs: trailer.blobs,
        })
    }
}

/// Append one entry, flush the compressor and mark the entry boundary so
/// the part writer may cut here.
fn append_entry<R: Read>(
    builder: &mut tar::Builder<Encoder<PartWriter>>,
    name: &str,
    size: u64,
    data: R,
) -> Result<()> {
    let mut header = entry_header(size);
    builder.append_data(&mut header, name, data)?;
    let encoder = builder.get_mut();
    encoder.flush()?;
    encoder.sink_mut().boundary();
    Ok(())
}

/// Mark the stream unusable after a failed write.
fn poison(poisoned: &mut Option<String>, e: ArchiveError) -> ArchiveError {
    *poisoned = Some(format!("earlier write failed: {}", e));
    e
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("partial");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
