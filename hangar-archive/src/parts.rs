//! Segmented output and part enumeration.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{ArchiveError, Result};

const PART_MARKER: &str = ".part";

/// `<base>.part<n>`
pub fn part_path(base: &Path, n: u32) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(format!("{}{}", PART_MARKER, n));
    PathBuf::from(s)
}

/// Split `<base>.part<n>` into `(base, n)`.
pub fn split_part_path(path: &Path) -> Option<(PathBuf, u32)> {
    let s = path.to_str()?;
    let idx = s.rfind(PART_MARKER)?;
    let digits = &s[idx + PART_MARKER.len()..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n = digits.parse().ok()?;
    Some((PathBuf::from(&s[..idx]), n))
}

/// Every existing `<base>.part<n>` file, sorted by `n`.
fn existing_parts(base: &Path) -> io::Result<Vec<(u32, PathBuf)>> {
    let dir = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(file_name) = base.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}{}", file_name, PART_MARKER);

    let mut parts = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(parts),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(digits) = name.strip_prefix(&prefix) else {
            continue;
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(n) = digits.parse::<u32>() {
            parts.push((n, part_path(base, n)));
        }
    }
    parts.sort_by_key(|(n, _)| *n);
    Ok(parts)
}

/// Resolve the files making up the archive at `path`, in stream order.
///
/// A path ending in `.part<n>` names a segmented archive: all sibling parts
/// are collected and must run contiguously from `part0` through at least
/// `n`.  A plain path that does not exist but has a `.part0` sibling is
/// treated the same way.
pub fn resolve(path: &Path) -> Result<Vec<PathBuf>> {
    let (base, named) = match split_part_path(path) {
        Some((base, n)) => (base, Some(n)),
        None if !path.exists() && part_path(path, 0).exists() => (path.to_path_buf(), None),
        None => {
            if !path.is_file() {
                return Err(ArchiveError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("archive {} not found", path.display()),
                )));
            }
            return Ok(vec![path.to_path_buf()]);
        }
    };

    let parts = existing_parts(&base)?;
    let base_name = base.display().to_string();
    for (expected, (n, _)) in parts.iter().enumerate() {
        if *n != expected as u32 {
            return Err(ArchiveError::MissingPart {
                base: base_name,
                part: expected as u32,
            });
        }
    }
    let count = parts.len() as u32;
    if count == 0 {
        return Err(ArchiveError::MissingPart {
            base: base_name,
            part: 0,
        });
    }
    if let Some(n) = named {
        if n >= count {
            return Err(ArchiveError::MissingPart {
                base: base_name,
                part: count,
            });
        }
    }
    debug!(base = %base.display(), parts = count, "resolved archive parts");
    Ok(parts.into_iter().map(|(_, p)| p).collect())
}

/// Open `files` as one logical stream.
pub fn concat_reader(files: &[PathBuf]) -> Result<Box<dyn Read + Send>> {
    let mut reader: Box<dyn Read + Send> = Box::new(io::empty());
    for path in files {
        let file = File::open(path)?;
        reader = Box::new(reader.chain(file));
    }
    Ok(reader)
}

// ---------------------------------------------------------------------------
// PartWriter
// ---------------------------------------------------------------------------

/// Sink for an archive stream.  Without a part size everything goes to
/// `base`; with one, output goes to `<base>.part<n>` and a new part is
/// started on the first write after [`PartWriter::boundary`] observed the
/// current part at or above the threshold.
pub struct PartWriter {
    base: PathBuf,
    part_size: Option<u64>,
    current: Option<BufWriter<File>>,
    index: u32,
    in_part: u64,
    total: u64,
    cut_pending: bool,
    files: Vec<PathBuf>,
}

impl PartWriter {
    pub fn create(base: &Path, part_size: Option<u64>) -> Result<Self> {
        if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // Parts from an earlier, longer run would be picked up as a
        // continuation of this one.
        for (_, stale) in existing_parts(base)? {
            debug!(path = %stale.display(), "removing stale part");
            fs::remove_file(stale)?;
        }

        let first = match part_size {
            Some(_) => part_path(base, 0),
            None => base.to_path_buf(),
        };
        let file = File::create(&first)?;
        Ok(Self {
            base: base.to_path_buf(),
            part_size: part_size.map(|s| s.max(1)),
            current: Some(BufWriter::new(file)),
            index: 0,
            in_part: 0,
            total: 0,
            cut_pending: false,
            files: vec![first],
        })
    }

    /// Mark an entry boundary.  Callers must have flushed everything
    /// buffered above this writer first.
    pub fn boundary(&mut self) {
        if let Some(limit) = self.part_size {
            if self.in_part >= limit {
                self.cut_pending = true;
            }
        }
    }

    /// Bytes written so far across all parts.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn start_next_part(&mut self) -> io::Result<()> {
        if let Some(mut done) = self.current.take() {
            done.flush()?;
        }
        self.index += 1;
        let path = part_path(&self.base, self.index);
        info!(path = %path.display(), "starting archive part");
        self.current = Some(BufWriter::new(File::create(&path)?));
        self.files.push(path);
        self.in_part = 0;
        self.cut_pending = false;
        Ok(())
    }

    /// Flush the last part and return every file written, in order.
    pub fn finish(mut self) -> io::Result<Vec<PathBuf>> {
        if let Some(mut current) = self.current.take() {
            current.flush()?;
            current.get_ref().sync_all()?;
        }
        Ok(self.files)
    }
}

impl Write for PartWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cut_pending {
            self.start_next_part()?;
        }
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "part writer finished"))?;
        let n = current.write(buf)?;
        self.in_part += n as u64;
        self.total += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
