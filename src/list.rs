//! Image list parsing.
//!
//! One job per line: `<source>` or `<source> <destination>`.  Blank lines
//! and `#` comments (whole-line or trailing) are skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::Lines;

use hangar_oci::ImageRef;
use tracing::debug;

use crate::error::{Error, Result};

/// A line that is neither blank, a comment nor a valid job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {reason}: {content:?}")]
pub struct MalformedEntry {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

/// What a job's source reference is pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pin {
    Tag(String),
    Digest(String),
}

/// One parsed list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    /// 1-based position among the list's entries.
    pub id: usize,
    /// 1-based line number in the source text.
    pub line: usize,
    /// The entry as written, without its comment.  Failure reports name
    /// jobs by this text so a report can be fed back as a list.
    pub text: String,
    pub source: ImageRef,
    pub destination: Option<ImageRef>,
}

impl ImageJob {
    pub fn pin(&self) -> Pin {
        if self.source.is_digest() {
            Pin::Digest(self.source.reference.clone())
        } else {
            Pin::Tag(self.source.reference.clone())
        }
    }
}

/// A parsed-on-demand image list.  Iteration is lazy and can be restarted
/// any number of times.
#[derive(Debug, Clone)]
pub struct ImageList {
    text: String,
    origin: Option<PathBuf>,
}

impl ImageList {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| Error::List {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), bytes = text.len(), "read image list");
        Ok(Self {
            text,
            origin: Some(path.to_path_buf()),
        })
    }

    /// Where the list was read from, if it came from a file.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Entries in line order, starting from the first line.
    pub fn iter(&self) -> Entries<'_> {
        Entries {
            lines: self.text.lines(),
            line: 0,
            next_id: 1,
        }
    }

    /// Split the list into valid jobs and malformed entries.
    pub fn jobs(&self) -> (Vec<ImageJob>, Vec<MalformedEntry>) {
        let mut jobs = Vec::new();
        let mut malformed = Vec::new();
        for entry in self.iter() {
            match entry {
                Ok(job) => jobs.push(job),
                Err(bad) => malformed.push(bad),
            }
        }
        (jobs, malformed)
    }
}

impl<'a> IntoIterator for &'a ImageList {
    type Item = std::result::Result<ImageJob, MalformedEntry>;
    type IntoIter = Entries<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over an [`ImageList`].
pub struct Entries<'a> {
    lines: Lines<'a>,
    line: usize,
    next_id: usize,
}

impl Iterator for Entries<'_> {
    type Item = std::result::Result<ImageJob, MalformedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = self.lines.next()?;
            self.line += 1;
            let content = strip_comment(raw).trim();
            if content.is_empty() {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            return Some(parse_entry(id, self.line, content));
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_entry(
    id: usize,
    line: usize,
    content: &str,
) -> std::result::Result<ImageJob, MalformedEntry> {
    let malformed = |reason: String| MalformedEntry {
        line,
        content: content.to_string(),
        reason,
    };

    let tokens: Vec<&str> = content.split_whitespace().collect();
    let (source, destination) = match tokens.as_slice() {
        [source] => (*source, None),
        [source, dest] => (*source, Some(*dest)),
        _ => {
            return Err(malformed(format!(
                "expected 1 or 2 references, found {}",
                tokens.len()
            )))
        }
    };

    let source = ImageRef::parse(source).map_err(|e| malformed(e.to_string()))?;
    let destination = destination
        .map(ImageRef::parse)
        .transpose()
        .map_err(|e| malformed(e.to_string()))?;

    Ok(ImageJob {
        id,
        line,
        text: tokens.join(" "),
        source,
        destination,
    })
}
