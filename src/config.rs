//! Run configuration.
//!
//! Everything a run needs is resolved up front into an immutable
//! [`RunConfig`]; the engine never reads the environment itself.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hangar_archive::ArchiveFormat;
use hangar_oci::{Credentials, PlatformFilter, RepoType};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};

/// Default name of a save run's output.
pub const DEFAULT_ARCHIVE_NAME: &str = "saved-images";

/// Default intermediate cache directory.
pub const DEFAULT_CACHE_DIR: &str = "saved-image-cache";

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// The top-level run modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Save,
    Load,
    Mirror,
    LoadValidate,
    MirrorValidate,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Save => "save",
            Mode::Load => "load",
            Mode::Mirror => "mirror",
            Mode::LoadValidate => "load-validate",
            Mode::MirrorValidate => "mirror-validate",
        }
    }

    /// Fixed name of the failure report this mode writes.
    pub fn report_name(self) -> String {
        format!("{}-failed.txt", self.as_str())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Registry endpoints
// ---------------------------------------------------------------------------

/// One side of a transfer: `SOURCE_*` or `DEST_*`.
pub struct RegistryConfig {
    pub registry: String,
    pub username: String,
    pub password: SecretString,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry: String::new(),
            username: String::new(),
            password: SecretString::from(String::new()),
        }
    }
}

impl Clone for RegistryConfig {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            username: self.username.clone(),
            password: SecretString::from(self.password.expose_secret().to_string()),
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl RegistryConfig {
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            ..Self::default()
        }
    }

    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = SecretString::from(password.into());
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.host().is_empty()
    }

    /// Registry host without scheme or trailing slash.
    pub fn host(&self) -> String {
        normalize_host(&self.registry)
    }

    /// Credentials for this registry, if a username was given.
    pub fn credentials(&self) -> Option<Arc<Credentials>> {
        if self.username.is_empty() || !self.is_configured() {
            return None;
        }
        Some(Arc::new(Credentials::new(
            self.host(),
            self.username.clone(),
            self.password.expose_secret().to_string(),
        )))
    }
}

/// Strip a URL scheme and trailing slashes from a registry address.
pub fn normalize_host(registry: &str) -> String {
    registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

// ---------------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------------

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    /// Effective worker count, already clamped.
    pub jobs: usize,
    /// Bound on the whole run.
    pub timeout: Option<Duration>,
    /// Bound on each job.
    pub job_timeout: Option<Duration>,
    pub format: ArchiveFormat,
    /// Segment threshold for stream archives.
    pub part_size: Option<u64>,
    pub cache_dir: PathBuf,
    pub report_path: PathBuf,
    /// Save output (already suffixed) or load / load-validate input.
    pub archive: PathBuf,
    pub source: RegistryConfig,
    pub dest: RegistryConfig,
    pub repo_type: RepoType,
    /// Replaces the first repository component of derived destinations.
    pub project: Option<String>,
    /// Replaces the first repository component of rebased sources.
    pub source_project: Option<String>,
    /// Index children to keep; empty keeps all.
    pub platforms: PlatformFilter,
    pub tls_verify: bool,
}

impl RunConfig {
    /// Defaults for `mode`: one worker, gzip, default names.
    pub fn new(mode: Mode) -> Self {
        let format = ArchiveFormat::default();
        Self {
            mode,
            jobs: 1,
            timeout: None,
            job_timeout: None,
            format,
            part_size: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            report_path: PathBuf::from(mode.report_name()),
            archive: format.output_path(DEFAULT_ARCHIVE_NAME),
            source: RegistryConfig::default(),
            dest: RegistryConfig::default(),
            repo_type: RepoType::Default,
            project: None,
            source_project: None,
            platforms: PlatformFilter::default(),
            tls_verify: true,
        }
    }

    /// Reject combinations no run can satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.part_size.is_some() && self.format == ArchiveFormat::Directory {
            return Err(Error::Config(
                "--part cannot be combined with --compress dir".into(),
            ));
        }
        if matches!(self.mode, Mode::Load | Mode::Mirror) && !self.dest.is_configured() {
            return Err(Error::Config(format!(
                "{} needs a destination registry (DEST_REGISTRY)",
                self.mode
            )));
        }
        if self.mode == Mode::MirrorValidate && !self.dest.is_configured() {
            return Err(Error::Config(
                "mirror-validate needs a destination registry (DEST_REGISTRY)".into(),
            ));
        }
        Ok(())
    }
}

/// Clamp a requested worker count: anything below 1 runs one worker.
/// Large values are accepted as-is.
pub fn effective_jobs(requested: i64) -> usize {
    if requested < 1 {
        1
    } else {
        usize::try_from(requested).unwrap_or(usize::MAX)
    }
}

/// Parse a byte size such as `100M`, `2G`, `512k`, `1MiB` or `4096`.
/// Suffixes are binary multiples.
pub fn parse_size(input: &str) -> std::result::Result<u64, String> {
    let s = input.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);
    if number.is_empty() {
        return Err(format!("invalid size {:?}", input));
    }
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid size {:?}", input))?;

    let unit = suffix.trim().to_ascii_uppercase();
    let unit = unit
        .strip_suffix("IB")
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(&unit);
    let multiplier: u64 = match unit {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return Err(format!("unknown size suffix in {:?}", input)),
    };
    let size = value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {:?} is too large", input))?;
    if size == 0 {
        return Err("size must be greater than zero".into());
    }
    Ok(size)
}
