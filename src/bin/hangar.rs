//! hangar CLI entry point.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use hangar::config::{DEFAULT_ARCHIVE_NAME, DEFAULT_CACHE_DIR};
use hangar::{
    effective_jobs, parse_size, Engine, ImageList, Mode, RegistryConfig, RunConfig, RunSummary,
};
use hangar_archive::ArchiveFormat;
use hangar_oci::{PlatformFilter, RepoType};
use tracing_subscriber::EnvFilter;

/// Part size used when `--part` is given without `--part-size`.
const DEFAULT_PART_SIZE: &str = "2G";

#[derive(Parser)]
#[command(
    name = "hangar",
    about = "Save, load and mirror container images in bulk",
    disable_version_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Save images from a registry into a local archive
    Save(SaveArgs),
    /// Load images from a local archive into a registry
    Load(LoadArgs),
    /// Copy images from one registry to another
    Mirror(MirrorArgs),
    /// Verify a saved archive without changing it
    #[command(name = "load-validate")]
    LoadValidate(LoadArgs),
    /// Verify that mirrored images arrived intact
    #[command(name = "mirror-validate")]
    MirrorValidate(MirrorArgs),
    /// Print the version
    Version,
}

#[derive(Args)]
struct CommonArgs {
    /// Worker count; values below 1 run one worker
    #[arg(short = 'j', long, default_value_t = 1, allow_negative_numbers = true)]
    jobs: i64,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Failure report path (default: <mode>-failed.txt)
    #[arg(long)]
    failed: Option<PathBuf>,

    /// Bound on the whole run, e.g. "2h"
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Bound on each image, e.g. "10m"
    #[arg(long, value_parser = humantime::parse_duration)]
    job_timeout: Option<Duration>,

    /// Intermediate cache directory
    #[arg(long, default_value = DEFAULT_CACHE_DIR)]
    cache: PathBuf,

    /// Verify registry TLS certificates
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    tls_verify: bool,

    /// Destination registry flavour: default or harbor
    #[arg(long, default_value = "default")]
    repo_type: RepoType,

    /// Replace the project of derived destination references
    #[arg(long)]
    project: Option<String>,

    /// Replace the project of source references rebased onto SOURCE_REGISTRY
    #[arg(long)]
    source_project: Option<String>,

    /// Architectures to keep from multi-platform images, e.g. amd64,arm64
    #[arg(long, value_delimiter = ',')]
    arch: Vec<String>,

    /// Operating systems to keep from multi-platform images
    #[arg(long, value_delimiter = ',')]
    os: Vec<String>,

    #[command(flatten)]
    registries: RegistryArgs,
}

#[derive(Args)]
struct RegistryArgs {
    #[arg(long, env = "SOURCE_REGISTRY", default_value = "", hide = true)]
    source_registry: String,
    #[arg(long, env = "SOURCE_USERNAME", default_value = "", hide = true)]
    source_username: String,
    #[arg(long, env = "SOURCE_PASSWORD", default_value = "", hide = true, hide_env_values = true)]
    source_password: String,
    #[arg(long, env = "DEST_REGISTRY", default_value = "", hide = true)]
    dest_registry: String,
    #[arg(long, env = "DEST_USERNAME", default_value = "", hide = true)]
    dest_username: String,
    #[arg(long, env = "DEST_PASSWORD", default_value = "", hide = true, hide_env_values = true)]
    dest_password: String,
}

impl RegistryArgs {
    fn source(&self) -> RegistryConfig {
        RegistryConfig::new(&self.source_registry)
            .with_login(&self.source_username, &self.source_password)
    }

    fn dest(&self) -> RegistryConfig {
        RegistryConfig::new(&self.dest_registry)
            .with_login(&self.dest_username, &self.dest_password)
    }
}

#[derive(Args)]
struct SaveArgs {
    /// Image list
    #[arg(short = 'f', long = "file", visible_short_alias = 'i')]
    file: PathBuf,

    /// Output name; the compression's suffix is appended when missing
    #[arg(short = 'd', long = "destination", default_value = DEFAULT_ARCHIVE_NAME)]
    destination: String,

    /// Archive format: gzip, zstd, none or dir
    #[arg(long, default_value = "gzip")]
    compress: ArchiveFormat,

    /// Cut the archive into parts
    #[arg(long)]
    part: bool,

    /// Part size threshold, e.g. 100M or 2G
    #[arg(long, value_parser = parse_size)]
    part_size: Option<u64>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct LoadArgs {
    /// Archive, directory or first part to read
    #[arg(short = 's', long = "source")]
    source: PathBuf,

    /// Only load the images in this list
    #[arg(short = 'f', long = "file", visible_short_alias = 'i')]
    file: Option<PathBuf>,

    /// Accepted for symmetry with save; the format is detected from the
    /// archive itself
    #[arg(long)]
    compress: Option<ArchiveFormat>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct MirrorArgs {
    /// Image list
    #[arg(short = 'f', long = "file", visible_short_alias = 'i')]
    file: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

impl Command {
    fn common(&self) -> Option<&CommonArgs> {
        match self {
            Command::Save(a) => Some(&a.common),
            Command::Load(a) | Command::LoadValidate(a) => Some(&a.common),
            Command::Mirror(a) | Command::MirrorValidate(a) => Some(&a.common),
            Command::Version => None,
        }
    }
}

#[tokio::main]
async fn main() {
    if matches!(
        std::env::args().nth(1).as_deref(),
        Some("-v" | "--version")
    ) {
        print_version();
        return;
    }

    let cli = Cli::parse();
    let Some(common) = cli.command.common() else {
        print_version();
        return;
    };

    let default_level = if common.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match dispatch(cli.command).await {
        Ok(summary) => match &summary.report {
            None => println!("{} images processed, no failures", summary.succeeded),
            Some(report) => eprintln!(
                "{} of {} images failed, see {}",
                summary.failed,
                summary.total,
                report.display()
            ),
        },
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn print_version() {
    println!("hangar version {}", hangar::VERSION);
}

async fn dispatch(command: Command) -> hangar::Result<RunSummary> {
    match command {
        Command::Save(args) => {
            let mut config = base_config(Mode::Save, &args.common);
            // A save run pulls from DEST_* when no separate source is set.
            if !config.source.is_configured() {
                config.source = args.common.registries.dest();
            }
            config.dest = RegistryConfig::default();
            config.format = args.compress;
            config.archive = args.compress.output_path(&args.destination);
            config.part_size = match (args.part, args.part_size) {
                (false, _) => None,
                (true, Some(size)) => Some(size),
                (true, None) => Some(parse_size(DEFAULT_PART_SIZE).map_err(hangar::Error::Config)?),
            };
            let list = ImageList::from_path(&args.file)?;
            Engine::from_config(config)?.save(&list).await
        }
        Command::Load(args) => {
            let config = load_config(Mode::Load, &args);
            let list = args.file.as_deref().map(ImageList::from_path).transpose()?;
            Engine::from_config(config)?.load(list.as_ref()).await
        }
        Command::LoadValidate(args) => {
            let config = load_config(Mode::LoadValidate, &args);
            Ok(Engine::from_config(config)?.load_validate().await?.summary)
        }
        Command::Mirror(args) => {
            let config = base_config(Mode::Mirror, &args.common);
            let list = ImageList::from_path(&args.file)?;
            Engine::from_config(config)?.mirror(&list).await
        }
        Command::MirrorValidate(args) => {
            let config = base_config(Mode::MirrorValidate, &args.common);
            let list = ImageList::from_path(&args.file)?;
            Ok(Engine::from_config(config)?.mirror_validate(&list).await?.summary)
        }
        Command::Version => {
            print_version();
            Ok(RunSummary {
                total: 0,
                succeeded: 0,
                failed: 0,
                report: None,
            })
        }
    }
}

fn base_config(mode: Mode, common: &CommonArgs) -> RunConfig {
    let mut config = RunConfig::new(mode);
    config.jobs = effective_jobs(common.jobs);
    config.timeout = common.timeout;
    config.job_timeout = common.job_timeout;
    config.cache_dir = common.cache.clone();
    if let Some(path) = &common.failed {
        config.report_path = path.clone();
    }
    config.source = common.registries.source();
    config.dest = common.registries.dest();
    config.repo_type = common.repo_type;
    config.project = common.project.clone();
    config.source_project = common.source_project.clone();
    config.platforms = PlatformFilter::new(&common.arch, &common.os);
    config.tls_verify = common.tls_verify;
    config
}

fn load_config(mode: Mode, args: &LoadArgs) -> RunConfig {
    let mut config = base_config(mode, &args.common);
    config.archive = args.source.clone();
    if let Some(format) = args.compress {
        config.format = format;
    }
    config
}
