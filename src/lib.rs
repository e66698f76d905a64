//! hangar: batch save, load and mirror of container images
//!
//! Moves images between registries and local archives:
//!
//! - **save**: registry to archive (directory, tar stream, or segmented stream)
//! - **load**: archive to registry
//! - **mirror**: registry to registry, nothing persisted locally
//! - **load-validate** / **mirror-validate**: read-only integrity checks
//!
//! Every mode runs its jobs through a bounded worker pool.  A failing image
//! never stops the batch; it becomes a line in the mode's failure report,
//! and the report's presence after a run is the signal that something
//! failed.
//!
//! # Example: Mirror Against an In-Memory Registry
//!
//! ```no_run
//! use std::sync::Arc;
//! use hangar::{Engine, ImageList, Mode, RegistryConfig, RunConfig};
//! use hangar_oci::{ImageRef, MemoryRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(MemoryRegistry::new());
//!     registry.insert_image(&ImageRef::parse("src.local/app/web:1")?, &[b"layer"]);
//!
//!     let mut config = RunConfig::new(Mode::Mirror);
//!     config.dest = RegistryConfig::new("mirror.local");
//!     config.jobs = 4;
//!
//!     let engine = Engine::new(config, registry.clone(), registry);
//!     let summary = engine.mirror(&ImageList::from_text("src.local/app/web:1")).await?;
//!     println!("{} mirrored, {} failed", summary.succeeded, summary.failed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod list;
pub mod scheduler;
pub mod validate;

pub use config::{effective_jobs, parse_size, Mode, RegistryConfig, RunConfig};
pub use engine::Engine;
pub use error::{Error, JobError, Result, Stage};
pub use failure::{FailureRecord, FailureTracker, RunSummary};
pub use list::{ImageJob, ImageList, MalformedEntry, Pin};
pub use scheduler::{JobPipeline, Scheduler};
pub use validate::{ValidationResult, ValidationRun, Violation};

/// Crate version, printed by `hangar version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
