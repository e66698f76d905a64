//! OCI distribution plumbing for hangar: image references, manifests,
//! registry clients and the run-scoped blob cache.

pub mod auth;
pub mod cache;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod memory;
pub mod provision;
pub mod reference;
pub mod registry;

pub use auth::Credentials;
pub use cache::{BlobCache, CacheEntry, SingleFlight};
pub use error::{OciError, Result};
pub use manifest::{Descriptor, Manifest, Platform, PlatformFilter};
pub use memory::MemoryRegistry;
pub use provision::{provisioner_for, HarborProvisioner, NoopProvisioner, Provisioner, RepoType};
pub use reference::ImageRef;
pub use registry::{ClientOptions, Registry, RegistryClient};
