//! Destination provisioning for registries that model repositories as
//! managed entities.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::auth::Credentials;
use crate::error::Result;
use crate::reference::{registry_scheme, ImageRef};
use crate::registry::status_error;

/// Registry flavour selected with `--repo-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepoType {
    /// Plain OCI distribution: repositories spring into existence on push.
    #[default]
    Default,
    /// Harbor: pushes fail unless the project already exists.
    Harbor,
}

impl FromStr for RepoType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "default" => Ok(RepoType::Default),
            "harbor" => Ok(RepoType::Harbor),
            other => Err(format!(
                "unknown repo type {:?} (expected \"default\" or \"harbor\")",
                other
            )),
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoType::Default => write!(f, "default"),
            RepoType::Harbor => write!(f, "harbor"),
        }
    }
}

/// Creates whatever a destination needs before the first push into it.
///
/// Called at most once per `(registry, project)` per run; the registry
/// client deduplicates concurrent calls.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        http: &reqwest::Client,
        credentials: Option<&Credentials>,
        image: &ImageRef,
    ) -> Result<()>;
}

/// Provisioner for plain registries.
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn provision(
        &self,
        _http: &reqwest::Client,
        _credentials: Option<&Credentials>,
        _image: &ImageRef,
    ) -> Result<()> {
        Ok(())
    }
}

/// Creates the Harbor project named by the first repository component.
/// Projects are created private; an existing project counts as success.
pub struct HarborProvisioner;

#[async_trait]
impl Provisioner for HarborProvisioner {
    async fn provision(
        &self,
        http: &reqwest::Client,
        credentials: Option<&Credentials>,
        image: &ImageRef,
    ) -> Result<()> {
        let project = image.project();
        let url = format!(
            "{}://{}/api/v2.0/projects",
            registry_scheme(&image.registry),
            image.registry
        );
        let body = serde_json::json!({
            "project_name": project,
            "metadata": { "public": "false" },
        });

        let mut req = http.post(&url).json(&body);
        if let Some(creds) = credentials {
            req = req.basic_auth(&creds.username, Some(creds.password()));
        }
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::CREATED => {
                info!(registry = %image.registry, project, "created harbor project");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(registry = %image.registry, project, "harbor project already exists");
                Ok(())
            }
            _ => Err(status_error(&url, resp).await),
        }
    }
}

/// The provisioner matching `repo_type`.
pub fn provisioner_for(repo_type: RepoType) -> std::sync::Arc<dyn Provisioner> {
    match repo_type {
        RepoType::Default => std::sync::Arc::new(NoopProvisioner),
        RepoType::Harbor => std::sync::Arc::new(HarborProvisioner),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
