use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, info};

use crate::auth::{Challenge, Credentials, TokenCache};
use crate::digest;
use crate::error::{OciError, Result};
use crate::manifest::{self, Manifest};
use crate::provision::{NoopProvisioner, Provisioner};
use crate::reference::{registry_scheme, ImageRef};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The registry operations the transfer engine needs.
///
/// Every operation fails with [`OciError::Auth`], [`OciError::NotFound`],
/// [`OciError::Network`] or [`OciError::DigestMismatch`] for the failure
/// classes the engine distinguishes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the manifest or index `image` points at.  Digest-pinned
    /// references are verified against the returned bytes.
    async fn pull_manifest(&self, image: &ImageRef) -> Result<Manifest>;

    /// Download a blob from `image`'s repository and verify its digest.
    async fn pull_blob(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>>;

    /// Whether `image`'s repository already holds `digest`.
    async fn blob_exists(&self, image: &ImageRef, digest: &str) -> Result<bool>;

    /// Upload a blob into `image`'s repository.
    async fn push_blob(&self, image: &ImageRef, digest: &str, data: Vec<u8>) -> Result<()>;

    /// Store `manifest` under `image`'s tag or digest.
    async fn push_manifest(&self, image: &ImageRef, manifest: &Manifest) -> Result<()>;

    /// Prepare the destination for pushes.  A no-op except for backends that
    /// model repositories as provisioned entities.  Callers deduplicate per
    /// project; every call reaches the backend.
    async fn ensure_destination_exists(&self, image: &ImageRef) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Connection settings fixed for the lifetime of a [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub credentials: Option<Arc<Credentials>>,
    pub tls_verify: bool,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            tls_verify: true,
            user_agent: concat!("hangar/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// OCI Distribution HTTP client.
pub struct RegistryClient {
    client: reqwest::Client,
    credentials: Option<Arc<Credentials>>,
    tokens: TokenCache,
    provisioner: Arc<dyn Provisioner>,
}

#[derive(Clone, Copy)]
enum Access {
    Pull,
    Push,
}

impl Access {
    fn scope(self, repository: &str) -> String {
        match self {
            Access::Pull => format!("repository:{}:pull", repository),
            Access::Push => format!("repository:{}:pull,push", repository),
        }
    }
}

impl RegistryClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent)
            .danger_accept_invalid_certs(!options.tls_verify)
            .build()?;
        Ok(Self {
            client,
            credentials: options.credentials,
            tokens: TokenCache::default(),
            provisioner: Arc::new(NoopProvisioner),
        })
    }

    /// Install the backend extension used by
    /// [`Registry::ensure_destination_exists`].
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// The underlying HTTP client, shared with provisioners.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn credentials_for(&self, host: &str) -> Option<&Credentials> {
        self.credentials.as_deref().filter(|c| c.matches(host))
    }

    fn base_url(image: &ImageRef) -> String {
        format!(
            "{}://{}/v2/{}",
            registry_scheme(&image.registry),
            image.registry,
            image.repository
        )
    }

    // -- internals ----------------------------------------------------------

    /// Send a request built by `build`, answering a `401` challenge once with
    /// a bearer token or basic credentials and replaying the request.
    async fn send<F>(&self, image: &ImageRef, access: Access, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let scope = access.scope(&image.repository);
        let mut req = build(&self.client);
        if let Some(token) = self.tokens.get(&image.registry, &scope) {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let resp = req.send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        // Extract www-authenticate and answer the challenge.
        let www_auth = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let retry = match Challenge::parse(&www_auth) {
            Some(Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            }) => {
                let scope = challenge_scope.unwrap_or(scope);
                let token = self
                    .fetch_bearer_token(&image.registry, &realm, service.as_deref(), &scope)
                    .await?;
                self.tokens
                    .insert(&image.registry, &access.scope(&image.repository), token.clone());
                build(&self.client).header(AUTHORIZATION, format!("Bearer {}", token))
            }
            Some(Challenge::Basic) => {
                let creds = self.credentials_for(&image.registry).ok_or_else(|| {
                    OciError::Auth(format!("{} requires credentials", image.registry))
                })?;
                build(&self.client).basic_auth(&creds.username, Some(creds.password()))
            }
            None => {
                return Err(OciError::Auth(format!(
                    "{} returned 401 without a usable challenge",
                    image.registry
                )))
            }
        };

        let resp = retry.send().await?;
        if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(OciError::Auth(format!(
                "{} rejected credentials for {}",
                image.registry, image.repository
            )));
        }
        Ok(resp)
    }

    /// Fetch a token from the challenge realm, authenticating with the
    /// configured credentials when they belong to `host`.
    async fn fetch_bearer_token(
        &self,
        host: &str,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<String> {
        debug!(realm, scope, "fetching bearer token");
        let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }
        let mut req = self.client.get(realm).query(&query);
        if let Some(creds) = self.credentials_for(host) {
            req = req.basic_auth(&creds.username, Some(creds.password()));
        }

        let resp = req.send().await?;
        if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(OciError::Auth(format!(
                "token endpoint {} returned {}",
                realm,
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(status_error(realm, resp).await);
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Auth("token response missing token field".to_string()))?;

        Ok(token.to_string())
    }

    async fn start_upload(&self, image: &ImageRef) -> Result<reqwest::Url> {
        let url = format!("{}/blobs/uploads/", Self::base_url(image));
        let resp = self
            .send(image, Access::Push, |c| c.post(&url).header(CONTENT_TYPE, "application/octet-stream"))
            .await?;
        if resp.status() != StatusCode::ACCEPTED && !resp.status().is_success() {
            return Err(status_error(&url, resp).await);
        }
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| OciError::Registry(format!("{} returned no upload location", url)))?;

        let base = reqwest::Url::parse(&url)
            .map_err(|e| OciError::Registry(format!("invalid registry URL {}: {}", url, e)))?;
        base.join(location)
            .map_err(|e| OciError::Registry(format!("invalid upload location {:?}: {}", location, e)))
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn pull_manifest(&self, image: &ImageRef) -> Result<Manifest> {
        let url = format!("{}/manifests/{}", Self::base_url(image), image.reference);
        let accept = manifest::accept_header();

        let resp = self
            .send(image, Access::Pull, |c| c.get(&url).header(ACCEPT, &accept))
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(&url, resp).await);
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();

        let m = Manifest::from_bytes(body, content_type.as_deref())?;
        if image.is_digest() && m.digest != image.reference {
            return Err(OciError::DigestMismatch {
                expected: image.reference.clone(),
                actual: m.digest,
            });
        }
        debug!(image = %image, digest = %m.digest, media_type = %m.media_type, "pulled manifest");
        Ok(m)
    }

    async fn pull_blob(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{}", Self::base_url(image), digest);
        info!(digest, repository = %image.repository, "downloading blob");

        let resp = self.send(image, Access::Pull, |c| c.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(status_error(&url, resp).await);
        }
        let data = resp.bytes().await?.to_vec();
        digest::verify(digest, &data)?;
        Ok(data)
    }

    async fn blob_exists(&self, image: &ImageRef, digest: &str) -> Result<bool> {
        let url = format!("{}/blobs/{}", Self::base_url(image), digest);
        let resp = self.send(image, Access::Pull, |c| c.head(&url)).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(&url, resp).await),
        }
    }

    async fn push_blob(&self, image: &ImageRef, digest: &str, data: Vec<u8>) -> Result<()> {
        digest::verify(digest, &data)?;
        if self.blob_exists(image, digest).await? {
            debug!(digest, repository = %image.repository, "blob already present");
            return Ok(());
        }

        let mut upload = self.start_upload(image).await?;
        upload.query_pairs_mut().append_pair("digest", digest);
        info!(digest, repository = %image.repository, size = data.len(), "uploading blob");

        let resp = self
            .send(image, Access::Push, |c| {
                c.put(upload.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(upload.as_str(), resp).await);
        }
        Ok(())
    }

    async fn push_manifest(&self, image: &ImageRef, manifest: &Manifest) -> Result<()> {
        let url = format!("{}/manifests/{}", Self::base_url(image), image.reference);
        let resp = self
            .send(image, Access::Push, |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, &manifest.media_type)
                    .body(manifest.raw.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(&url, resp).await);
        }
        info!(image = %image, digest = %manifest.digest, "pushed manifest");
        Ok(())
    }

    async fn ensure_destination_exists(&self, image: &ImageRef) -> Result<()> {
        let creds = self.credentials_for(&image.registry);
        self.provisioner.provision(&self.client, creds, image).await
    }
}

/// Map a non-success response onto the engine's failure classes.
pub(crate) async fn status_error(url: &str, resp: Response) -> OciError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            OciError::Auth(format!("{} returned {}", url, status))
        }
        StatusCode::NOT_FOUND => OciError::NotFound(url.to_string()),
        _ => OciError::Registry(format!("{} returned {}: {}", url, status, body.trim())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
