//! Registry credentials and `WWW-Authenticate` challenge handling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};

/// Username/password for one registry endpoint.  Constructed once per run
/// and shared read-only with every client that talks to `registry`.
pub struct Credentials {
    pub registry: String,
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(
        registry: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Whether these credentials belong to `host`.
    pub fn matches(&self, host: &str) -> bool {
        let configured = self
            .registry
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        configured == host
            || (is_docker_hub(configured) && is_docker_hub(host))
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn is_docker_hub(host: &str) -> bool {
    matches!(
        host,
        "docker.io" | "index.docker.io" | "registry-1.docker.io"
    )
}

// ---------------------------------------------------------------------------
// Challenges
// ---------------------------------------------------------------------------

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, _) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let realm = extract_param(header, "realm")?;
        Some(Challenge::Bearer {
            realm,
            service: extract_param(header, "service"),
            scope: extract_param(header, "scope"),
        })
    }
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
pub(crate) fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let start = header.find(&search)?;
    let value_start = start + search.len();
    let end = header[value_start..].find('"')?;
    Some(header[value_start..value_start + end].to_string())
}

// ---------------------------------------------------------------------------
// Token cache
// ---------------------------------------------------------------------------

/// Bearer tokens keyed by registry host and scope, reused across requests
/// for the lifetime of one client.
#[derive(Default)]
pub(crate) struct TokenCache {
    tokens: Mutex<HashMap<(String, String), String>>,
}

impl TokenCache {
    pub fn get(&self, host: &str, scope: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(host.to_string(), scope.to_string()))
            .cloned()
    }

    pub fn insert(&self, host: &str, scope: &str, token: String) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((host.to_string(), scope.to_string()), token);
    }
}
