//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::relay::RelayOptions;

const DEFAULT_BIND_HTTP: &str = "0.0.0.0:8001";
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the local event cache.
    pub cache_root: PathBuf,
    /// HTTP bind address, e.g. `0.0.0.0:8001`.
    pub bind_http: String,
    /// Identities allowed to read and write, as npub or hex.
    pub allowed_npubs: Vec<String>,
    /// Upstream relays queried alongside the local cache.
    pub read_relays: Vec<String>,
    /// Relays every accepted event is published to.
    pub write_relays: Vec<String>,
    pub query_timeout: Duration,
    pub publish_timeout: Duration,
    /// Skip the authenticated-reader requirement.
    pub disable_auth: bool,
    /// Replace the file cache with a no-op backend.
    pub disable_local_cache: bool,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// `tracing` filter directive.
    pub log_level: String,
    pub info: RelayInfo,
}

/// Fields of the relay information document.
#[derive(Debug, Clone, Default)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub contact: String,
    pub icon: String,
    pub url: String,
    pub npub: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let cache_root = PathBuf::from(env::var("LOCAL_CACHE_PATH").context("LOCAL_CACHE_PATH")?);
        let bind_http = non_empty("BIND_HTTP").unwrap_or_else(|| DEFAULT_BIND_HTTP.into());
        let allowed_npubs = csv_strings(env::var("ALLOWED_NPUBS").unwrap_or_default());
        let read_relays = csv_strings(env::var("READ_RELAYS").unwrap_or_default());
        let write_relays = csv_strings(env::var("WRITE_RELAYS").unwrap_or_default());
        let query_timeout = secs("QUERY_TIMEOUT_SECS", DEFAULT_QUERY_TIMEOUT_SECS);
        let publish_timeout = secs("PUBLISH_TIMEOUT_SECS", DEFAULT_PUBLISH_TIMEOUT_SECS);
        let disable_auth = flag("DISABLE_AUTH");
        let disable_local_cache = flag("DISABLE_LOCAL_CACHE");
        let tor_socks = non_empty("TOR_SOCKS");
        let log_level = non_empty("LOG_LEVEL").unwrap_or_else(|| "info".into());
        let info = RelayInfo {
            name: env::var("RELAY_NAME").unwrap_or_default(),
            description: env::var("RELAY_DESCRIPTION").unwrap_or_default(),
            contact: env::var("RELAY_CONTACT").unwrap_or_default(),
            icon: env::var("RELAY_ICON").unwrap_or_default(),
            url: env::var("RELAY_URL").unwrap_or_default(),
            npub: non_empty("RELAY_NPUB"),
        };
        Ok(Self {
            cache_root,
            bind_http,
            allowed_npubs,
            read_relays,
            write_relays,
            query_timeout,
            publish_timeout,
            disable_auth,
            disable_local_cache,
            tor_socks,
            log_level,
            info,
        })
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            allowed: self.allowed_npubs.clone(),
            read_relays: self.read_relays.clone(),
            write_relays: self.write_relays.clone(),
            query_timeout: self.query_timeout,
            publish_timeout: self.publish_timeout,
            auth_required: !self.disable_auth,
        }
    }
}

/// Contents written by `init` when no `.env` exists yet.
pub fn default_env(cache_root: &str) -> String {
    let mut content = String::new();
    content.push_str(&format!("LOCAL_CACHE_PATH={cache_root}\n"));
    content.push_str(&format!("BIND_HTTP={DEFAULT_BIND_HTTP}\n"));
    content.push_str("# Lists are comma-separated; quote them if they contain spaces.\n");
    content.push_str("ALLOWED_NPUBS=\n");
    content.push_str("READ_RELAYS=\n");
    content.push_str("WRITE_RELAYS=\n");
    content.push_str(&format!("QUERY_TIMEOUT_SECS={DEFAULT_QUERY_TIMEOUT_SECS}\n"));
    content.push_str(&format!("PUBLISH_TIMEOUT_SECS={DEFAULT_PUBLISH_TIMEOUT_SECS}\n"));
    content.push_str("DISABLE_AUTH=0\n");
    content.push_str("DISABLE_LOCAL_CACHE=0\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("LOG_LEVEL=info\n");
    content.push_str("RELAY_NAME=\n");
    content.push_str("RELAY_DESCRIPTION=\n");
    content.push_str("RELAY_CONTACT=\n");
    content.push_str("RELAY_ICON=\n");
    content.push_str("RELAY_URL=\n");
    content.push_str("RELAY_NPUB=\n");
    content
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn flag(key: &str) -> bool {
    matches!(non_empty(key).as_deref(), Some("1" | "true" | "yes"))
}

fn secs(key: &str, default: u64) -> Duration {
    let value = non_empty(key)
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default);
    Duration::from_secs(value)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
