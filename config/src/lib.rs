//! Configuration loading and validation.
//!
//! Raw YAML documents are private serde structs; this module exposes the
//! resolved types the rest of the workspace consumes. Resolution happens
//! once at load time: every regex is compiled, every numeric bound
//! checked, every listener reference verified. Existence of a resolved
//! value is the proof of its validity.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]

mod raw;
pub mod template;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

/// Default configuration file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "kiln.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Process-wide log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Store backend selection. Memory is the only backend that ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
}

/// Kind of a configured provider instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    File,
    Rest,
}

/// One configured provider: its kind plus the free-form options the
/// provider itself validates at construction.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    pub options: serde_json::Value,
}

/// A `(name, provider, config)` triple naming one fetchable resource.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub name: String,
    pub provider: String,
    pub config: serde_json::Value,
}

/// One loader parser rule.
#[derive(Debug, Clone)]
pub struct ParserRule {
    pub name: String,
    /// The index resource. Rules carry exactly one.
    pub resource: ResourceSpec,
    /// JSONPath projecting a segment into a list of items. Empty: no
    /// item processing.
    pub filter: String,
    /// Per-item parameters: `(key, jsonpath)` in declaration order.
    pub item_params: Vec<(String, String)>,
    /// The sub-resource template; `$key` tokens are substituted per item.
    pub item: Option<ResourceSpec>,
    /// Also store the index resource itself.
    pub persist: bool,
}

/// One state entry of a renderer rule.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub key: String,
    pub resource: String,
    pub export_to_client: bool,
}

/// One renderer rule: path pattern, state requirements, terminal flag.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub path: Regex,
    pub state: Vec<StateEntry>,
    pub terminal: bool,
}

/// TLS client authentication modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    #[default]
    None,
    Request,
    Require,
    Verify,
    RequireAndVerify,
}

/// TLS settings for a listener.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_file: String,
    pub key_file: String,
    pub ca_files: Vec<String>,
    pub client_auth: ClientAuth,
}

/// Redirect settings for a listener that only bounces to HTTPS.
#[derive(Debug, Clone)]
pub struct RedirectSettings {
    /// Port appended to the redirect target host; omitted when `None`.
    pub target_port: Option<u16>,
    /// Patience for slow request heads before the connection is dropped.
    pub header_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub enum ListenerMode {
    Plain,
    Tls(TlsSettings),
    Redirect(RedirectSettings),
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    pub addr: SocketAddr,
    pub mode: ListenerMode,
}

/// Response-cache knobs for one site.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_s: u64,
    pub max_items: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_s: 60,
            max_items: 1024,
        }
    }
}

/// Sandbox resource limits for one site.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Maximum concurrently live sandboxes. Always > 0.
    pub max_vms: usize,
    pub vm_timeout_ms: u64,
    pub permit_timeout_ms: u64,
    /// Maximum JS heap in bytes; 0 keeps the engine default.
    pub heap_max_bytes: usize,
    /// Worker native stack in bytes; 0 keeps the platform default.
    pub stack_max_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_vms: 4,
            vm_timeout_ms: 500,
            permit_timeout_ms: 5000,
            heap_max_bytes: 0,
            stack_max_bytes: 0,
        }
    }
}

/// One configured site.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub name: String,
    /// Listener names this site is served on; all resolved.
    pub listeners: Vec<String>,
    /// Value surfaced to the bundle as `process.env.ENV`.
    pub env: String,
    pub index_file: String,
    pub bundle_file: String,
    /// Id of the `<div>` the SSR body is spliced into.
    pub container: String,
    /// Id of the client-state `<script>` element.
    pub state_id: String,
    pub sandbox: SandboxSettings,
    pub cache: CacheSettings,
    pub rules: Vec<RouteRule>,
    /// Directory served as static files before SSR, when set.
    pub static_dir: Option<String>,
    /// Extra response headers appended to every response.
    pub headers: Vec<(String, String)>,
    /// Body served at `/robots.txt`, when set.
    pub robots: Option<String>,
}

/// The fully resolved configuration document.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub store: StoreBackend,
    pub providers: HashMap<String, ProviderSpec>,
    pub parsers: Vec<ParserRule>,
    pub listeners: Vec<ListenerConfig>,
    pub sites: Vec<SiteConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse and validate a configuration document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: raw::RawDocument = serde_yaml::from_str(text)?;
        raw.resolve()
    }

    #[must_use]
    pub fn listener(&self, name: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.name == name)
    }
}
