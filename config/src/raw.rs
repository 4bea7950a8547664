//! Raw configuration documents.
//!
//! These structs mirror the YAML layout and stay private; `resolve`
//! turns them into the validated types in the crate root. Free-form
//! provider and resource options are carried as YAML mappings and
//! converted to JSON values, since providers parse their own schema
//! with serde.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::Deserialize;

use crate::{
    CacheSettings, ClientAuth, Config, ConfigError, ListenerConfig, ListenerMode, LogLevel,
    ParserRule, ProviderKind, ProviderSpec, RedirectSettings, ResourceSpec, RouteRule,
    SandboxSettings, SiteConfig, StateEntry, StoreBackend, TlsSettings,
};

const DEFAULT_REDIRECT_HEADER_TIMEOUT_S: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawDocument {
    #[serde(default)]
    log: RawLog,
    app: RawApp,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLog {
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawApp {
    #[serde(default)]
    store: RawStore,
    #[serde(default)]
    fetcher: RawFetcher,
    #[serde(default)]
    loader: RawLoader,
    server: RawServer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStore {
    storage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFetcher {
    #[serde(default)]
    providers: HashMap<String, RawProvider>,
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    options: serde_yaml::Mapping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLoader {
    #[serde(default)]
    parsers: Vec<RawParser>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParser {
    name: Option<String>,
    resource: serde_yaml::Mapping,
    #[serde(default)]
    filter: String,
    #[serde(default)]
    item_params: serde_yaml::Mapping,
    item: Option<serde_yaml::Mapping>,
    #[serde(default)]
    persist: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResourceBody {
    provider: String,
    #[serde(default)]
    config: serde_yaml::Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    #[serde(default)]
    listeners: Vec<RawListener>,
    #[serde(default)]
    sites: Vec<RawSite>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListener {
    name: String,
    listen: String,
    tls: Option<RawTls>,
    redirect: Option<RawRedirect>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTls {
    cert_file: String,
    key_file: String,
    #[serde(default)]
    ca_files: Vec<String>,
    client_auth: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRedirect {
    target_port: Option<u16>,
    header_timeout_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSite {
    name: String,
    #[serde(default)]
    listeners: Vec<String>,
    env: Option<String>,
    index: String,
    bundle: String,
    container: Option<String>,
    state_id: Option<String>,
    max_vms: Option<usize>,
    vm_timeout_ms: Option<u64>,
    permit_timeout_ms: Option<u64>,
    heap_max_bytes: Option<usize>,
    stack_max_bytes: Option<usize>,
    cache: Option<RawCache>,
    #[serde(default)]
    rules: Vec<RawRule>,
    static_dir: Option<String>,
    #[serde(default)]
    headers: serde_yaml::Mapping,
    robots: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCache {
    #[serde(default = "default_true")]
    enabled: bool,
    ttl_s: Option<u64>,
    max_items: Option<usize>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    path: String,
    #[serde(default)]
    state: Vec<RawStateEntry>,
    #[serde(default)]
    terminal: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStateEntry {
    key: String,
    resource: String,
    #[serde(default)]
    export: bool,
}

impl RawDocument {
    pub(crate) fn resolve(self) -> Result<Config, ConfigError> {
        let log_level = parse_log_level(self.log.level.as_deref())?;
        let store = parse_store(self.app.store.storage.as_deref())?;

        let mut providers = HashMap::new();
        for (name, provider) in self.app.fetcher.providers {
            let kind = match provider.kind.as_str() {
                "file" => ProviderKind::File,
                "rest" => ProviderKind::Rest,
                other => {
                    return Err(ConfigError::invalid(format!(
                        "provider {name}: unknown type {other:?}"
                    )));
                }
            };
            let options = yaml_to_json(serde_yaml::Value::Mapping(provider.options))?;
            providers.insert(name, ProviderSpec { kind, options });
        }

        let mut parsers = Vec::with_capacity(self.app.loader.parsers.len());
        for (index, parser) in self.app.loader.parsers.into_iter().enumerate() {
            parsers.push(resolve_parser(index, parser, &providers)?);
        }

        let mut listeners = Vec::with_capacity(self.app.server.listeners.len());
        let mut listener_names = HashSet::new();
        for listener in self.app.server.listeners {
            if !listener_names.insert(listener.name.clone()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate listener name {:?}",
                    listener.name
                )));
            }
            listeners.push(resolve_listener(listener)?);
        }

        let mut sites = Vec::with_capacity(self.app.server.sites.len());
        let mut site_names = HashSet::new();
        for site in self.app.server.sites {
            if !site_names.insert(site.name.clone()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate site name {:?}",
                    site.name
                )));
            }
            sites.push(resolve_site(site, &listener_names)?);
        }

        Ok(Config {
            log_level,
            store,
            providers,
            parsers,
            listeners,
            sites,
        })
    }
}

fn parse_log_level(level: Option<&str>) -> Result<LogLevel, ConfigError> {
    match level {
        None => Ok(LogLevel::default()),
        Some("trace") => Ok(LogLevel::Trace),
        Some("debug") => Ok(LogLevel::Debug),
        Some("info") => Ok(LogLevel::Info),
        Some("warn") => Ok(LogLevel::Warn),
        Some("error") => Ok(LogLevel::Error),
        Some(other) => Err(ConfigError::invalid(format!("unknown log level {other:?}"))),
    }
}

fn parse_store(storage: Option<&str>) -> Result<StoreBackend, ConfigError> {
    match storage {
        None | Some("memory") => Ok(StoreBackend::Memory),
        Some(other) => Err(ConfigError::invalid(format!(
            "unknown store backend {other:?}"
        ))),
    }
}

/// Extract the sole `name: body` entry of a resource-spec mapping.
fn resolve_resource_spec(
    context: &str,
    mapping: serde_yaml::Mapping,
    providers: &HashMap<String, ProviderSpec>,
) -> Result<ResourceSpec, ConfigError> {
    if mapping.len() != 1 {
        return Err(ConfigError::invalid(format!(
            "{context}: expected exactly one resource entry, got {}",
            mapping.len()
        )));
    }
    let (key, body) = mapping
        .into_iter()
        .next()
        .expect("mapping has exactly one entry");
    let name = key
        .as_str()
        .ok_or_else(|| ConfigError::invalid(format!("{context}: resource name must be a string")))?
        .to_string();
    if name.trim().is_empty() {
        return Err(ConfigError::invalid(format!(
            "{context}: resource name must not be empty"
        )));
    }
    let body: RawResourceBody = serde_yaml::from_value(body)
        .map_err(|e| ConfigError::invalid(format!("{context}: {e}")))?;
    if body.provider.trim().is_empty() {
        return Err(ConfigError::invalid(format!(
            "{context}: provider must not be empty"
        )));
    }
    // Substituted provider ids cannot be checked against the registry
    // until the loader runs; literal ids can.
    if !body.provider.contains('$') && !providers.contains_key(&body.provider) {
        return Err(ConfigError::invalid(format!(
            "{context}: unknown provider {:?}",
            body.provider
        )));
    }
    let config = match body.config {
        serde_yaml::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => yaml_to_json(other)?,
    };
    Ok(ResourceSpec {
        name,
        provider: body.provider,
        config,
    })
}

fn resolve_parser(
    index: usize,
    parser: RawParser,
    providers: &HashMap<String, ProviderSpec>,
) -> Result<ParserRule, ConfigError> {
    let name = parser.name.unwrap_or_else(|| format!("parser-{index}"));
    let context = format!("parser {name}");

    let resource = resolve_resource_spec(&context, parser.resource, providers)?;

    let mut item_params = Vec::with_capacity(parser.item_params.len());
    for (key, value) in parser.item_params {
        let key = key
            .as_str()
            .ok_or_else(|| {
                ConfigError::invalid(format!("{context}: item_params keys must be strings"))
            })?
            .to_string();
        let path = value
            .as_str()
            .ok_or_else(|| {
                ConfigError::invalid(format!("{context}: item_params values must be strings"))
            })?
            .to_string();
        item_params.push((key, path));
    }

    let item = parser
        .item
        .map(|mapping| resolve_resource_spec(&context, mapping, providers))
        .transpose()?;

    if item.is_some() && parser.filter.trim().is_empty() {
        return Err(ConfigError::invalid(format!(
            "{context}: item requires a filter"
        )));
    }

    Ok(ParserRule {
        name,
        resource,
        filter: parser.filter,
        item_params,
        item,
        persist: parser.persist,
    })
}

fn resolve_listener(listener: RawListener) -> Result<ListenerConfig, ConfigError> {
    let addr = listener.listen.parse().map_err(|e| {
        ConfigError::invalid(format!(
            "listener {}: invalid listen address {:?}: {e}",
            listener.name, listener.listen
        ))
    })?;

    let mode = match (listener.tls, listener.redirect) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(format!(
                "listener {}: tls and redirect are mutually exclusive",
                listener.name
            )));
        }
        (Some(tls), None) => {
            if tls.cert_file.trim().is_empty() || tls.key_file.trim().is_empty() {
                return Err(ConfigError::invalid(format!(
                    "listener {}: tls requires cert_file and key_file",
                    listener.name
                )));
            }
            let client_auth = parse_client_auth(&listener.name, tls.client_auth.as_deref())?;
            if client_auth != ClientAuth::None && tls.ca_files.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "listener {}: client_auth requires ca_files",
                    listener.name
                )));
            }
            ListenerMode::Tls(TlsSettings {
                cert_file: tls.cert_file,
                key_file: tls.key_file,
                ca_files: tls.ca_files,
                client_auth,
            })
        }
        (None, Some(redirect)) => ListenerMode::Redirect(RedirectSettings {
            target_port: redirect.target_port,
            header_timeout_s: redirect
                .header_timeout_s
                .unwrap_or(DEFAULT_REDIRECT_HEADER_TIMEOUT_S),
        }),
        (None, None) => ListenerMode::Plain,
    };

    Ok(ListenerConfig {
        name: listener.name,
        addr,
        mode,
    })
}

fn parse_client_auth(listener: &str, value: Option<&str>) -> Result<ClientAuth, ConfigError> {
    match value {
        None | Some("none") => Ok(ClientAuth::None),
        Some("request") => Ok(ClientAuth::Request),
        Some("require") => Ok(ClientAuth::Require),
        Some("verify") => Ok(ClientAuth::Verify),
        Some("require_and_verify") => Ok(ClientAuth::RequireAndVerify),
        Some(other) => Err(ConfigError::invalid(format!(
            "listener {listener}: unknown client_auth {other:?}"
        ))),
    }
}

fn resolve_site(site: RawSite, listener_names: &HashSet<String>) -> Result<SiteConfig, ConfigError> {
    let context = format!("site {}", site.name);

    for listener in &site.listeners {
        if !listener_names.contains(listener) {
            return Err(ConfigError::invalid(format!(
                "{context}: unknown listener {listener:?}"
            )));
        }
    }
    if site.index.trim().is_empty() || site.bundle.trim().is_empty() {
        return Err(ConfigError::invalid(format!(
            "{context}: index and bundle must not be empty"
        )));
    }

    let defaults = SandboxSettings::default();
    let sandbox = SandboxSettings {
        max_vms: site.max_vms.unwrap_or(defaults.max_vms),
        vm_timeout_ms: site.vm_timeout_ms.unwrap_or(defaults.vm_timeout_ms),
        permit_timeout_ms: site.permit_timeout_ms.unwrap_or(defaults.permit_timeout_ms),
        heap_max_bytes: site.heap_max_bytes.unwrap_or(defaults.heap_max_bytes),
        stack_max_bytes: site.stack_max_bytes.unwrap_or(defaults.stack_max_bytes),
    };
    if sandbox.max_vms == 0 {
        return Err(ConfigError::invalid(format!(
            "{context}: max_vms must be greater than zero"
        )));
    }
    if sandbox.vm_timeout_ms == 0 {
        return Err(ConfigError::invalid(format!(
            "{context}: vm_timeout_ms must be greater than zero"
        )));
    }

    let cache_defaults = CacheSettings::default();
    let cache = match site.cache {
        None => cache_defaults,
        Some(raw) => CacheSettings {
            enabled: raw.enabled,
            ttl_s: raw.ttl_s.unwrap_or(cache_defaults.ttl_s),
            max_items: raw.max_items.unwrap_or(cache_defaults.max_items),
        },
    };
    if cache.enabled && cache.max_items == 0 {
        return Err(ConfigError::invalid(format!(
            "{context}: cache.max_items must be greater than zero"
        )));
    }

    let mut rules = Vec::with_capacity(site.rules.len());
    for rule in site.rules {
        let path = Regex::new(&rule.path).map_err(|e| {
            ConfigError::invalid(format!("{context}: invalid rule path {:?}: {e}", rule.path))
        })?;
        let mut state = Vec::with_capacity(rule.state.len());
        for entry in rule.state {
            if entry.key.trim().is_empty() || entry.resource.trim().is_empty() {
                return Err(ConfigError::invalid(format!(
                    "{context}: state entries need key and resource"
                )));
            }
            state.push(StateEntry {
                key: entry.key,
                resource: entry.resource,
                export_to_client: entry.export,
            });
        }
        rules.push(RouteRule {
            path,
            state,
            terminal: rule.terminal,
        });
    }

    let mut headers = Vec::with_capacity(site.headers.len());
    for (name, value) in site.headers {
        let name = name
            .as_str()
            .ok_or_else(|| ConfigError::invalid(format!("{context}: header names must be strings")))?
            .to_string();
        let value = value
            .as_str()
            .ok_or_else(|| {
                ConfigError::invalid(format!("{context}: header values must be strings"))
            })?
            .to_string();
        headers.push((name, value));
    }

    Ok(SiteConfig {
        name: site.name,
        listeners: site.listeners,
        env: site.env.unwrap_or_else(|| "production".to_string()),
        index_file: site.index,
        bundle_file: site.bundle,
        container: site.container.unwrap_or_else(|| "root".to_string()),
        state_id: site.state_id.unwrap_or_else(|| "state".to_string()),
        sandbox,
        cache,
        rules,
        static_dir: site.static_dir,
        headers,
        robots: site.robots,
    })
}

/// Convert a free-form YAML value into a JSON value.
///
/// Mapping keys must be strings; YAML tags are rejected.
fn yaml_to_json(value: serde_yaml::Value) -> Result<serde_json::Value, ConfigError> {
    use serde_json::Value as Json;
    use serde_yaml::Value as Yaml;

    Ok(match value {
        Yaml::Null => Json::Null,
        Yaml::Bool(b) => Json::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Json::from(i)
            } else if let Some(u) = n.as_u64() {
                Json::from(u)
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(Json::Number)
                    .ok_or_else(|| ConfigError::invalid("non-finite number in configuration"))?
            } else {
                return Err(ConfigError::invalid("unrepresentable number in configuration"));
            }
        }
        Yaml::String(s) => Json::String(s),
        Yaml::Sequence(items) => Json::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Yaml::Mapping(mapping) => {
            let mut map = serde_json::Map::with_capacity(mapping.len());
            for (key, value) in mapping {
                let key = key
                    .as_str()
                    .ok_or_else(|| {
                        ConfigError::invalid("mapping keys must be strings in free-form options")
                    })?
                    .to_string();
                map.insert(key, yaml_to_json(value)?);
            }
            Json::Object(map)
        }
        Yaml::Tagged(_) => {
            return Err(ConfigError::invalid("YAML tags are not supported"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_to_json_converts_scalars_and_nests() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r"
url: https://example.com
retry: 3
nested:
  flag: true
list: [1, 2]
",
        )
        .unwrap();
        let json = yaml_to_json(yaml).unwrap();
        assert_eq!(json["url"], "https://example.com");
        assert_eq!(json["retry"], 3);
        assert_eq!(json["nested"]["flag"], true);
        assert_eq!(json["list"][1], 2);
    }

    #[test]
    fn yaml_to_json_rejects_non_string_keys() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("1: a").unwrap();
        assert!(yaml_to_json(yaml).is_err());
    }
}
