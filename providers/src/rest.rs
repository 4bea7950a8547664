//! REST provider: retrying, paginating HTTP fetches.
//!
//! One fetch issues one or more HTTP requests. The loop has four states:
//! issue the request, retry a retryable status (delegated to
//! [`crate::retry`]), follow a next link, done. Pagination appends one
//! byte segment per page; the follow-on URL comes from `Link:` headers
//! or from a JSONPath over the decoded body.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{HeaderMap, LINK};
use serde::Deserialize;
use url::Url;

use kiln_types::Resource;

use crate::retry::{RetryPolicy, send_with_retry};
use crate::{Provider, ProviderError, ResourceConfig};

const DEFAULT_CONNECT_TIMEOUT_S: u64 = 5;
const DEFAULT_TIMEOUT_S: u64 = 30;
const DEFAULT_MAX_IDLE_CONNS: usize = 16;
const DEFAULT_IDLE_CONN_TIMEOUT_S: u64 = 90;

/// Init-time options for a REST provider instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestOptions {
    /// PEM files appended to the trust roots.
    pub tls_ca_files: Vec<String>,
    /// Client certificate PEM files; paired index-wise with
    /// `tls_key_files`. The client carries one identity, so at most one
    /// pair is accepted; configure one provider instance per identity.
    pub tls_cert_files: Vec<String>,
    /// Client key PEM files; paired index-wise with `tls_cert_files`.
    pub tls_key_files: Vec<String>,
    pub connect_timeout_s: u64,
    pub timeout_s: u64,
    pub max_idle_conns: usize,
    pub idle_conn_timeout_s: u64,
    /// Retries after the initial attempt.
    pub retry: u32,
    pub retry_delay_s: u64,
    /// Headers applied to every request, before per-resource headers.
    pub headers: HashMap<String, String>,
    /// Query params applied to every request, before per-resource params.
    pub params: HashMap<String, String>,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            tls_ca_files: Vec::new(),
            tls_cert_files: Vec::new(),
            tls_key_files: Vec::new(),
            connect_timeout_s: DEFAULT_CONNECT_TIMEOUT_S,
            timeout_s: DEFAULT_TIMEOUT_S,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            idle_conn_timeout_s: DEFAULT_IDLE_CONN_TIMEOUT_S,
            retry: 3,
            retry_delay_s: 1,
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NextParser {
    Header,
    Body,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Per-resource request options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RestResourceConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
    next: bool,
    next_parser: Option<NextParser>,
    next_filter: String,
    ttl_s: u64,
}

impl Default for RestResourceConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            url: String::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
            next: false,
            next_parser: None,
            next_filter: String::new(),
            ttl_s: 0,
        }
    }
}

/// Fetches resources over HTTP(S).
///
/// The underlying client is shared by every fetch through this instance;
/// fetches are not serialized.
#[derive(Debug)]
pub struct RestProvider {
    client: reqwest::Client,
    policy: RetryPolicy,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl RestProvider {
    /// Build a provider instance from its init-time options.
    pub fn new(options: &serde_json::Value) -> Result<Self, ProviderError> {
        let options: RestOptions = serde_json::from_value(options.clone())
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        Self::from_options(options)
    }

    pub fn from_options(options: RestOptions) -> Result<Self, ProviderError> {
        if options.tls_cert_files.len() != options.tls_key_files.len() {
            return Err(ProviderError::Config(format!(
                "tls_cert_files and tls_key_files must pair up ({} vs {})",
                options.tls_cert_files.len(),
                options.tls_key_files.len()
            )));
        }
        if options.tls_cert_files.len() > 1 {
            return Err(ProviderError::Config(
                "at most one client certificate pair is supported".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .connect_timeout(Duration::from_secs(options.connect_timeout_s))
            .timeout(Duration::from_secs(options.timeout_s))
            .pool_max_idle_per_host(options.max_idle_conns)
            .pool_idle_timeout(Duration::from_secs(options.idle_conn_timeout_s));

        for path in &options.tls_ca_files {
            let pem = std::fs::read(path).map_err(|e| {
                ProviderError::Config(format!("failed to read CA file {path}: {e}"))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ProviderError::Config(format!("invalid CA certificate {path}: {e}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        if let (Some(cert_path), Some(key_path)) = (
            options.tls_cert_files.first(),
            options.tls_key_files.first(),
        ) {
            let mut pem = std::fs::read(cert_path).map_err(|e| {
                ProviderError::Config(format!("failed to read certificate {cert_path}: {e}"))
            })?;
            let key = std::fs::read(key_path).map_err(|e| {
                ProviderError::Config(format!("failed to read key {key_path}: {e}"))
            })?;
            pem.extend_from_slice(b"\n");
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                ProviderError::Config(format!("invalid client identity {cert_path}: {e}"))
            })?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            policy: RetryPolicy {
                retries: options.retry,
                delay: Duration::from_secs(options.retry_delay_s),
            },
            headers: options.headers,
            params: options.params,
        })
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait::async_trait]
impl Provider for RestProvider {
    async fn fetch(&self, name: &str, config: &ResourceConfig) -> Result<Resource, ProviderError> {
        let config: RestResourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        if config.url.trim().is_empty() {
            return Err(ProviderError::Config(format!(
                "resource {name}: url must not be empty"
            )));
        }
        let method = Method::from_bytes(config.method.as_bytes())
            .map_err(|_| ProviderError::Config(format!("invalid method {}", config.method)))?;
        let parser = match (config.next, config.next_parser) {
            (false, _) => None,
            (true, Some(parser)) => {
                if parser == NextParser::Body && config.next_filter.trim().is_empty() {
                    return Err(ProviderError::Config(format!(
                        "resource {name}: next_parser body requires next_filter"
                    )));
                }
                Some(parser)
            }
            (true, None) => {
                return Err(ProviderError::Config(format!(
                    "resource {name}: next requires next_parser"
                )));
            }
        };

        let mut url = Url::parse(&config.url)
            .map_err(|e| ProviderError::Config(format!("invalid url {}: {e}", config.url)))?;
        let mut first_page = true;
        let mut segments: Vec<Vec<u8>> = Vec::new();

        loop {
            let mut query: Vec<(&str, &str)> = self
                .params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            if first_page {
                query.extend(config.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }

            let response = send_with_retry(
                || {
                    let mut builder = self.client.request(method.clone(), url.clone());
                    for (k, v) in &self.headers {
                        builder = builder.header(k.as_str(), v.as_str());
                    }
                    for (k, v) in &config.headers {
                        builder = builder.header(k.as_str(), v.as_str());
                    }
                    if query.is_empty() {
                        builder
                    } else {
                        builder.query(&query)
                    }
                },
                self.policy,
            )
            .await?;

            let headers = response.headers().clone();
            let body = response.bytes().await?;
            segments.push(body.to_vec());

            let Some(parser) = parser else { break };
            let next = match parser {
                NextParser::Header => next_from_link(&headers),
                NextParser::Body => next_from_body(&body, &config.next_filter)?,
            };
            let Some(next) = next else { break };

            // Relative next links resolve against the page that sent them.
            url = url
                .join(&next)
                .map_err(|e| ProviderError::Payload(format!("invalid next url {next}: {e}")))?;
            first_page = false;
            tracing::debug!(name, page = segments.len() + 1, url = %url, "following next link");
        }

        tracing::debug!(name, segments = segments.len(), "rest resource fetched");
        Ok(Resource::new(segments, Duration::from_secs(config.ttl_s)))
    }
}

/// Select the `rel="next"` target from `Link:` headers, stripped of `<>`.
fn next_from_link(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(LINK) {
        let Ok(value) = value.to_str() else { continue };
        for segment in value.split(',') {
            let mut parts = segment.split(';');
            let target = parts.next()?.trim();
            if !(target.starts_with('<') && target.ends_with('>')) {
                continue;
            }
            let is_next = parts.any(|param| {
                let param = param.trim();
                param == "rel=\"next\"" || param == "rel=next"
            });
            if is_next {
                return Some(target[1..target.len() - 1].to_string());
            }
        }
    }
    None
}

/// Apply the JSONPath filter to the decoded body and coerce to a string.
fn next_from_body(body: &[u8], filter: &str) -> Result<Option<String>, ProviderError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ProviderError::Payload(format!("body is not JSON: {e}")))?;
    let selected = jsonpath_lib::select(&value, filter)
        .map_err(|e| ProviderError::Payload(format!("next_filter failed: {e}")))?;

    Ok(selected.first().and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }))
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider() -> RestProvider {
        RestProvider::from_options(RestOptions {
            retry: 0,
            retry_delay_s: 0,
            ..RestOptions::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn paginates_via_link_header() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/r"))
            .and(query_param("p", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("B"))
            .expect(1)
            .mount(&server)
            .await;

        let link = format!("<{}/r?p=2>; rel=\"next\"", server.uri());
        Mock::given(method("GET"))
            .and(path("/r"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("A")
                    .insert_header("Link", link.as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = json!({
            "url": format!("{}/r", server.uri()),
            "next": true,
            "next_parser": "header",
        });
        let resource = provider().fetch("r", &config).await.unwrap();
        assert_eq!(resource.data(), [b"A".to_vec(), b"B".to_vec()]);
    }

    #[tokio::test]
    async fn paginates_via_body_filter() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/r"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"items":[2]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let first = format!(r#"{{"items":[1],"next":"{}/r?page=2"}}"#, server.uri());
        Mock::given(method("GET"))
            .and(path("/r"))
            .respond_with(ResponseTemplate::new(200).set_body_string(first.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let config = json!({
            "url": format!("{}/r", server.uri()),
            "next": true,
            "next_parser": "body",
            "next_filter": "$.next",
        });
        let resource = provider().fetch("r", &config).await.unwrap();
        assert_eq!(resource.data()[0], first.as_bytes());
        assert_eq!(resource.data()[1], br#"{"items":[2]}"#);
    }

    #[tokio::test]
    async fn per_resource_params_cleared_after_first_page() {
        let server = MockServer::start().await;

        // Second page: the next link carries the cursor; the per-resource
        // param must not reappear.
        Mock::given(method("GET"))
            .and(path("/r"))
            .and(query_param("cursor", "c2"))
            .respond_with(move |request: &wiremock::Request| {
                assert!(
                    !request.url.query_pairs().any(|(k, _)| k == "limit"),
                    "per-resource params must be cleared on pagination"
                );
                ResponseTemplate::new(200).set_body_string("B")
            })
            .expect(1)
            .mount(&server)
            .await;

        let link = format!("<{}/r?cursor=c2>; rel=\"next\"", server.uri());
        Mock::given(method("GET"))
            .and(path("/r"))
            .and(query_param("limit", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("A")
                    .insert_header("Link", link.as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = json!({
            "url": format!("{}/r", server.uri()),
            "params": { "limit": "1" },
            "next": true,
            "next_parser": "header",
        });
        let resource = provider().fetch("r", &config).await.unwrap();
        assert_eq!(resource.data(), [b"A".to_vec(), b"B".to_vec()]);
    }

    #[tokio::test]
    async fn applies_global_then_resource_headers() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/r"))
            .and(header("x-global", "g"))
            .and(header("x-resource", "r"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let rest = RestProvider::from_options(RestOptions {
            headers: HashMap::from([("x-global".to_string(), "g".to_string())]),
            ..RestOptions::default()
        })
        .unwrap();

        let config = json!({
            "url": format!("{}/r", server.uri()),
            "headers": { "x-resource": "r" },
        });
        let resource = rest.fetch("r", &config).await.unwrap();
        assert_eq!(resource.data()[0], b"ok");
    }

    #[tokio::test]
    async fn retryable_status_is_retried_then_fails() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/r"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2) // initial + 1 retry
            .mount(&server)
            .await;

        let rest = RestProvider::from_options(RestOptions {
            retry: 1,
            retry_delay_s: 0,
            ..RestOptions::default()
        })
        .unwrap();

        let config = json!({ "url": format!("{}/r", server.uri()) });
        let err = rest.fetch("r", &config).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Status {
                status: 502,
                attempts: 2
            }
        ));
    }

    #[tokio::test]
    async fn missing_next_parser_is_a_config_error() {
        let config = json!({ "url": "https://example.invalid/r", "next": true });
        let err = provider().fetch("r", &config).await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
