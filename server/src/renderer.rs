//! The request renderer.
//!
//! Per-request orchestration: method gate, response-cache replay, asset
//! refresh, rule matching and state assembly, sandbox execution, HTML
//! splicing, cache insertion. Per-state-entry failures degrade the
//! response (missing resources become error entries and force a 503
//! status); per-request failures collapse to a minimal 503 with the
//! detail in the logs, never in the client body.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use kiln_config::{RouteRule, SiteConfig};
use kiln_sandbox::{Invocation, Sandbox, SandboxError, SandboxLimits, SandboxPool};
use kiln_store::Store;
use kiln_types::{RequestView, substitute};

use crate::assets::{AssetCache, AssetError};
use crate::response_cache::ResponseCache;
use crate::splice::{SpliceError, splice};

const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";

/// A fully rendered response, ready to replay.
#[derive(Debug)]
pub enum Rendered {
    Page {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    Redirect {
        url: String,
        status: u16,
        headers: Vec<(String, String)>,
    },
}

impl Rendered {
    #[must_use]
    pub fn page(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self::Page {
            status,
            headers,
            body,
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Page { status, .. } | Self::Redirect { status, .. } => *status,
        }
    }
}

#[derive(Debug, Error)]
enum RenderFailure {
    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Splice(#[from] SpliceError),
}

struct CacheState {
    cache: ResponseCache,
    ttl: Duration,
}

struct BuildOutcome {
    response: Rendered,
    cacheable: bool,
}

/// Renders requests for one site.
pub struct Renderer {
    env: String,
    container: String,
    state_id: String,
    rules: Vec<RouteRule>,
    store: Arc<dyn Store>,
    assets: AssetCache,
    sandbox: Sandbox,
    pool: SandboxPool,
    cache: Option<CacheState>,
}

impl Renderer {
    #[must_use]
    pub fn from_config(config: &SiteConfig, store: Arc<dyn Store>) -> Self {
        let sandbox = Sandbox::new(
            SandboxLimits {
                heap_max_bytes: config.sandbox.heap_max_bytes,
                stack_max_bytes: config.sandbox.stack_max_bytes,
            },
            Duration::from_millis(config.sandbox.vm_timeout_ms),
            config.bundle_file.clone(),
        );
        let pool = SandboxPool::new(
            config.sandbox.max_vms,
            Duration::from_millis(config.sandbox.permit_timeout_ms),
        );
        let cache = config.cache.enabled.then(|| CacheState {
            cache: ResponseCache::new(config.cache.max_items),
            ttl: Duration::from_secs(config.cache.ttl_s),
        });

        Self {
            env: config.env.clone(),
            container: config.container.clone(),
            state_id: config.state_id.clone(),
            rules: config.rules.clone(),
            store,
            assets: AssetCache::new(&config.index_file, &config.bundle_file),
            sandbox,
            pool,
            cache,
        }
    }

    /// Render one request. Never fails: failures become minimal status
    /// responses.
    pub async fn render(&self, view: &RequestView) -> Arc<Rendered> {
        if view.method != "GET" && view.method != "HEAD" {
            return Arc::new(Rendered::Page {
                status: 405,
                headers: vec![("allow".to_string(), "GET, HEAD".to_string())],
                body: Bytes::new(),
            });
        }

        if let Some(cache) = &self.cache
            && let Some(hit) = cache.cache.get_fresh(&view.path, Instant::now())
        {
            tracing::debug!(path = %view.path, "response cache hit");
            return hit;
        }

        match self.build(view).await {
            Ok(outcome) => {
                let response = Arc::new(outcome.response);
                if outcome.cacheable
                    && let Some(cache) = &self.cache
                {
                    cache.cache.set(
                        view.path.clone(),
                        Arc::clone(&response),
                        Instant::now() + cache.ttl,
                    );
                }
                response
            }
            Err(failure) => {
                tracing::error!(path = %view.path, error = %failure, "render failed");
                Arc::new(Rendered::Page {
                    status: 503,
                    headers: Vec::new(),
                    body: Bytes::new(),
                })
            }
        }
    }

    async fn build(&self, view: &RequestView) -> Result<BuildOutcome, RenderFailure> {
        let index = self.assets.index()?;
        let bundle = self.assets.bundle()?;

        let (server_state, client_state, degraded) = self.build_state(view);
        let server_state_json =
            (!server_state.is_empty()).then(|| serde_json::Value::Object(server_state).to_string());
        let client_state_json =
            (!client_state.is_empty()).then(|| serde_json::Value::Object(client_state).to_string());

        let result = {
            let _permit = self.pool.acquire().await?;
            self.sandbox
                .execute(
                    Invocation {
                        env: self.env.clone(),
                        request: view.clone(),
                        server_state: server_state_json,
                    },
                    bundle,
                )
                .await?
        };

        let mut headers = flatten_headers(&result.headers);

        if let Some(redirect) = &result.redirect {
            return Ok(BuildOutcome {
                response: Rendered::Redirect {
                    url: redirect.url.clone(),
                    status: redirect.status,
                    headers,
                },
                cacheable: true,
            });
        }

        let body = splice(
            &index,
            &result,
            client_state_json.as_deref(),
            &self.container,
            &self.state_id,
        )?;

        headers.insert(
            0,
            ("content-type".to_string(), CONTENT_TYPE_HTML.to_string()),
        );
        let status = if degraded {
            503
        } else {
            result.status.unwrap_or(kiln_types::DEFAULT_RENDER_STATUS)
        };

        Ok(BuildOutcome {
            response: Rendered::Page {
                status,
                headers,
                body: Bytes::from(body),
            },
            // Replaying a degraded snapshot would pin the outage for a
            // full TTL.
            cacheable: !degraded,
        })
    }

    /// Walk the rules in declared order and assemble server and client
    /// state. The first rule to produce a key wins; `terminal` stops the
    /// walk after its rule.
    fn build_state(
        &self,
        view: &RequestView,
    ) -> (
        serde_json::Map<String, serde_json::Value>,
        serde_json::Map<String, serde_json::Value>,
        bool,
    ) {
        let mut server_state = serde_json::Map::new();
        let mut client_state = serde_json::Map::new();
        let mut degraded = false;

        for rule in &self.rules {
            let Some(captures) = rule.path.captures(&view.path) else {
                continue;
            };
            let params = rule_params(&rule.path, &captures, &view.path);

            for entry in &rule.state {
                let key = substitute(&entry.key, &params);
                let resource = substitute(&entry.resource, &params);

                let value = match self.store.load(&resource) {
                    Ok(resource) => serde_json::json!({
                        "data": resource.segments_lossy(),
                        "error": "",
                    }),
                    Err(error) => {
                        tracing::warn!(path = %view.path, resource = %resource, %error, "state entry degraded");
                        degraded = true;
                        serde_json::json!({
                            "data": null,
                            "error": "unknown resource",
                        })
                    }
                };

                if entry.export_to_client {
                    client_state.entry(key.clone()).or_insert(value.clone());
                }
                server_state.entry(key).or_insert(value);
            }

            if rule.terminal {
                break;
            }
        }

        (server_state, client_state, degraded)
    }
}

/// Parameters for one matched rule: `$1..$N`, named groups, and `$url`.
fn rule_params(
    pattern: &regex::Regex,
    captures: &regex::Captures<'_>,
    path: &str,
) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (index, group) in captures.iter().enumerate().skip(1) {
        if let Some(group) = group {
            params.insert(index.to_string(), group.as_str().to_string());
        }
    }
    for name in pattern.capture_names().flatten() {
        if let Some(group) = captures.name(name) {
            params.insert(name.to_string(), group.as_str().to_string());
        }
    }
    params.insert("url".to_string(), path.to_string());
    params
}

/// Multi-valued headers flattened to pairs, sorted by name so replayed
/// responses are byte-stable.
fn flatten_headers(headers: &HashMap<String, Vec<String>>) -> Vec<(String, String)> {
    let mut flat: Vec<(String, String)> = headers
        .iter()
        .flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.clone(), value.clone()))
        })
        .collect();
    flat.sort();
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::time::SystemTime;

    use kiln_config::{CacheSettings, SandboxSettings, StateEntry};
    use kiln_store::MemoryStore;
    use kiln_types::Resource;
    use tempfile::TempDir;

    const INDEX: &str = "<html><head></head><body><div id=\"root\"></div></body></html>";

    fn write_file(path: &Path, contents: &str) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn rule(path: &str, key: &str, resource: &str, export: bool, terminal: bool) -> RouteRule {
        RouteRule {
            path: regex::Regex::new(path).unwrap(),
            state: vec![StateEntry {
                key: key.to_string(),
                resource: resource.to_string(),
                export_to_client: export,
            }],
            terminal,
        }
    }

    struct Fixture {
        _dir: TempDir,
        bundle_path: std::path::PathBuf,
        config: SiteConfig,
        store: Arc<MemoryStore>,
    }

    fn fixture(bundle: &str, rules: Vec<RouteRule>, cache: CacheSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index.html");
        let bundle_path = dir.path().join("bundle.js");
        write_file(&index_path, INDEX);
        write_file(&bundle_path, bundle);

        let config = SiteConfig {
            name: "test".to_string(),
            listeners: Vec::new(),
            env: "test".to_string(),
            index_file: index_path.display().to_string(),
            bundle_file: bundle_path.display().to_string(),
            container: "root".to_string(),
            state_id: "state".to_string(),
            sandbox: SandboxSettings {
                vm_timeout_ms: 5000,
                ..SandboxSettings::default()
            },
            cache,
            rules,
            static_dir: None,
            headers: Vec::new(),
            robots: None,
        };

        Fixture {
            _dir: dir,
            bundle_path,
            config,
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn page(rendered: &Rendered) -> (u16, String) {
        match rendered {
            Rendered::Page { status, body, .. } => {
                (*status, String::from_utf8_lossy(body).into_owned())
            }
            Rendered::Redirect { .. } => panic!("expected a page"),
        }
    }

    #[tokio::test]
    async fn renders_with_state_from_matched_rule() {
        let fixture = fixture(
            r#"
            const state = server.handler.state();
            server.response.render(JSON.stringify(state.k));
            "#,
            vec![rule("/t", "k", "r", false, false)],
            CacheSettings::default(),
        );
        fixture
            .store
            .put("r", Resource::single(b"{}".to_vec(), Duration::ZERO));
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let rendered = renderer.render(&RequestView::get("/t")).await;
        let (status, body) = page(&rendered);
        assert_eq!(status, 200);
        assert!(body.contains(r#"{"data":["{}"],"error":""}"#), "{body}");
    }

    #[tokio::test]
    async fn missing_resource_degrades_to_503_with_body() {
        let fixture = fixture(
            r#"
            const state = server.handler.state();
            server.response.render(state.k.error);
            "#,
            vec![rule("/t", "k", "missing", false, false)],
            CacheSettings::default(),
        );
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let rendered = renderer.render(&RequestView::get("/t")).await;
        let (status, body) = page(&rendered);
        assert_eq!(status, 503);
        assert!(body.contains("unknown resource"), "{body}");
    }

    #[tokio::test]
    async fn capture_groups_substitute_into_state_entries() {
        let fixture = fixture(
            r#"
            const state = server.handler.state();
            server.response.render(Object.keys(state).join(","));
            "#,
            vec![rule(
                "^/posts/(?P<id>[0-9]+)$",
                "post-$id",
                "post-$id",
                false,
                true,
            )],
            CacheSettings::default(),
        );
        fixture
            .store
            .put("post-7", Resource::single(b"{}".to_vec(), Duration::ZERO));
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let rendered = renderer.render(&RequestView::get("/posts/7")).await;
        let (status, body) = page(&rendered);
        assert_eq!(status, 200);
        assert!(body.contains("post-7"), "{body}");
    }

    #[tokio::test]
    async fn exported_state_is_spliced_for_the_client() {
        let fixture = fixture(
            r#"server.response.render("ok");"#,
            vec![rule("/t", "k", "r", true, false)],
            CacheSettings::default(),
        );
        fixture
            .store
            .put("r", Resource::single(b"{}".to_vec(), Duration::ZERO));
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let rendered = renderer.render(&RequestView::get("/t")).await;
        let (_, body) = page(&rendered);
        assert!(
            body.contains("<script type=\"application/json\" id=\"state\">"),
            "{body}"
        );
    }

    #[tokio::test]
    async fn other_methods_get_405_with_allow() {
        let fixture = fixture(
            r#"server.response.render("ok");"#,
            Vec::new(),
            CacheSettings::default(),
        );
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let mut view = RequestView::get("/t");
        view.method = "POST".to_string();
        let rendered = renderer.render(&view).await;
        match &*rendered {
            Rendered::Page {
                status, headers, ..
            } => {
                assert_eq!(*status, 405);
                assert!(
                    headers
                        .iter()
                        .any(|(n, v)| n == "allow" && v == "GET, HEAD")
                );
            }
            Rendered::Redirect { .. } => panic!("expected a page"),
        }
    }

    #[tokio::test]
    async fn script_redirect_becomes_a_redirect_response() {
        let fixture = fixture(
            r#"server.response.redirect("/next", 301);"#,
            Vec::new(),
            CacheSettings::default(),
        );
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let rendered = renderer.render(&RequestView::get("/t")).await;
        match &*rendered {
            Rendered::Redirect { url, status, .. } => {
                assert_eq!(url, "/next");
                assert_eq!(*status, 301);
            }
            Rendered::Page { .. } => panic!("expected a redirect"),
        }
    }

    #[tokio::test]
    async fn script_error_collapses_to_minimal_503() {
        let fixture = fixture(
            r#"throw new Error("boom");"#,
            Vec::new(),
            CacheSettings::default(),
        );
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let rendered = renderer.render(&RequestView::get("/t")).await;
        let (status, body) = page(&rendered);
        assert_eq!(status, 503);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn enabled_cache_replays_the_first_render() {
        let fixture = fixture(
            r#"server.response.render("first");"#,
            Vec::new(),
            CacheSettings {
                enabled: true,
                ttl_s: 60,
                max_items: 8,
            },
        );
        let renderer = Renderer::from_config(&fixture.config, fixture.store.clone());

        let first = renderer.render(&RequestView::get("/t")).await;
        let (_, first_body) = page(&first);
        assert!(first_body.contains("first"));

        // Swap the bundle on disk; a cache hit must not re-render.
        write_file(
            &fixture.bundle_path,
            r#"server.response.render("second");"#,
        );
        let file = File::options()
            .write(true)
            .open(&fixture.bundle_path)
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        let second = renderer.render(&RequestView::get("/t")).await;
        let (_, second_body) = page(&second);
        assert!(second_body.contains("first"), "{second_body}");
    }

    #[tokio::test]
    async fn missing_assets_fail_with_503() {
        let fixture = fixture(
            r#"server.response.render("ok");"#,
            Vec::new(),
            CacheSettings::default(),
        );
        let mut config = fixture.config.clone();
        config.index_file = "/nonexistent/index.html".to_string();
        let renderer = Renderer::from_config(&config, fixture.store.clone());

        let rendered = renderer.render(&RequestView::get("/t")).await;
        assert_eq!(rendered.status(), 503);
    }
}
