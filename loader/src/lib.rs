//! The resource loader.
//!
//! Runs once before serving. Each parser rule fetches one index
//! resource, projects every segment through a JSONPath page filter, and
//! for each projected item derives a sub-resource by `$key` substitution
//! and fetches it into the store. Rules run sequentially, and so do the
//! sub-fetches within a rule; the first failure aborts the parser.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use kiln_config::ParserRule;
use kiln_providers::{FetchError, Fetcher};
use kiln_store::Store;
use kiln_types::{substitute, substitute_value};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("parser {parser}: fetching {resource} failed: {source}")]
    Fetch {
        parser: String,
        resource: String,
        #[source]
        source: FetchError,
    },

    #[error("parser {parser}: segment {segment} of {resource} is not JSON: {source}")]
    Decode {
        parser: String,
        resource: String,
        segment: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("parser {parser}: filter {filter:?} failed: {message}")]
    Filter {
        parser: String,
        filter: String,
        message: String,
    },
}

/// Pulls resources into the store by executing parser rules.
pub struct Loader {
    fetcher: Arc<Fetcher>,
    store: Arc<dyn Store>,
}

impl Loader {
    #[must_use]
    pub fn new(fetcher: Arc<Fetcher>, store: Arc<dyn Store>) -> Self {
        Self { fetcher, store }
    }

    /// Execute every rule in order, stopping at the first failure.
    pub async fn run(&self, parsers: &[ParserRule]) -> Result<(), LoaderError> {
        for rule in parsers {
            self.run_parser(rule).await?;
        }
        Ok(())
    }

    async fn run_parser(&self, rule: &ParserRule) -> Result<(), LoaderError> {
        tracing::info!(parser = %rule.name, resource = %rule.resource.name, "running parser");

        let index = self
            .fetcher
            .fetch(
                &rule.resource.name,
                &rule.resource.provider,
                &rule.resource.config,
            )
            .await
            .map_err(|source| LoaderError::Fetch {
                parser: rule.name.clone(),
                resource: rule.resource.name.clone(),
                source,
            })?;

        if let Some(item_spec) = &rule.item {
            for (segment_index, segment) in index.data().iter().enumerate() {
                let decoded: serde_json::Value =
                    serde_json::from_slice(segment).map_err(|source| LoaderError::Decode {
                        parser: rule.name.clone(),
                        resource: rule.resource.name.clone(),
                        segment: segment_index,
                        source,
                    })?;

                for item in project_items(&rule.name, &decoded, &rule.filter)? {
                    let params = item_params(&rule.name, item, &rule.item_params);

                    let name = substitute(&item_spec.name, &params);
                    let provider = substitute(&item_spec.provider, &params);
                    let mut config = item_spec.config.clone();
                    substitute_value(&mut config, &params);

                    let resource = self
                        .fetcher
                        .fetch(&name, &provider, &config)
                        .await
                        .map_err(|source| LoaderError::Fetch {
                            parser: rule.name.clone(),
                            resource: name.clone(),
                            source,
                        })?;
                    self.store.put(&name, resource);
                    tracing::debug!(parser = %rule.name, resource = %name, "stored sub-resource");
                }
            }
        }

        if rule.persist {
            self.store.put(&rule.resource.name, index);
            tracing::debug!(parser = %rule.name, resource = %rule.resource.name, "persisted index resource");
        }

        Ok(())
    }
}

/// Apply the page filter to one decoded segment.
///
/// A filter selecting one array yields that array's elements; a filter
/// selecting several nodes yields the nodes themselves. Anything else
/// yields no items.
fn project_items<'a>(
    parser: &str,
    decoded: &'a serde_json::Value,
    filter: &str,
) -> Result<Vec<&'a serde_json::Value>, LoaderError> {
    let selected = jsonpath_lib::select(decoded, filter).map_err(|e| LoaderError::Filter {
        parser: parser.to_string(),
        filter: filter.to_string(),
        message: e.to_string(),
    })?;

    Ok(match selected.as_slice() {
        [serde_json::Value::Array(items)] => items.iter().collect(),
        [_single_non_array] => Vec::new(),
        _ => selected,
    })
}

/// Evaluate the declared item params against one item.
///
/// Strings, numbers and booleans are stringified; missing or
/// non-scalar values are skipped with a warning.
fn item_params(
    parser: &str,
    item: &serde_json::Value,
    declared: &[(String, String)],
) -> HashMap<String, String> {
    let mut params = HashMap::with_capacity(declared.len());
    for (key, path) in declared {
        let selected = match jsonpath_lib::select(item, path) {
            Ok(selected) => selected,
            Err(e) => {
                tracing::warn!(parser, key, path, error = %e, "item param path failed; skipping");
                continue;
            }
        };
        let value = match selected.first() {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::Bool(b)) => b.to_string(),
            Some(_) | None => {
                tracing::warn!(parser, key, path, "item param missing or not scalar; skipping");
                continue;
            }
        };
        params.insert(key.clone(), value);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use kiln_config::ResourceSpec;
    use kiln_providers::{Provider, ProviderError, ResourceConfig};
    use kiln_store::MemoryStore;
    use kiln_types::Resource;
    use serde_json::json;

    /// Serves canned bodies by resource name and records each call.
    #[derive(Default)]
    struct RecordingProvider {
        bodies: HashMap<String, Vec<Vec<u8>>>,
        calls: Mutex<Vec<(String, ResourceConfig)>>,
    }

    #[async_trait::async_trait]
    impl Provider for RecordingProvider {
        async fn fetch(
            &self,
            name: &str,
            config: &ResourceConfig,
        ) -> Result<Resource, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), config.clone()));
            let segments = self
                .bodies
                .get(name)
                .cloned()
                .ok_or_else(|| ProviderError::Config(format!("no canned body for {name}")))?;
            Ok(Resource::new(segments, Duration::ZERO))
        }
    }

    fn rule(item: Option<ResourceSpec>, persist: bool) -> ParserRule {
        ParserRule {
            name: "posts".to_string(),
            resource: ResourceSpec {
                name: "posts".to_string(),
                provider: "api".to_string(),
                config: json!({}),
            },
            filter: "$.data".to_string(),
            item_params: vec![("id".to_string(), "$.id".to_string())],
            item,
            persist,
        }
    }

    fn item_spec() -> ResourceSpec {
        ResourceSpec {
            name: "post-$id".to_string(),
            provider: "api".to_string(),
            config: json!({ "url": "https://api/posts/$id" }),
        }
    }

    #[tokio::test]
    async fn fetches_items_with_substituted_specs() {
        let provider = Arc::new(RecordingProvider {
            bodies: HashMap::from([
                (
                    "posts".to_string(),
                    vec![
                        br#"{"data":[{"id":1},{"id":2}]}"#.to_vec(),
                        br#"{"data":[{"id":3}]}"#.to_vec(),
                    ],
                ),
                ("post-1".to_string(), vec![b"p1".to_vec()]),
                ("post-2".to_string(), vec![b"p2".to_vec()]),
                ("post-3".to_string(), vec![b"p3".to_vec()]),
            ]),
            ..RecordingProvider::default()
        });
        let fetcher = Arc::new(
            Fetcher::builder()
                .register("api", provider.clone() as Arc<dyn Provider>)
                .build(),
        );
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(fetcher, store.clone());

        loader
            .run(&[rule(Some(item_spec()), false)])
            .await
            .unwrap();

        assert_eq!(store.load("post-1").unwrap().data()[0], b"p1");
        assert_eq!(store.load("post-3").unwrap().data()[0], b"p3");
        // The index itself was not persisted.
        assert!(store.load("posts").is_err());

        let calls = provider.calls.lock().unwrap();
        let (_, config) = calls.iter().find(|(n, _)| n == "post-2").unwrap();
        assert_eq!(config["url"], "https://api/posts/2");
    }

    #[tokio::test]
    async fn persist_stores_the_index() {
        let provider = Arc::new(RecordingProvider {
            bodies: HashMap::from([(
                "posts".to_string(),
                vec![br#"{"data":[]}"#.to_vec()],
            )]),
            ..RecordingProvider::default()
        });
        let fetcher = Arc::new(
            Fetcher::builder()
                .register("api", provider as Arc<dyn Provider>)
                .build(),
        );
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(fetcher, store.clone());

        loader.run(&[rule(Some(item_spec()), true)]).await.unwrap();

        let index = store.load("posts").unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn sub_fetch_failure_aborts_the_parser() {
        // post-2 has no canned body, so its fetch fails after post-1
        // succeeded.
        let provider = Arc::new(RecordingProvider {
            bodies: HashMap::from([
                (
                    "posts".to_string(),
                    vec![br#"{"data":[{"id":1},{"id":2}]}"#.to_vec()],
                ),
                ("post-1".to_string(), vec![b"p1".to_vec()]),
            ]),
            ..RecordingProvider::default()
        });
        let fetcher = Arc::new(
            Fetcher::builder()
                .register("api", provider as Arc<dyn Provider>)
                .build(),
        );
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(fetcher, store.clone());

        let err = loader
            .run(&[rule(Some(item_spec()), true)])
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Fetch { .. }));
        // The first sub-resource made it in; the index did not.
        assert!(store.load("post-1").is_ok());
        assert!(store.load("posts").is_err());
    }

    #[tokio::test]
    async fn non_json_segment_is_a_decode_error() {
        let provider = Arc::new(RecordingProvider {
            bodies: HashMap::from([("posts".to_string(), vec![b"not json".to_vec()])]),
            ..RecordingProvider::default()
        });
        let fetcher = Arc::new(
            Fetcher::builder()
                .register("api", provider as Arc<dyn Provider>)
                .build(),
        );
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(fetcher, store);

        let err = loader
            .run(&[rule(Some(item_spec()), false)])
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Decode { .. }));
    }

    #[test]
    fn project_items_handles_selected_array_and_nodes() {
        let decoded = json!({ "data": [ {"id": 1}, {"id": 2} ] });
        let items = project_items("p", &decoded, "$.data").unwrap();
        assert_eq!(items.len(), 2);

        let items = project_items("p", &decoded, "$.data[*]").unwrap();
        assert_eq!(items.len(), 2);

        let scalar = json!({ "data": 42 });
        let items = project_items("p", &scalar, "$.data").unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn item_params_stringifies_scalars_and_skips_missing() {
        let item = json!({ "id": 7, "slug": "intro", "flag": true, "nested": {} });
        let declared = vec![
            ("id".to_string(), "$.id".to_string()),
            ("slug".to_string(), "$.slug".to_string()),
            ("flag".to_string(), "$.flag".to_string()),
            ("missing".to_string(), "$.nope".to_string()),
            ("nested".to_string(), "$.nested".to_string()),
        ];
        let params = item_params("p", &item, &declared);
        assert_eq!(params["id"], "7");
        assert_eq!(params["slug"], "intro");
        assert_eq!(params["flag"], "true");
        assert!(!params.contains_key("missing"));
        assert!(!params.contains_key("nested"));
    }
}
