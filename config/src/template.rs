//! Configuration templates emitted by `kiln init`.

use std::io::Write;
use std::path::Path;

use crate::ConfigError;

/// Minimal configuration: one plain listener, one site, no loader.
pub const DEFAULT: &str = r#"app:
  store:
    storage: memory
  fetcher:
    providers: {}
  server:
    listeners:
      - name: main
        listen: 0.0.0.0:8080
    sites:
      - name: main
        listeners: [main]
        env: production
        index: site/index.html
        bundle: site/bundle.js
        container: root
"#;

/// A worked example: REST provider, paginated parser, TLS and redirect
/// listeners, rules with state exports, caching and static files.
pub const EXAMPLE: &str = r#"log:
  level: info

app:
  store:
    storage: memory

  fetcher:
    providers:
      local:
        type: file
      api:
        type: rest
        timeout_s: 30
        retry: 3
        retry_delay_s: 1
        headers:
          Accept: application/json

  loader:
    parsers:
      - name: posts
        resource:
          posts:
            provider: api
            config:
              url: https://api.example.com/posts
              next: true
              next_parser: header
        filter: "$.data"
        item_params:
          id: "$.id"
        item:
          post-$id:
            provider: api
            config:
              url: https://api.example.com/posts/$id
        persist: true

  server:
    listeners:
      - name: https
        listen: 0.0.0.0:8443
        tls:
          cert_file: tls/server.crt
          key_file: tls/server.key
          client_auth: none
      - name: http
        listen: 0.0.0.0:8080
        redirect:
          target_port: 8443

    sites:
      - name: main
        listeners: [https]
        env: production
        index: site/index.html
        bundle: site/bundle.js
        container: root
        state_id: state
        max_vms: 4
        vm_timeout_ms: 500
        cache:
          enabled: true
          ttl_s: 60
          max_items: 1024
        rules:
          - path: ^/posts/(?P<id>[0-9]+)$
            state:
              - key: post
                resource: post-$id
                export: true
            terminal: true
          - path: ^/
            state:
              - key: posts
                resource: posts
        static_dir: site/static
        headers:
          X-Frame-Options: DENY
        robots: |
          User-agent: *
          Allow: /
"#;

/// Resolve a template by name. `None` selects the default.
pub fn by_name(name: Option<&str>) -> Result<&'static str, ConfigError> {
    match name {
        None | Some("default") => Ok(DEFAULT),
        Some("example") => Ok(EXAMPLE),
        Some(other) => Err(ConfigError::Invalid(format!(
            "unknown template {other:?} (available: default, example)"
        ))),
    }
}

/// Write a template to `path`, refusing to clobber an existing file.
pub fn write(path: impl AsRef<Path>, template: &str) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    file.write_all(template.as_bytes())
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_name_resolves_known_templates() {
        assert_eq!(by_name(None).unwrap(), DEFAULT);
        assert_eq!(by_name(Some("example")).unwrap(), EXAMPLE);
        assert!(by_name(Some("nope")).is_err());
    }

    #[test]
    fn write_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.yaml");
        write(&path, DEFAULT).unwrap();
        assert!(write(&path, DEFAULT).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT);
    }
}
