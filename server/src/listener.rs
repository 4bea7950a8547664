//! Listeners and server assembly.
//!
//! Each configured listener binds one address: plain HTTP, TLS (with
//! rustls client-auth modes), or a redirect-only listener that bounces
//! GET/HEAD to HTTPS. Sites are mounted on listeners by name; a
//! redirect listener carries no site. Shutdown is graceful: on signal
//! every listener handle drains in-flight connections.

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;

use kiln_config::{ClientAuth, Config, ListenerConfig, ListenerMode, RedirectSettings, TlsSettings};
use kiln_store::Store;

use crate::site::{Site, SiteError};

/// Grace period for in-flight connections at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Site(#[from] SiteError),

    #[error("TLS setup failed for listener {listener}: {message}")]
    Tls { listener: String, message: String },

    #[error("listener {listener} failed: {source}")]
    Listen {
        listener: String,
        #[source]
        source: std::io::Error,
    },
}

struct Mount {
    listener: ListenerConfig,
    router: Router,
}

/// The assembled server: every listener bound to its router.
pub struct Server {
    mounts: Vec<Mount>,
}

impl Server {
    /// Build sites and mount them on their listeners.
    ///
    /// Redirect listeners get their bounce router; every other listener
    /// carries exactly one site.
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Result<Self, ServerError> {
        let mut sites = Vec::with_capacity(config.sites.len());
        for site_config in &config.sites {
            sites.push(Site::from_config(site_config, Arc::clone(&store))?);
        }

        let mut mounts = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            let mounted: Vec<&Site> = sites
                .iter()
                .filter(|site| site.listeners().iter().any(|name| *name == listener.name))
                .collect();

            let router = match &listener.mode {
                ListenerMode::Redirect(settings) => {
                    if !mounted.is_empty() {
                        return Err(ServerError::Config(format!(
                            "listener {} redirects; sites cannot mount on it",
                            listener.name
                        )));
                    }
                    redirect_router(settings)
                }
                ListenerMode::Plain | ListenerMode::Tls(_) => match mounted.as_slice() {
                    [] => {
                        tracing::warn!(listener = %listener.name, "listener has no site");
                        Router::new()
                    }
                    [site] => site.router(),
                    _ => {
                        return Err(ServerError::Config(format!(
                            "listener {} has multiple sites; one site per listener",
                            listener.name
                        )));
                    }
                },
            };

            mounts.push(Mount {
                listener: listener.clone(),
                router,
            });
        }

        Ok(Self { mounts })
    }

    /// Bind every listener and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let handle = Handle::new();
        let mut tasks = tokio::task::JoinSet::new();

        for mount in self.mounts {
            let name = mount.listener.name.clone();
            let addr = mount.listener.addr;
            let service = mount
                .router
                .into_make_service_with_connect_info::<SocketAddr>();
            let handle = handle.clone();

            match &mount.listener.mode {
                ListenerMode::Plain => {
                    tracing::info!(listener = %name, %addr, "listening");
                    tasks.spawn(async move {
                        let result = axum_server::bind(addr).handle(handle).serve(service).await;
                        (name, result)
                    });
                }
                ListenerMode::Tls(settings) => {
                    let tls = tls_server_config(&name, settings)?;
                    let rustls_config = RustlsConfig::from_config(Arc::new(tls));
                    tracing::info!(listener = %name, %addr, "listening (tls)");
                    tasks.spawn(async move {
                        let result = axum_server::bind_rustls(addr, rustls_config)
                            .handle(handle)
                            .serve(service)
                            .await;
                        (name, result)
                    });
                }
                ListenerMode::Redirect(settings) => {
                    let http_config = axum_server::HttpConfig::new()
                        .http1_header_read_timeout(Duration::from_secs(settings.header_timeout_s))
                        .build();
                    tracing::info!(listener = %name, %addr, "listening (redirect)");
                    tasks.spawn(async move {
                        let result = axum_server::bind(addr)
                            .http_config(http_config)
                            .handle(handle)
                            .serve(service)
                            .await;
                        (name, result)
                    });
                }
            }
        }

        shutdown.await;
        tracing::info!("shutting down");
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => tracing::debug!(listener = %name, "listener stopped"),
                Ok((name, Err(source))) => {
                    tracing::error!(listener = %name, %source, "listener failed");
                    first_error.get_or_insert(ServerError::Listen { listener: name, source });
                }
                Err(join_error) => {
                    tracing::error!(%join_error, "listener task panicked");
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Build the rustls server config for a TLS listener.
///
/// rustls always verifies a presented certificate, so the accept-
/// without-verifying modes map onto the nearest verifying mode:
/// `request`/`verify` allow anonymous clients, `require`/
/// `require_and_verify` demand a verified certificate.
fn tls_server_config(
    listener: &str,
    settings: &TlsSettings,
) -> Result<rustls::ServerConfig, ServerError> {
    let tls_error = |message: String| ServerError::Tls {
        listener: listener.to_string(),
        message,
    };

    let certs = read_certs(&settings.cert_file).map_err(tls_error)?;
    let key_file = std::fs::File::open(&settings.key_file)
        .map_err(|e| tls_error(format!("failed to open {}: {e}", settings.key_file)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| tls_error(format!("invalid key {}: {e}", settings.key_file)))?
        .ok_or_else(|| tls_error(format!("no private key in {}", settings.key_file)))?;

    let config = if settings.client_auth == ClientAuth::None {
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for ca_file in &settings.ca_files {
            for cert in read_certs(ca_file).map_err(tls_error)? {
                roots
                    .add(cert)
                    .map_err(|e| tls_error(format!("invalid CA in {ca_file}: {e}")))?;
            }
        }
        let builder = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots));
        let builder = match settings.client_auth {
            ClientAuth::Request | ClientAuth::Verify => builder.allow_unauthenticated(),
            _ => builder,
        };
        let verifier = builder
            .build()
            .map_err(|e| tls_error(format!("client verifier: {e}")))?;
        rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    };

    let mut config = config.map_err(|e| tls_error(format!("certificate chain rejected: {e}")))?;
    // HTTP/2 negotiates over ALPN; offer it alongside HTTP/1.1.
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn read_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, String> {
    let file =
        std::fs::File::open(path).map_err(|e| format!("failed to open {path}: {e}"))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid certificate in {path}: {e}"))
}

/// The redirect-only router: GET/HEAD bounce to HTTPS, everything else
/// is told to use it.
fn redirect_router(settings: &RedirectSettings) -> Router {
    let target_port = settings.target_port;
    Router::new().fallback(any(move |request: Request| async move {
        redirect_response(&request, target_port)
    }))
}

fn redirect_response(request: &Request, target_port: Option<u16>) -> Response {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return (StatusCode::BAD_REQUEST, "Use HTTPS").into_response();
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string())
        .unwrap_or_default();
    let port = target_port.map(|port| format!(":{port}")).unwrap_or_default();
    let uri = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let location = format!("https://{host}{port}{uri}");

    match Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}
