//! Site assembly.
//!
//! A site owns its renderer and exposes one axum router: an SSR
//! fallback for every path, optional static files served in front of
//! it, a `robots.txt` handler when configured, and the middleware chain
//! (request tracing, compression, configured response headers).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, Version, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use thiserror::Error;
use tower_http::compression::CompressionLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use kiln_config::SiteConfig;
use kiln_store::Store;
use kiln_types::RequestView;

use crate::renderer::{Rendered, Renderer};

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("site {site}: invalid response header {name:?}: {message}")]
    InvalidHeader {
        site: String,
        name: String,
        message: String,
    },
}

struct SiteContext {
    renderer: Renderer,
    robots: Option<String>,
}

/// One configured site, ready to be mounted on its listeners.
pub struct Site {
    name: String,
    listeners: Vec<String>,
    static_dir: Option<String>,
    headers: Vec<(HeaderName, HeaderValue)>,
    context: Arc<SiteContext>,
}

impl Site {
    pub fn from_config(config: &SiteConfig, store: Arc<dyn Store>) -> Result<Self, SiteError> {
        let mut headers = Vec::with_capacity(config.headers.len());
        for (name, value) in &config.headers {
            let header_name: HeaderName =
                name.parse().map_err(|e: header::InvalidHeaderName| {
                    SiteError::InvalidHeader {
                        site: config.name.clone(),
                        name: name.clone(),
                        message: e.to_string(),
                    }
                })?;
            let header_value: HeaderValue =
                value.parse().map_err(|e: header::InvalidHeaderValue| {
                    SiteError::InvalidHeader {
                        site: config.name.clone(),
                        name: name.clone(),
                        message: e.to_string(),
                    }
                })?;
            headers.push((header_name, header_value));
        }

        Ok(Self {
            name: config.name.clone(),
            listeners: config.listeners.clone(),
            static_dir: config.static_dir.clone(),
            headers,
            context: Arc::new(SiteContext {
                renderer: Renderer::from_config(config, store),
                robots: config.robots.clone(),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listener names this site is mounted on.
    #[must_use]
    pub fn listeners(&self) -> &[String] {
        &self.listeners
    }

    /// Build the site router with its middleware chain.
    #[must_use]
    pub fn router(&self) -> Router {
        let ssr = any(ssr_handler).with_state(Arc::clone(&self.context));

        let mut router = Router::new();
        if self.context.robots.is_some() {
            router = router.route(
                "/robots.txt",
                get(robots_handler).with_state(Arc::clone(&self.context)),
            );
        }

        router = match &self.static_dir {
            Some(dir) => router.fallback_service(ServeDir::new(dir).fallback(ssr)),
            None => router.fallback_service(ssr),
        };

        let mut router = router
            .layer(CompressionLayer::new())
            .layer(TraceLayer::new_for_http());
        for (name, value) in &self.headers {
            router = router.layer(SetResponseHeaderLayer::appending(
                name.clone(),
                value.clone(),
            ));
        }
        router
    }
}

async fn ssr_handler(State(context): State<Arc<SiteContext>>, request: Request) -> Response {
    let view = request_view(&request);
    let rendered = context.renderer.render(&view).await;
    rendered_response(&rendered)
}

async fn robots_handler(State(context): State<Arc<SiteContext>>) -> Response {
    match &context.robots {
        Some(robots) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            robots.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Capture the request metadata the sandbox exposes.
fn request_view(request: &Request) -> RequestView {
    let (proto, proto_major, proto_minor) = match request.version() {
        Version::HTTP_10 => ("HTTP/1.0", 1, 0),
        Version::HTTP_2 => ("HTTP/2.0", 2, 0),
        Version::HTTP_3 => ("HTTP/3.0", 3, 0),
        _ => ("HTTP/1.1", 1, 1),
    };

    let mut query: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    if let Some(raw) = request.uri().query() {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            query
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }

    let mut headers: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for (name, value) in request.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| request.uri().host().map(ToString::to_string))
        .unwrap_or_default();

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    RequestView {
        method: request.method().as_str().to_string(),
        proto: proto.to_string(),
        proto_major,
        proto_minor,
        remote_addr,
        host,
        path: request.uri().path().to_string(),
        query,
        headers,
    }
}

/// Convert a rendered response into the wire shape.
fn rendered_response(rendered: &Rendered) -> Response {
    let result = match rendered {
        Rendered::Page {
            status,
            headers,
            body,
        } => {
            let mut builder = Response::builder().status(*status);
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder.body(Body::from(body.clone()))
        }
        Rendered::Redirect {
            url,
            status,
            headers,
        } => {
            let mut builder = Response::builder()
                .status(*status)
                .header(header::LOCATION, url.as_str());
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder.body(Body::empty())
        }
    };

    result.unwrap_or_else(|error| {
        tracing::error!(%error, "rendered response had invalid parts");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}
