//! The request view captured for one sandbox invocation.

use std::collections::HashMap;

/// Request metadata exposed to the script through `server.request`.
///
/// Captured once per request before the sandbox runs; immutable for the
/// lifetime of the invocation. Query parameters and headers are
/// multi-valued, mirroring what the wire allows.
#[derive(Debug, Clone, Default)]
pub struct RequestView {
    pub method: String,
    pub proto: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub remote_addr: String,
    pub host: String,
    pub path: String,
    pub query: HashMap<String, Vec<String>>,
    pub headers: HashMap<String, Vec<String>>,
}

impl RequestView {
    /// A minimal GET view for the given path. Test and tooling helper.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            proto: "HTTP/1.1".to_string(),
            proto_major: 1,
            proto_minor: 1,
            path: path.into(),
            ..Self::default()
        }
    }
}
