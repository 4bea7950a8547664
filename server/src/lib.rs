//! HTTP serving for kiln.
//!
//! The pieces of the request path live here: the mtime-tracked asset
//! cache, the LRU response cache, the HTML splicer, the per-site
//! request renderer, site routers with their middleware chain, and the
//! listeners (plain, TLS, redirect) that bind it all to the network.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]

pub mod assets;
mod listener;
pub mod renderer;
pub mod response_cache;
mod site;
pub mod splice;

pub use listener::{Server, ServerError};
pub use site::{Site, SiteError};
