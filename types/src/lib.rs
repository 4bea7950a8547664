//! Core domain types for kiln.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer of the
//! application: resources and their byte segments, the request view handed
//! to the script sandbox, the render result harvested from it, and the
//! `$token` substitution used by the loader and the renderer.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod render;
mod request;
mod resource;
mod substitute;

pub use render::{
    DEFAULT_REDIRECT_STATUS, DEFAULT_RENDER_STATUS, DomElement, DomElementList, INVALID_STATUS,
    Redirect, RenderResult,
};
pub use request::RequestView;
pub use resource::Resource;
pub use substitute::{substitute, substitute_value};
