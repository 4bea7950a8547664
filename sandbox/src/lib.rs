//! The script sandbox.
//!
//! Every SSR invocation runs the site bundle inside a fresh V8 isolate
//! on a dedicated OS thread, with a configurable heap limit, a
//! configurable worker stack size, and a watchdog that terminates
//! execution at the configured timeout. Host functions expose the
//! request view and a response builder to the script; nothing survives
//! from one invocation to the next.
//!
//! Isolates are not recycled. The [`SandboxPool`] bounds how many are
//! alive at once; the isolate itself is built and destroyed per
//! invocation.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]

mod bridge;
mod engine;
mod pool;

use thiserror::Error;

pub use engine::{Invocation, Sandbox, SandboxLimits};
pub use pool::{SandboxPermit, SandboxPool};

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The bundle failed to compile or threw at runtime.
    #[error("script error at {source_name}:{line}: {message}")]
    Script {
        message: String,
        line: usize,
        source_name: String,
    },

    /// The watchdog interrupted the script at the configured timeout.
    #[error("script execution timed out")]
    Timeout,

    /// No sandbox slot freed up within the permit timeout.
    #[error("no sandbox permit available")]
    PermitTimeout,

    /// The worker thread failed outside of script execution.
    #[error("sandbox worker failed: {0}")]
    Worker(String),
}
