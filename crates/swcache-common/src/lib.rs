//! # SwCache Common
//!
//! Shared plumbing for the SwCache offline router crates. Today that is the
//! tracing subscriber setup used by every binary in the workspace.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
