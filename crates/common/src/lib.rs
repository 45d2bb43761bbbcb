//! tandem common library
//!
//! Data model, script loading and error types shared by the orchestrator
//! and the command-line front end.

pub mod error;
pub mod script;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// tandem version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
