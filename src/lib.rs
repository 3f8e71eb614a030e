pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod mutator;
pub mod orchestrator;
pub mod platform;
pub mod revert;
pub mod storage;
pub mod test_utils;
pub mod worker;

pub use error::{IdError, Result};

/// Package version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
