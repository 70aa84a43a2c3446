//! Common error types

use thiserror::Error;

/// Errors raised by the shared plumbing
#[derive(Debug, Error)]
pub enum Error {
    /// Hotplug channel closed or full
    #[error("Channel error: {0}")]
    Channel(String),

    /// Invalid or conflicting logging setup
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
