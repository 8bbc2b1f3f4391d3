//! Error types for hangout-core

use thiserror::Error;

/// Main error type for the hangout-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend REST API error
    #[error("backend error: {0}")]
    Backend(String),

    /// Realtime transport error (connect failure, dropped channel)
    #[error("transport error on {domain}: {message}")]
    Transport { domain: String, message: String },

    /// Operation requires an authenticated session
    #[error("no authenticated session")]
    Unauthenticated,

    /// Domain name not recognised
    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    /// Authoritative reload failed
    #[error("reload of {domain} failed: {message}")]
    Reload { domain: String, message: String },
}

/// Result type alias for hangout-core
pub type Result<T> = std::result::Result<T, Error>;
