//! Error handling for the shroud relay.
//!
//! This module provides a hierarchical error system using `thiserror` that
//! covers configuration, networking, certificate handling, and the
//! configuration-interception proxy. Recoverable conditions (malformed
//! stanza fragments, upstream error pages) are handled locally by the
//! components and never surface here; everything in this hierarchy is
//! either fatal or reported to the top-level handler.

mod certificate;
mod config;
mod intercept;
mod network;

pub use certificate::CertificateError;
pub use config::ConfigError;
pub use intercept::InterceptError;
pub use network::NetworkError;

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the shroud relay.
///
/// Each variant maps to a functional domain of the application. The binary
/// is the only place a process exit happens; every failure path below it
/// returns one of these.
#[derive(Error, Debug)]
pub enum ShroudError {
    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Certificate and TLS-related errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Configuration-interception proxy errors
    #[error("Config interception error: {0}")]
    Intercept(#[from] InterceptError),

    /// I/O operations errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic system errors for unrecoverable conditions
    #[error("System error: {message}")]
    System { message: String },
}

// BoringSSL error conversion
impl From<boring::ssl::Error> for ShroudError {
    fn from(_err: boring::ssl::Error) -> Self {
        ShroudError::Certificate(CertificateError::ValidationFailed)
    }
}

impl From<boring::error::ErrorStack> for ShroudError {
    fn from(_err: boring::error::ErrorStack) -> Self {
        ShroudError::Certificate(CertificateError::ValidationFailed)
    }
}

impl From<serde_json::Error> for ShroudError {
    fn from(err: serde_json::Error) -> Self {
        ShroudError::system(format!("JSON serialization/deserialization failed: {err}"))
    }
}

impl From<tokio::task::JoinError> for ShroudError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ShroudError::system("Task was cancelled")
        } else if err.is_panic() {
            ShroudError::system("Task panicked")
        } else {
            ShroudError::system(format!("Task failed: {err}"))
        }
    }
}

impl From<tracing::subscriber::SetGlobalDefaultError> for ShroudError {
    fn from(err: tracing::subscriber::SetGlobalDefaultError) -> Self {
        ShroudError::system(format!("Failed to set global tracing subscriber: {err}"))
    }
}

impl From<figment::Error> for ShroudError {
    fn from(err: figment::Error) -> Self {
        let config_error = match err.kind {
            figment::error::Kind::MissingField(field) => ConfigError::MissingField {
                field: field.to_string(),
            },
            _ => ConfigError::ParseError {
                message: err.to_string(),
            },
        };
        ShroudError::Config(config_error)
    }
}

impl ShroudError {
    /// Creates a new ShroudError with a system message.
    pub fn system(message: impl Into<String>) -> Self {
        ShroudError::System {
            message: message.into(),
        }
    }

    /// Creates a ShroudError for a failed network connection.
    pub fn connection_failed(address: impl Into<String>) -> Self {
        ShroudError::Network(NetworkError::ConnectionFailed {
            address: address.into(),
        })
    }

    /// Creates a ShroudError for a configuration file not found.
    pub fn config_file_not_found(path: impl Into<PathBuf>) -> Self {
        ShroudError::Config(ConfigError::FileNotFound { path: path.into() })
    }
}

/// Result type alias for shroud operations.
pub type Result<T> = std::result::Result<T, ShroudError>;
