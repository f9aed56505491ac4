//! Certificate and TLS operation errors.

use thiserror::Error;

/// Certificate and TLS operation errors.
///
/// Handles loading of the bundled relay certificate, user-supplied
/// overrides, and handshake failures. Certificate details are not exposed.
#[derive(Error, Debug)]
pub enum CertificateError {
    /// Certificate file could not be loaded
    #[error("Certificate loading failed: {path}")]
    LoadFailed { path: std::path::PathBuf },

    /// Private key file could not be loaded
    #[error("Private key loading failed: {path}")]
    PrivateKeyLoadFailed { path: std::path::PathBuf },

    /// Certificate validation failed
    #[error("Certificate validation failed")]
    ValidationFailed,

    /// Certificate format is unsupported
    #[error("Unsupported certificate format")]
    UnsupportedFormat,
}
