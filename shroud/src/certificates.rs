//! Certificate loading for the client-facing TLS leg.
//!
//! The relay presents a bundled self-signed certificate to the chat client;
//! the configuration rewrite forces the client to accept it (see the
//! interceptor's `chat.allow_bad_cert.enabled` handling). A user-supplied
//! certificate/key pair from the settings file takes precedence over the
//! bundled one.

use std::fs;
use std::path::Path;

use boring::pkey::{PKey, Private};
use boring::x509::X509;

use crate::config::TlsSettings;
use crate::error::{CertificateError, Result};

/// Certificate bundled with the binary.
pub const BUNDLED_CERTIFICATE: &str = include_str!("../certs/relay.crt");

/// Private key matching [`BUNDLED_CERTIFICATE`].
pub const BUNDLED_PRIVATE_KEY: &str = include_str!("../certs/relay.key");

/// Loads the certificate the relay presents to the chat client.
pub fn load_relay_certificate(settings: &TlsSettings) -> Result<X509> {
    match &settings.certificate_file {
        Some(path) => load_certificate_from_file(path),
        None => load_certificate_from_pem(BUNDLED_CERTIFICATE),
    }
}

/// Loads the private key the relay presents to the chat client.
pub fn load_relay_private_key(settings: &TlsSettings) -> Result<PKey<Private>> {
    match &settings.certificate_key_file {
        Some(path) => load_private_key_from_file(path),
        None => load_private_key_from_pem(BUNDLED_PRIVATE_KEY),
    }
}

/// Loads an X.509 certificate from a PEM file.
pub fn load_certificate_from_file(path: &Path) -> Result<X509> {
    let pem_data = fs::read(path).map_err(|_| CertificateError::LoadFailed {
        path: path.to_path_buf(),
    })?;

    X509::from_pem(&pem_data).map_err(|_| {
        CertificateError::LoadFailed {
            path: path.to_path_buf(),
        }
        .into()
    })
}

/// Loads an X.509 certificate from PEM-encoded string.
pub fn load_certificate_from_pem(pem_data: &str) -> Result<X509> {
    X509::from_pem(pem_data.as_bytes()).map_err(|_| CertificateError::UnsupportedFormat.into())
}

/// Loads a private key from a PEM file.
pub fn load_private_key_from_file(path: &Path) -> Result<PKey<Private>> {
    let pem_data = fs::read(path).map_err(|_| CertificateError::PrivateKeyLoadFailed {
        path: path.to_path_buf(),
    })?;

    PKey::private_key_from_pem(&pem_data).map_err(|_| {
        CertificateError::PrivateKeyLoadFailed {
            path: path.to_path_buf(),
        }
        .into()
    })
}

/// Loads a private key from PEM-encoded string.
pub fn load_private_key_from_pem(pem_data: &str) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(pem_data.as_bytes())
        .map_err(|_| CertificateError::UnsupportedFormat.into())
}
