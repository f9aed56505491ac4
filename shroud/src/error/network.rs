//! Network communication errors.

use thiserror::Error;

/// Network communication errors.
///
/// Encompasses connection establishment and session-level stream failures.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection to remote peer failed
    #[error("Connection failed to {address}")]
    ConnectionFailed { address: String },

    /// Connection was unexpectedly closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// TLS handshake with a peer failed
    #[error("TLS handshake failed with {address}: {reason}")]
    HandshakeFailed { address: String, reason: String },

    /// Port binding failed
    #[error("Port binding failed: {port}")]
    PortBindFailed { port: u16 },

    /// The user declined to keep retrying a failed connection
    #[error("Connection to {address} abandoned by user")]
    Abandoned { address: String },
}
