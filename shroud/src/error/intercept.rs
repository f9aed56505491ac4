//! Configuration-interception proxy errors.

use thiserror::Error;

/// Errors raised by the configuration-interception proxy.
///
/// A schema violation means the vendor changed the shape of a successful
/// configuration response in a way that breaks the rewrite; continuing
/// would silently stop masking the player, so these are fatal.
#[derive(Error, Debug)]
pub enum InterceptError {
    /// A successful configuration response no longer matches the expected
    /// schema
    #[error("Configuration response no longer matches the expected schema: {reason}")]
    SchemaViolation { reason: String },

    /// The affinity token could not be decoded
    #[error("Malformed affinity token: {reason}")]
    MalformedAffinityToken { reason: String },

    /// A chat client connected before any configuration response revealed
    /// the real chat endpoint
    #[error("Chat client connected before the chat endpoint was discovered")]
    EndpointNeverDiscovered,
}
