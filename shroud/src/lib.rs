//! Shroud - a presence-masking relay for the launcher's chat connection.
//!
//! Shroud sits between the game launcher's embedded chat client and the
//! vendor's chat network. It intercepts the launcher's configuration
//! discovery request to substitute a local TLS relay for the real chat
//! endpoint, then relays the chat session while rewriting the presence
//! stanzas the client broadcasts, so other players see whatever status the
//! user picked instead of their real one.

pub mod certificates;
pub mod config;
pub mod constants;
pub mod control;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod policy;
pub mod presence;
pub mod relay;
pub mod supervisor;
pub mod xml;

pub use error::{Result, ShroudError};
pub use policy::{MaskingPolicy, PolicyHandle, StatusMode};
