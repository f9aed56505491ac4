//! Masked-status policy shared between the control surface and the relay.
//!
//! The policy is process-wide state: the control surface writes it, every
//! relay loop reads it. Reads take a snapshot by value so a rewrite always
//! works against one consistent policy, and a write becomes visible to the
//! next stanza processed by any active relay.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The status broadcast to other players while masking is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusMode {
    /// Appear online and available
    Chat,
    /// Appear offline
    Offline,
    /// Appear connected through the mobile app
    Mobile,
}

impl StatusMode {
    /// Wire token used in `<show>` and per-product `<st>` elements.
    pub fn token(self) -> &'static str {
        match self {
            StatusMode::Chat => "chat",
            StatusMode::Offline => "offline",
            StatusMode::Mobile => "mobile",
        }
    }

    /// Human wording used in messages from the synthetic contact.
    pub fn describe(self) -> &'static str {
        match self {
            StatusMode::Chat => "online",
            StatusMode::Offline => "offline",
            StatusMode::Mobile => "mobile",
        }
    }
}

impl fmt::Display for StatusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for StatusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chat" | "online" => Ok(StatusMode::Chat),
            "offline" => Ok(StatusMode::Offline),
            "mobile" => Ok(StatusMode::Mobile),
            other => Err(format!("unknown status '{other}' (expected chat, offline or mobile)")),
        }
    }
}

/// Process-wide masking policy.
#[derive(Clone, Copy, Debug)]
pub struct MaskingPolicy {
    /// Whether presence rewriting is active at all
    pub enabled: bool,
    /// Whether presences targeted at lobby/party chat rooms are forwarded
    pub connect_lobby_chat: bool,
    /// Status to substitute while masking is enabled
    pub status: StatusMode,
}

/// Shared, synchronized handle to the masking policy.
#[derive(Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<MaskingPolicy>>,
}

impl PolicyHandle {
    pub fn new(policy: MaskingPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(policy)),
        }
    }

    /// Returns the current policy by value.
    pub fn snapshot(&self) -> MaskingPolicy {
        *self.inner.read()
    }

    pub fn set_status(&self, status: StatusMode) {
        self.inner.write().status = status;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.write().enabled = enabled;
    }

    pub fn set_lobby_chat(&self, enabled: bool) {
        self.inner.write().connect_lobby_chat = enabled;
    }
}
