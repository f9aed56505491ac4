//! Control surface of the core.
//!
//! The tray menu, dialogs and any other UI live outside this crate; they
//! reach the core exclusively through [`Controller`] and observe it through
//! [`CoreEvent`]s. Policy changes become visible to the next stanza any
//! relay processes; when a session is active, a change is also re-applied
//! to the cached last presence immediately, so the new status propagates
//! without waiting for new client traffic.

use tokio::sync::broadcast;
use tracing::warn;

use crate::policy::{MaskingPolicy, PolicyHandle, StatusMode};
use crate::relay::ActiveRelay;

/// Events the core surfaces to the embedding control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    /// A relay session ended; the supervisor decides whether the process
    /// survives the grace period.
    SessionErrored,
}

/// Facade the external control surface mutates the masking policy through.
#[derive(Clone)]
pub struct Controller {
    policy: PolicyHandle,
    active: ActiveRelay,
    events: broadcast::Sender<CoreEvent>,
}

impl Controller {
    pub fn new(
        policy: PolicyHandle,
        active: ActiveRelay,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            policy,
            active,
            events,
        }
    }

    /// Subscribes to core events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> MaskingPolicy {
        self.policy.snapshot()
    }

    /// Changes the masked status. With masking enabled and a session
    /// active, the cached presence is re-applied right away.
    pub async fn set_status(&self, status: StatusMode) {
        self.policy.set_status(status);
        if self.policy.snapshot().enabled {
            self.rebroadcast(status).await;
        }
    }

    /// Enables or disables masking. Disabling re-applies the cached
    /// presence unmasked so other players see the real status again.
    pub async fn set_enabled(&self, enabled: bool) {
        self.policy.set_enabled(enabled);
        let status = if enabled {
            self.policy.snapshot().status
        } else {
            StatusMode::Chat
        };
        self.rebroadcast(status).await;
    }

    /// Toggles forwarding of presences targeted at lobby/party chat.
    pub fn set_lobby_chat(&self, enabled: bool) {
        self.policy.set_lobby_chat(enabled);
    }

    async fn rebroadcast(&self, status: StatusMode) {
        let relay = self.active.lock().clone();
        if let Some(relay) = relay {
            if let Err(e) = relay.rebroadcast(status).await {
                warn!("Failed to re-apply the cached presence: {e}");
            }
        }
    }
}
