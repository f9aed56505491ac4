//! Session relay: one client-facing stream, one server-facing stream, two
//! forwarding loops.
//!
//! The relay is generic over its stream types so the loops run identically
//! over TLS streams in production and in-memory duplex pipes in tests. Per
//! direction, bytes are forwarded in read order; a presence rewrite
//! completes and is fully written before the next inbound chunk is
//! processed. A manual status change is a side write against the shared
//! state, it never interrupts either loop.
//!
//! Lifecycle: `Connecting -> Relaying -> Closed`. A closed relay reports a
//! single session event; reconnection is the supervisor's responsibility.

mod fake_contact;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    FAKE_CONTACT_JID, INTRO_MESSAGE_DELAY, READ_BUFFER_SIZE, ROSTER_QUERY_MARKER,
};
use crate::policy::{PolicyHandle, StatusMode};
use crate::presence::rewrite_presences;

/// Emitted once when a session ends for any reason other than an
/// intentional shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Ended,
}

/// Handle the control surface uses to reach the active session without
/// knowing its stream types.
#[async_trait]
pub trait RelayControl: Send + Sync {
    /// Re-applies the cached last presence under the given status and
    /// notifies the player through the synthetic contact.
    async fn rebroadcast(&self, status: StatusMode) -> io::Result<()>;

    /// Sends an informational message from the synthetic contact.
    async fn notify(&self, message: &str) -> io::Result<()>;
}

/// Shared slot holding the control handle of the currently active session.
pub type ActiveRelay = Arc<SyncMutex<Option<Arc<dyn RelayControl>>>>;

/// A running relay session.
pub struct SessionRelay<C, S> {
    shared: Arc<RelayShared<WriteHalf<C>, WriteHalf<S>>>,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl<C, S> SessionRelay<C, S>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Splits both streams and starts the two forwarding loops.
    pub fn start(
        client: C,
        server: S,
        policy: PolicyHandle,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let shared = Arc::new(RelayShared::new(client_write, server_write, policy));
        let inbound = tokio::spawn(inbound_loop(client_read, shared.clone(), events_tx.clone()));
        let outbound = tokio::spawn(outbound_loop(server_read, shared.clone(), events_tx));

        Self {
            shared,
            inbound,
            outbound,
        }
    }

    /// Control handle for the manual status-change path.
    pub fn control(&self) -> Arc<dyn RelayControl> {
        self.shared.clone()
    }

    /// Tears the session down without reporting a session event.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.inbound.abort();
        self.outbound.abort();
    }
}

/// State shared between the two loops and the control surface.
pub struct RelayShared<WC, WS> {
    /// Write half toward the chat client
    client: Mutex<WC>,
    /// Write half toward the real chat server
    server: Mutex<WS>,
    policy: PolicyHandle,
    /// Most recently observed raw presence payload, re-applied on manual
    /// status changes
    last_presence: SyncMutex<Option<String>>,
    /// Product client version learned from a rich-presence payload
    product_version: SyncMutex<Option<String>>,
    contact_inserted: AtomicBool,
    contact_presence_sent: AtomicBool,
    intro_sent: AtomicBool,
    shutting_down: AtomicBool,
    ended: AtomicBool,
}

impl<WC, WS> RelayShared<WC, WS>
where
    WC: AsyncWrite + Unpin + Send + 'static,
    WS: AsyncWrite + Unpin + Send + 'static,
{
    fn new(client: WC, server: WS, policy: PolicyHandle) -> Self {
        Self {
            client: Mutex::new(client),
            server: Mutex::new(server),
            policy,
            last_presence: SyncMutex::new(None),
            product_version: SyncMutex::new(None),
            contact_inserted: AtomicBool::new(false),
            contact_presence_sent: AtomicBool::new(false),
            intro_sent: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    async fn write_to_client(&self, bytes: &[u8]) -> io::Result<()> {
        let mut client = self.client.lock().await;
        client.write_all(bytes).await?;
        client.flush().await
    }

    async fn write_to_server(&self, bytes: &[u8]) -> io::Result<()> {
        let mut server = self.server.lock().await;
        server.write_all(bytes).await?;
        server.flush().await
    }

    /// Records the chunk as the last observed presence and forwards it,
    /// rewritten when masking is enabled.
    async fn handle_presence_chunk(&self, content: &str) -> io::Result<()> {
        *self.last_presence.lock() = Some(content.to_string());

        let policy = self.policy.snapshot();
        if !policy.enabled {
            return self.write_to_server(content.as_bytes()).await;
        }
        self.rewrite_and_send(content, policy.status, policy.connect_lobby_chat)
            .await
    }

    async fn rewrite_and_send(
        &self,
        content: &str,
        status: StatusMode,
        connect_lobby_chat: bool,
    ) -> io::Result<()> {
        match rewrite_presences(content, status, connect_lobby_chat) {
            Ok(outcome) => {
                if let Some(version) = outcome.discovered_version {
                    let fresh = {
                        let mut cached = self.product_version.lock();
                        if cached.is_none() {
                            info!("Learned product client version {version}");
                            *cached = Some(version);
                            true
                        } else {
                            false
                        }
                    };
                    // Refresh the contact so its advertised version matches.
                    if fresh && self.contact_inserted.load(Ordering::SeqCst) {
                        self.send_fake_presence().await?;
                    }
                }
                self.write_to_server(outcome.payload.as_bytes()).await
            }
            Err(e) => {
                warn!("Presence rewrite failed, forwarding original bytes: {e}");
                self.write_to_server(content.as_bytes()).await
            }
        }
    }

    async fn send_fake_presence(&self) -> io::Result<()> {
        self.contact_presence_sent.store(true, Ordering::SeqCst);
        let version = self.product_version.lock().clone();
        let stanza = fake_contact::presence_stanza(version.as_deref());
        self.write_to_client(stanza.as_bytes()).await
    }

    async fn send_fake_message(&self, body: &str) -> io::Result<()> {
        if !self.contact_inserted.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.write_to_client(fake_contact::message_stanza(body).as_bytes())
            .await
    }

    /// Interprets a suppressed chunk about the synthetic contact as a text
    /// command. Longer keywords are tested first so "disable" never
    /// matches as "enable".
    async fn handle_contact_chunk(&self, content: &str) -> io::Result<()> {
        debug!("Suppressed client traffic about the masking contact");
        let lowered = content.to_lowercase();

        if lowered.contains("offline") {
            self.set_masked_status(StatusMode::Offline).await
        } else if lowered.contains("mobile") {
            self.set_masked_status(StatusMode::Mobile).await
        } else if lowered.contains("online") {
            self.set_masked_status(StatusMode::Chat).await
        } else if lowered.contains("disable") {
            let policy = self.policy.snapshot();
            if !policy.enabled {
                self.send_fake_message("Masking is already disabled.").await
            } else {
                self.policy.set_enabled(false);
                self.apply_status_and_notify(StatusMode::Chat).await
            }
        } else if lowered.contains("enable") {
            let policy = self.policy.snapshot();
            if policy.enabled {
                self.send_fake_message("Masking is already enabled.").await
            } else {
                self.policy.set_enabled(true);
                self.apply_status_and_notify(policy.status).await
            }
        } else if lowered.contains("status") {
            let policy = self.policy.snapshot();
            let reply = if policy.enabled {
                format!("You appear {} to other players.", policy.status.describe())
            } else {
                "Masking is disabled; other players see your real status.".to_string()
            };
            self.send_fake_message(&reply).await
        } else if lowered.contains("help") {
            self.send_fake_message(
                "Message me online, offline, mobile, enable, disable or status to change \
                 settings without leaving the client.",
            )
            .await
        } else {
            Ok(())
        }
    }

    async fn set_masked_status(&self, status: StatusMode) -> io::Result<()> {
        let previous = self.policy.snapshot();
        if !previous.enabled {
            self.send_fake_message("Masking is now enabled.").await?;
        }
        self.policy.set_status(status);
        self.policy.set_enabled(true);
        self.apply_status_and_notify(status).await
    }

    /// Re-applies the cached presence under the given status and sends one
    /// informational message describing it.
    async fn apply_status_and_notify(&self, status: StatusMode) -> io::Result<()> {
        self.apply_status(status).await?;
        self.send_fake_message(&format!("You now appear {}.", status.describe()))
            .await
    }

    async fn apply_status(&self, status: StatusMode) -> io::Result<()> {
        let last = self.last_presence.lock().clone();
        let Some(last) = last else {
            debug!("No cached presence to re-apply yet");
            return Ok(());
        };
        let connect_lobby_chat = self.policy.snapshot().connect_lobby_chat;
        self.rewrite_and_send(&last, status, connect_lobby_chat).await
    }

    /// Reports the session end exactly once, unless it was intentional.
    async fn finish(&self, events_tx: &mpsc::Sender<SessionEvent>) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let _ = events_tx.send(SessionEvent::Ended).await;
    }
}

/// Sends the session's introduction once, a little after the contact first
/// exists, so the client has rendered the roster by then.
fn schedule_intro<WC, WS>(shared: &Arc<RelayShared<WC, WS>>)
where
    WC: AsyncWrite + Unpin + Send + 'static,
    WS: AsyncWrite + Unpin + Send + 'static,
{
    if shared.intro_sent.swap(true, Ordering::SeqCst) {
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(INTRO_MESSAGE_DELAY).await;
        let policy = shared.policy.snapshot();
        let greeting = if policy.enabled {
            format!(
                "Status masking is active. You currently appear {} to other players.",
                policy.status.describe()
            )
        } else {
            "Status masking is currently disabled.".to_string()
        };
        if shared.send_fake_message(&greeting).await.is_err() {
            return;
        }
        let _ = shared
            .send_fake_message(
                "Message me online, offline, mobile, enable, disable or status to change \
                 settings without leaving the client.",
            )
            .await;
    });
}

#[async_trait]
impl<WC, WS> RelayControl for RelayShared<WC, WS>
where
    WC: AsyncWrite + Unpin + Send + 'static,
    WS: AsyncWrite + Unpin + Send + 'static,
{
    async fn rebroadcast(&self, status: StatusMode) -> io::Result<()> {
        self.apply_status_and_notify(status).await
    }

    async fn notify(&self, message: &str) -> io::Result<()> {
        self.send_fake_message(message).await
    }
}

/// Client -> server direction.
async fn inbound_loop<R, WC, WS>(
    mut client_read: R,
    shared: Arc<RelayShared<WC, WS>>,
    events_tx: mpsc::Sender<SessionEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    WC: AsyncWrite + Unpin + Send + 'static,
    WS: AsyncWrite + Unpin + Send + 'static,
{
    match run_inbound(&mut client_read, &shared).await {
        Ok(()) => debug!("Inbound leg closed"),
        Err(e) => debug!("Inbound leg ended: {e}"),
    }
    shared.finish(&events_tx).await;
}

async fn run_inbound<R, WC, WS>(
    client_read: &mut R,
    shared: &Arc<RelayShared<WC, WS>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    WC: AsyncWrite + Unpin + Send + 'static,
    WS: AsyncWrite + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = client_read.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = &buffer[..n];
        let content = String::from_utf8_lossy(chunk);

        if content.contains("<presence") {
            shared.handle_presence_chunk(&content).await?;
        } else if content.contains(FAKE_CONTACT_JID) {
            // Never let traffic about the contact reach the real server.
            shared.handle_contact_chunk(&content).await?;
        } else {
            shared.write_to_server(chunk).await?;
        }

        if shared.contact_inserted.load(Ordering::SeqCst)
            && !shared.contact_presence_sent.load(Ordering::SeqCst)
        {
            shared.send_fake_presence().await?;
        }
    }
}

/// Server -> client direction.
async fn outbound_loop<R, WC, WS>(
    mut server_read: R,
    shared: Arc<RelayShared<WC, WS>>,
    events_tx: mpsc::Sender<SessionEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    WC: AsyncWrite + Unpin + Send + 'static,
    WS: AsyncWrite + Unpin + Send + 'static,
{
    match run_outbound(&mut server_read, &shared).await {
        Ok(()) => debug!("Outbound leg closed"),
        Err(e) => debug!("Outbound leg ended: {e}"),
    }
    shared.finish(&events_tx).await;
}

async fn run_outbound<R, WC, WS>(
    server_read: &mut R,
    shared: &Arc<RelayShared<WC, WS>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    WC: AsyncWrite + Unpin + Send + 'static,
    WS: AsyncWrite + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = server_read.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = &buffer[..n];

        if !shared.contact_inserted.load(Ordering::SeqCst) {
            let content = String::from_utf8_lossy(chunk);
            if let Some(index) = content.find(ROSTER_QUERY_MARKER) {
                let insert_at = index + ROSTER_QUERY_MARKER.len();
                let item = fake_contact::roster_item();
                let mut spliced = String::with_capacity(content.len() + item.len());
                spliced.push_str(&content[..insert_at]);
                spliced.push_str(&item);
                spliced.push_str(&content[insert_at..]);

                shared.contact_inserted.store(true, Ordering::SeqCst);
                shared.write_to_client(spliced.as_bytes()).await?;
                info!("Spliced the masking contact into the roster");
                schedule_intro(shared);
                continue;
            }
        }

        shared.write_to_client(chunk).await?;
    }
}
