//! Session supervisor.
//!
//! Bridges the interceptor's discovered endpoint to actual TLS session
//! establishment: accepts chat clients on the pre-bound loopback listener,
//! handshakes the client-facing leg with the bundled certificate, opens
//! the server-facing leg to the most recently discovered chat endpoint,
//! and keeps exactly one live relay at a time. After a session ends, a
//! grace period distinguishes "client reconnecting" from "client quit";
//! a new connection cancels the pending shutdown.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boring::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use boring::x509::X509;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_boring::SslStream;
use tracing::{debug, info, warn};

use crate::certificates;
use crate::config::Settings;
use crate::control::CoreEvent;
use crate::error::{InterceptError, NetworkError, Result, ShroudError};
use crate::interceptor::ChatEndpoint;
use crate::policy::PolicyHandle;
use crate::relay::{ActiveRelay, SessionEvent, SessionRelay};

/// Answer to a blocking retry/cancel prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    Retry,
    Cancel,
}

/// Blocking user interaction, implemented by the embedding surface (a
/// dialog in a GUI, the console in the CLI).
#[async_trait]
pub trait UserPrompt: Send + Sync + 'static {
    /// Presents a retry/cancel choice and waits for the answer.
    async fn retry_cancel(&self, message: &str) -> PromptChoice;
}

/// Owns the loopback listener and the lifecycle of relay sessions.
pub struct Supervisor {
    listener: TcpListener,
    acceptor: SslAcceptor,
    endpoint_rx: watch::Receiver<Option<ChatEndpoint>>,
    policy: PolicyHandle,
    prompt: Arc<dyn UserPrompt>,
    active: ActiveRelay,
    events_tx: broadcast::Sender<CoreEvent>,
    fatal_rx: mpsc::Receiver<ShroudError>,
    grace: Duration,
    insecure_upstream: bool,
}

impl Supervisor {
    /// Builds a supervisor around a pre-bound loopback listener.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        settings: &Settings,
        endpoint_rx: watch::Receiver<Option<ChatEndpoint>>,
        policy: PolicyHandle,
        prompt: Arc<dyn UserPrompt>,
        active: ActiveRelay,
        events_tx: broadcast::Sender<CoreEvent>,
        fatal_rx: mpsc::Receiver<ShroudError>,
    ) -> Result<Self> {
        Ok(Self {
            listener,
            acceptor: build_acceptor(settings)?,
            endpoint_rx,
            policy,
            prompt,
            active,
            events_tx,
            fatal_rx,
            grace: Duration::from_secs(settings.reconnect_grace_s),
            insecure_upstream: settings.tls.insecure_upstream,
        })
    }

    /// Runs the accept loop until a fatal error or the grace-period
    /// shutdown. Returning is the only way the process winds down; the
    /// caller decides the exit.
    pub async fn run(self) -> Result<()> {
        let Supervisor {
            listener,
            acceptor,
            endpoint_rx,
            policy,
            prompt,
            active,
            events_tx,
            mut fatal_rx,
            grace,
            insecure_upstream,
        } = self;

        let (session_tx, mut session_rx) = mpsc::channel::<SessionEvent>(8);
        let mut current: Option<SessionRelay<SslStream<TcpStream>, SslStream<TcpStream>>> = None;
        let mut live_sessions: usize = 0;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, remote) = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            warn!("Failed to accept a chat client connection: {e}");
                            continue;
                        }
                    };
                    debug!("Chat client connected from {remote}");

                    // Reconnects may race rediscovery; always take the most
                    // recently discovered endpoint.
                    let endpoint = endpoint_rx.borrow().clone();
                    let Some(endpoint) = endpoint else {
                        return Err(InterceptError::EndpointNeverDiscovered.into());
                    };

                    let client_stream = match tokio_boring::accept(&acceptor, tcp).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("TLS handshake with the chat client failed: {e}");
                            continue;
                        }
                    };

                    let server_stream =
                        connect_outgoing(prompt.as_ref(), insecure_upstream, &endpoint).await?;
                    info!("Relaying chat session to {}:{}", endpoint.host, endpoint.port);

                    // A fresh session never inherits per-session state; the
                    // relay re-creates all of it.
                    if let Some(previous) = current.take() {
                        debug!("Replacing a stale relay session");
                        previous.shutdown();
                    }
                    grace_deadline = None;

                    let relay = SessionRelay::start(
                        client_stream,
                        server_stream,
                        policy.clone(),
                        session_tx.clone(),
                    );
                    *active.lock() = Some(relay.control());
                    current = Some(relay);
                    live_sessions = 1;
                }

                Some(SessionEvent::Ended) = session_rx.recv() => {
                    live_sessions = live_sessions.saturating_sub(1);
                    *active.lock() = None;
                    let _ = events_tx.send(CoreEvent::SessionErrored);
                    if live_sessions == 0 {
                        info!(
                            "Chat session ended; waiting {}s for the client to reconnect",
                            grace.as_secs()
                        );
                        grace_deadline = Some(Instant::now() + grace);
                    }
                }

                Some(fatal) = fatal_rx.recv() => {
                    return Err(fatal);
                }

                _ = grace_expiry(grace_deadline) => {
                    info!("No chat client reconnected within the grace period, shutting down");
                    if let Some(relay) = current.take() {
                        relay.shutdown();
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// Pending when no deadline is armed, so the select branch stays quiet.
async fn grace_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Opens the server-facing leg to the discovered endpoint, retrying under
/// user confirmation. Cancelling abandons the whole process.
async fn connect_outgoing(
    prompt: &dyn UserPrompt,
    insecure: bool,
    endpoint: &ChatEndpoint,
) -> Result<SslStream<TcpStream>> {
    let address = format!("{}:{}", endpoint.host, endpoint.port);
    loop {
        match try_connect(insecure, endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!("Failed to reach the chat server at {address}: {e}");
                let choice = prompt
                    .retry_cancel(&format!(
                        "Unable to connect to the chat server at {address}. \
                         Check your internet connection and retry, or cancel to quit."
                    ))
                    .await;
                if choice == PromptChoice::Cancel {
                    return Err(NetworkError::Abandoned { address }.into());
                }
            }
        }
    }
}

async fn try_connect(insecure: bool, endpoint: &ChatEndpoint) -> Result<SslStream<TcpStream>> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| {
            ShroudError::connection_failed(format!(
                "{}:{} ({e})",
                endpoint.host, endpoint.port
            ))
        })?;

    let connector = build_connector(insecure)?;
    let config = connector.configure()?;

    // The discovered chat host doubles as the TLS server name.
    tokio_boring::connect(config, &endpoint.host, tcp)
        .await
        .map_err(|e| {
            NetworkError::HandshakeFailed {
                address: format!("{}:{}", endpoint.host, endpoint.port),
                reason: e.to_string(),
            }
            .into()
        })
}

/// TLS acceptor for the client-facing leg, presenting the bundled (or
/// configured) certificate.
fn build_acceptor(settings: &Settings) -> Result<SslAcceptor> {
    let certificate = certificates::load_relay_certificate(&settings.tls)?;
    let private_key = certificates::load_relay_private_key(&settings.tls)?;

    let mut acceptor_builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|e| ShroudError::system(format!("Failed to create SSL acceptor: {e}")))?;
    acceptor_builder.set_certificate(&certificate)?;
    acceptor_builder.set_private_key(&private_key)?;
    acceptor_builder.check_private_key()?;

    // The chat client never presents a certificate.
    acceptor_builder.set_verify(SslVerifyMode::NONE);

    Ok(acceptor_builder.build())
}

/// TLS connector for the server-facing leg with system root certs loaded.
fn build_connector(insecure: bool) -> Result<SslConnector> {
    let mut connector_builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| ShroudError::system(format!("Failed to create SSL connector: {e}")))?;

    if insecure {
        warn!("TLS certificate verification DISABLED for the outgoing leg - this is unsafe!");
        connector_builder.set_verify(SslVerifyMode::NONE);
    } else {
        connector_builder.set_verify(SslVerifyMode::PEER);

        // BoringSSL does not load platform certificate stores by itself.
        let native_certs = rustls_native_certs::load_native_certs();
        if !native_certs.errors.is_empty() {
            warn!("Errors loading native certs: {:?}", native_certs.errors);
        }
        let mut loaded_count = 0;
        for cert in &native_certs.certs {
            if let Ok(x509) = X509::from_der(cert.as_ref()) {
                if connector_builder.cert_store_mut().add_cert(x509).is_ok() {
                    loaded_count += 1;
                }
            }
        }
        debug!("Loaded {loaded_count} system root certificates");
    }

    Ok(connector_builder.build())
}
