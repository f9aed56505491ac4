use std::future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use shroud::config::Settings;
use shroud::control::{Controller, CoreEvent};
use shroud::interceptor::ConfigInterceptor;
use shroud::logging::log_subscriber;
use shroud::policy::{PolicyHandle, StatusMode};
use shroud::relay::ActiveRelay;
use shroud::supervisor::{PromptChoice, Supervisor, UserPrompt};
use shroud::{Result, ShroudError};

#[derive(Parser)]
#[command(
    name = "shroud",
    about = "Masks your chat status by relaying the launcher's chat connection"
)]
struct Cli {
    /// Optional TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Launcher executable to start pointed at the interception proxy
    #[arg(long)]
    launch: Option<PathBuf>,
    /// Product the launcher should start
    #[arg(long, default_value = "league_of_legends")]
    product: String,
    /// Initial masked status (chat, offline or mobile)
    #[arg(long, value_parser = parse_status)]
    status: Option<StatusMode>,
}

fn parse_status(value: &str) -> std::result::Result<StatusMode, String> {
    value.parse()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("shroud: failed to load settings: {e}");
            exit(1);
        }
    };

    if let Err(e) = tracing::subscriber::set_global_default(log_subscriber(&settings.log.level)) {
        eprintln!("shroud: failed to install log subscriber: {e}");
        exit(1);
    }

    if let Err(e) = run(cli, settings).await {
        error!("A critical error occurred: {e}");
        exit(1);
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let mut initial_policy = settings.initial_policy();
    if let Some(status) = cli.status {
        initial_policy.status = status;
    }
    let policy = PolicyHandle::new(initial_policy);

    // Step 1: open the port the chat client will be pointed at.
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let relay_port = listener.local_addr()?.port();

    // Step 2: start the configuration interception proxy.
    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    let interceptor = ConfigInterceptor::start(&settings, relay_port, fatal_tx).await?;

    // Step 3: hand the proxy URL to the launcher.
    let mut launcher = match &cli.launch {
        Some(path) => Some(spawn_launcher(path, &interceptor.url(), &cli.product)?),
        None => {
            info!(
                "Start the launcher yourself with --client-config-url=\"{}\"",
                interceptor.url()
            );
            None
        }
    };

    // The discovered endpoint is orchestration-level diagnostics only; the
    // supervisor consumes it through its own receiver.
    let mut endpoint_rx = interceptor.endpoint_receiver();
    tokio::spawn(async move {
        if let Ok(discovered) = endpoint_rx.wait_for(|endpoint| endpoint.is_some()).await {
            if let Some(endpoint) = discovered.as_ref() {
                info!(
                    "Launcher's real chat server is {}:{}",
                    endpoint.host, endpoint.port
                );
            }
        }
    });

    let active = ActiveRelay::default();
    let (events_tx, _) = broadcast::channel(8);
    let controller = Controller::new(policy.clone(), active.clone(), events_tx.clone());

    // A real control surface (tray menu) would update its UI here.
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(CoreEvent::SessionErrored) = events.recv().await {
            warn!("Chat session ended; waiting for the client to reconnect");
        }
    });

    let supervisor = Supervisor::new(
        listener,
        &settings,
        interceptor.endpoint_receiver(),
        policy,
        Arc::new(ConsolePrompt),
        active,
        events_tx,
        fatal_rx,
    )?;

    tokio::select! {
        result = supervisor.run() => result,
        _ = launcher_exit(&mut launcher) => {
            info!("Launcher exited, shutting down");
            Ok(())
        }
        _ = shutdown_signal() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

fn spawn_launcher(path: &Path, config_url: &str, product: &str) -> Result<tokio::process::Child> {
    info!("Starting launcher {}", path.display());
    tokio::process::Command::new(path)
        .arg(format!("--client-config-url={config_url}"))
        .arg(format!("--launch-product={product}"))
        .arg("--launch-patchline=live")
        .spawn()
        .map_err(|e| ShroudError::system(format!("Failed to start the launcher: {e}")))
}

/// Resolves when the spawned launcher exits; pending forever when none was
/// spawned.
async fn launcher_exit(child: &mut Option<tokio::process::Child>) {
    match child {
        Some(child) => {
            let _ = child.wait().await;
        }
        None => future::pending().await,
    }
}

/// Console stand-in for the dialog a GUI surface would show.
struct ConsolePrompt;

#[async_trait]
impl UserPrompt for ConsolePrompt {
    async fn retry_cancel(&self, message: &str) -> PromptChoice {
        println!("{message}");
        println!("Press Enter to retry, or type q to quit.");

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let read = std::io::stdin().read_line(&mut line)?;
            Ok::<_, std::io::Error>((read, line))
        })
        .await;

        match line {
            Ok(Ok((read, line))) if read > 0 && !line.trim().eq_ignore_ascii_case("q") => {
                PromptChoice::Retry
            }
            _ => PromptChoice::Cancel,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            future::pending::<()>().await;
        }
    };

    #[cfg(not(windows))]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(_) => future::pending().await,
            }
        };

        tokio::select! {
            _ = ctrl_c => { info!("Received Ctrl+C, shutting down..."); },
            _ = terminate => { info!("Received SIGTERM, shutting down..."); },
        }
    }

    #[cfg(windows)]
    {
        let ctrl_close = async {
            match tokio::signal::windows::ctrl_close() {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(_) => future::pending().await,
            }
        };

        tokio::select! {
            _ = ctrl_c => { info!("Received Ctrl+C, shutting down..."); },
            _ = ctrl_close => { info!("Window closed, shutting down..."); },
        }
    }
}
