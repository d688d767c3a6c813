// VPN Session Bridge Daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vpn_bridge::{
    backend::{MemoryBackend, NetworkManagerBackend, VpnBackend},
    channel::{self, Outcome, Request, Response},
    config::load_config,
    profile_store::ProfileStore,
    shared_store::SharedStore,
    types::{BackendKind, Config},
    ControlFacade,
};

#[derive(Parser)]
#[command(name = "vpn-bridge")]
#[command(about = "VPN session control and status bridge", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/vpn-bridge/config.toml")]
    config: PathBuf,
}

/// How long queued replies may take to reach stdout at shutdown
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type Outbox = mpsc::UnboundedSender<Response>;

/// Serialize responses to stdout, one JSON document per line
fn spawn_writer(mut rx: mpsc::UnboundedReceiver<Response>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to encode response: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                log::error!("Failed to write to stdout: {}", e);
                break;
            }
            if let Err(e) = stdout.flush().await {
                log::error!("Failed to flush stdout: {}", e);
                break;
            }
        }
    })
}

/// Forward status updates of a fresh subscription to the outbox
fn spawn_forwarder<B: VpnBackend>(facade: &ControlFacade<B>, outbox: Outbox) -> JoinHandle<()> {
    let mut updates = facade.subscribe();
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let event = Response::Event {
                value: update.as_wire().to_string(),
            };
            if outbox.send(event).is_err() {
                break;
            }
        }
        log::debug!("Status stream listener detached");
    })
}

fn handle_line<B: VpnBackend>(
    line: &str,
    facade: &Arc<ControlFacade<B>>,
    outbox: &Outbox,
    forwarder: &mut Option<JoinHandle<()>>,
) {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Skipping malformed request: {}", e);
            return;
        }
    };

    match request {
        Request::Call {
            id,
            method,
            arguments,
        } => {
            log::debug!("Call {} {}", id, method);
            let facade = Arc::clone(facade);
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let reply = match channel::dispatch(&*facade, &method, &arguments).await {
                    Ok(Outcome::Reply(value)) => Some(Response::reply(id, Ok(value))),
                    Ok(Outcome::NoReply) => None,
                    Err(e) => Some(Response::reply(id, Err(e))),
                };
                if let Some(reply) = reply {
                    let _ = outbox.send(reply);
                }
            });
        }
        Request::Listen => {
            if let Some(previous) = forwarder.take() {
                previous.abort();
            }
            *forwarder = Some(spawn_forwarder(facade.as_ref(), outbox.clone()));
            log::info!("Status stream listener attached");
        }
        Request::Cancel => {
            if let Some(previous) = forwarder.take() {
                previous.abort();
            }
            facade.unsubscribe();
            log::info!("Status stream listener cancelled");
        }
    }
}

/// Run the request loop until stdin closes or a shutdown signal arrives
async fn serve<B: VpnBackend>(backend: B, config: &Config) -> Result<()> {
    let profiles = match &config.general.profile_path {
        Some(path) => ProfileStore::open(path)
            .with_context(|| format!("Failed to open profile store {:?}", path))?,
        None => ProfileStore::in_memory(),
    };
    let shared = SharedStore::new(&config.general.shared_dir);
    let facade = Arc::new(ControlFacade::new(Arc::new(backend), profiles, shared));

    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(outbox_rx);
    let mut forwarder: Option<JoinHandle<()>> = None;

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    log::info!("Daemon started successfully");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }
            line = lines.next_line() => {
                match line.context("Failed to read from stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => handle_line(&line, &facade, &outbox, &mut forwarder),
                    None => {
                        log::info!("stdin closed");
                        break;
                    }
                }
            }
        }
    }

    log::info!("Shutting down...");
    if let Some(forwarder) = forwarder.take() {
        forwarder.abort();
    }
    facade.unsubscribe();
    // The tunnel is left running
    facade.dispose();

    drop(outbox);
    // In-flight calls may still hold outbox clones
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        log::warn!("Dropping replies of calls still in flight");
    }

    log::info!("Shutdown complete");
    Ok(())
}

fn main() -> Result<()> {
    // 2 threads: request loop plus the status relay and OS calls
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("vpn-bridge")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // stderr only; stdout carries the wire protocol
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .target(env_logger::Target::Stderr)
    .init();

    log::info!("Starting vpn-bridge daemon");
    log::info!("Backend: {:?}", config.general.backend);
    log::info!("Shared directory: {}", config.general.shared_dir.display());

    match config.general.backend {
        BackendKind::NetworkManager => {
            let backend = NetworkManagerBackend::new()
                .await
                .context("Failed to connect to NetworkManager")?;
            serve(backend, &config).await
        }
        BackendKind::Memory => {
            log::warn!("Using the in-memory backend; no tunnel will be created");
            serve(MemoryBackend::new(), &config).await
        }
    }
}
