//! Root orchestration: process lifecycle, CA directory preparation, and
//! graceful shutdown.

use anyhow::Context;
use secure_proxy::config::ConfigStore;
use secure_proxy::log::TrafficLog;
use secure_proxy::proxy::{BridgeContext, CertManager, Listener};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

/// Fixed filesystem paths the proxy reads from and writes to. Nothing
/// here is configurable via environment variables.
struct ProxyPaths {
    rules: PathBuf,
    ca_dir: PathBuf,
    traffic_log: PathBuf,
}

impl ProxyPaths {
    fn fixed() -> Self {
        Self {
            rules: PathBuf::from("/config/rules.json"),
            ca_dir: PathBuf::from("/ca"),
            traffic_log: PathBuf::from("/logs/traffic.jsonl"),
        }
    }
}

const LISTEN_ADDR: &str = "0.0.0.0:58080";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal startup failure");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let paths = ProxyPaths::fixed();

    // Config errors are never fatal: first-load failure falls back to the
    // built-in Monitor/empty default.
    let config_store = Arc::new(ConfigStore::load_initial(&paths.rules));

    // CA init failure (an unwritable CA directory) is fatal.
    let cert_manager = Arc::new(
        CertManager::new(&paths.ca_dir)
            .with_context(|| format!("failed to initialize CA at {}", paths.ca_dir.display()))?,
    );
    tracing::info!(path = %paths.ca_dir.join("certs/ca.pem").display(), "root CA ready");

    let traffic_log = Arc::new(
        TrafficLog::open(&paths.traffic_log)
            .with_context(|| format!("failed to open traffic log at {}", paths.traffic_log.display()))?,
    );

    let ctx = BridgeContext::new(cert_manager, config_store.clone(), traffic_log);

    let addr: SocketAddr = LISTEN_ADDR
        .parse()
        .expect("LISTEN_ADDR is a valid socket address");
    let listener = Listener::new(addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(handle_signals(shutdown_tx, config_store));

    listener
        .serve(ctx, shutdown_rx)
        .await
        .context("listener failed")?;

    tracing::info!("proxy shut down cleanly");
    Ok(())
}

/// Installs SIGINT/SIGTERM (graceful shutdown) and SIGHUP (config reload)
/// handlers. SIGINT is handled via `ctrl_c`, which works without a
/// `unix`-specific signal handle, unlike SIGTERM/SIGHUP.
async fn handle_signals(shutdown_tx: tokio::sync::watch::Sender<bool>, config_store: Arc<ConfigStore>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading rules");
                if let Err(err) = config_store.reload() {
                    tracing::warn!(error = %err, "rule reload failed, keeping previous snapshot");
                }
            }
        }
    }
}
