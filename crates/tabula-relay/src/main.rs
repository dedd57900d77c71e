//! Tabula Relay Server
//!
//! Accepts table questions over HTTP and streams the model's answer back as
//! server-sent events.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use tabula_core::config::{Config, load_config};
use tabula_core::tracing_init::init_tracing;
use tabula_relay::relay::RelayContext;
use tabula_relay::server::{AppState, build_router};
use tabula_relay::session::SessionStore;
use tabula_relay::upstream::{OllamaClient, Upstream};

/// How often expired sessions are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "tabula-relay")]
#[command(version, about = "Tabula relay server - streams table answers from a local model")]
struct Args {
    /// Path to a JSON settings file.
    #[arg(long, env = "TABULA_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Base URL of the inference service.
    #[arg(long)]
    upstream_url: Option<String>,

    /// Model to generate with.
    #[arg(long)]
    model: Option<String>,

    /// Silence window in seconds before a stream times out.
    #[arg(long)]
    watchdog_secs: Option<u64>,

    /// Log level for tabula crates when `RUST_LOG` is not set.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TABULA_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.server.listen_addr = addr;
        }
        if let Some(url) = &self.upstream_url {
            config.upstream.base_url.clone_from(url);
        }
        if let Some(model) = &self.model {
            config.upstream.model.clone_from(model);
        }
        if let Some(secs) = self.watchdog_secs {
            config.relay.watchdog_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.server.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    let level = &config.server.log_level;
    init_tracing(&format!("tabula_relay={level},tabula_core={level}"), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        upstream = %config.upstream.base_url,
        model = %config.upstream.model,
        "Starting tabula-relay"
    );

    let upstream: Arc<dyn Upstream> = Arc::new(OllamaClient::new(&config.upstream)?);
    match upstream.health().await {
        Ok(()) => info!("Upstream reachable"),
        Err(e) => warn!(error = %e, "Upstream not reachable yet"),
    }

    let sessions = SessionStore::new(config.sessions.ttl());
    let relay = RelayContext::new(
        sessions.clone(),
        upstream,
        config.relay.clone(),
        config.upstream.connect_timeout(),
    );

    // Background sweep for sessions whose expiry timer did not get to run
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            sessions.purge_expired().await;
        }
    });

    let app = build_router(AppState {
        relay,
        require_upstream: config.sessions.require_upstream,
    });

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Relay server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = sigterm => {
            info!("Received SIGTERM shutdown signal");
        }
    }
}
