//! chatmux-server: multi-tenant chat session connection manager.
//!
//! Keeps one protocol connection per tenant session alive through a sidecar
//! bridge, persists credentials, mirrors status changes, and serves an
//! operator console on stdin.

mod config;
mod console;
mod credentials;
mod mirror;
mod session;
mod transport;

use anyhow::Context;
use chatmux_core::StatusMirror;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use console::Console;
use credentials::FileCredentialStore;
use mirror::{HttpMirror, LogMirror};
use session::{ConnectionManager, Sweeper};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use transport::BridgeTransport;

/// chatmux-server: chat session connection manager
#[derive(Parser, Debug)]
#[command(name = "chatmux-server", version, about = "Chat session connection manager")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.chatmux/config.toml")]
    config: String,

    /// Protocol sidecar WebSocket URL
    #[arg(long)]
    bridge_url: Option<String>,

    /// Directory holding per-session credentials
    #[arg(long)]
    credentials_dir: Option<String>,

    /// URL receiving status updates (log-only when unset)
    #[arg(long)]
    mirror_url: Option<String>,

    /// Reconnect attempts allowed since the last successful connect
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Do not run the periodic stale-session sweep
    #[arg(long)]
    no_sweeper: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting chatmux-server");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "chatmux-server failed");
        std::process::exit(1);
    }

    info!("chatmux-server stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = CliOverrides {
        bridge_url: cli.bridge_url,
        credentials_dir: cli.credentials_dir,
        mirror_url: cli.mirror_url,
        max_reconnect_attempts: cli.max_reconnect_attempts,
        disable_sweeper: cli.no_sweeper,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config =
        ServerConfig::load(Some(&config_path), &overrides).context("failed to load config")?;

    let status_mirror: Arc<dyn StatusMirror> = match &server_config.mirror_url {
        Some(url) => {
            info!(url = %url, "mirroring status over HTTP");
            Arc::new(
                HttpMirror::new(url.clone(), server_config.mirror_timeout)
                    .context("failed to build status mirror")?,
            )
        }
        None => Arc::new(LogMirror),
    };

    std::fs::create_dir_all(&server_config.credentials_dir).with_context(|| {
        format!(
            "failed to create credentials dir {}",
            server_config.credentials_dir.display()
        )
    })?;
    info!(
        credentials = %server_config.credentials_dir.display(),
        bridge = %server_config.bridge.url,
        "session stores ready"
    );

    let manager = ConnectionManager::new(
        Arc::new(BridgeTransport::new(server_config.bridge.clone())),
        Arc::new(FileCredentialStore::new(&server_config.credentials_dir)),
        status_mirror,
        server_config.manager,
    );

    let sweeper = server_config
        .sweep
        .map(|policy| Sweeper::spawn(manager.clone(), policy));
    if sweeper.is_none() {
        info!("stale-session sweeper disabled");
    }

    let console = Console::new(
        manager.clone(),
        server_config.sweep.unwrap_or_default(),
        server_config.login_wait,
    );
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = console.run(stdin, tokio::io::stdout()) => {
            result.context("console failed")?;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    if let Some(sweeper) = &sweeper {
        sweeper.stop();
    }
    let closed = manager.force_close_all().await;
    info!(closed, "all sessions closed");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
