use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use russh::server::Server as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::types::AppConfig;
use crate::context::AppContext;
use crate::metrics::MetricsRegistry;
use crate::ssh::handler::ProxyHandler;
use crate::ssh::keys;

/// Main server orchestrator: binds the inbound listener, serves metrics if
/// enabled, and coordinates graceful shutdown with TERM/KILL escalation on
/// every active session.
pub async fn run(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let metrics = Arc::new(MetricsRegistry::new());
    let ctx = Arc::new(AppContext::new(config.clone(), metrics.clone())?);

    let host_key = keys::load_or_generate_host_key(&config.server.host_key_path)?;
    info!(path = %config.server.host_key_path.display(), "Host key loaded");

    let shutdown = CancellationToken::new();

    if config.metrics.enabled {
        let listen = config.metrics.listen.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) =
                crate::metrics::server::start_metrics_server(&listen, metrics, shutdown).await
            {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let _ssh_task = spawn_ssh_server(&config.server.listen, host_key, &config, ctx.clone());
    info!(
        addr = %config.server.listen,
        backend = %format!("{}:{}", config.upstream.server, config.upstream.port),
        "SSH proxy listening"
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_signals(shutdown).await;
        });
    }

    shutdown.cancelled().await;
    info!(
        timeout = config.server.shutdown_timeout,
        "Initiating graceful shutdown"
    );

    // Stop accepting new sessions and escalate TERM then KILL per channel.
    let grace = Duration::from_secs(config.server.shutdown_grace);
    for entry in ctx.connections.iter() {
        entry.value().set_draining();
        entry.value().begin_shutdown(grace);
    }

    // Wait for active sessions to drain (up to shutdown_timeout)
    let drain_deadline =
        tokio::time::Instant::now() + Duration::from_secs(config.server.shutdown_timeout);
    loop {
        let active = metrics.sessions_active.get();
        if active == 0 {
            info!("All sessions drained");
            break;
        }
        if tokio::time::Instant::now() >= drain_deadline {
            warn!(
                active_sessions = active,
                "Shutdown timeout reached, forcing exit"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    info!("Graceful shutdown complete");
    Ok(())
}

/// Build the russh server configuration for the inbound listener.
///
/// The `none` method must stay enabled: inbound authentication is delegated
/// to the backend, and `none` is how the handshake completes.
pub fn build_server_config(
    config: &AppConfig,
    host_key: russh::keys::PrivateKey,
) -> Arc<russh::server::Config> {
    let mut ssh_config = russh::server::Config::default();
    ssh_config.keys.push(host_key);
    ssh_config.server_id = russh::SshId::Standard(config.server.server_id.clone());
    ssh_config.methods = russh::MethodSet::from(
        [
            russh::MethodKind::None,
            russh::MethodKind::Password,
            russh::MethodKind::PublicKey,
            russh::MethodKind::KeyboardInteractive,
        ]
        .as_slice(),
    );
    ssh_config.auth_rejection_time = Duration::from_secs(1);
    ssh_config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    if config.server.keepalive_interval_secs > 0 {
        ssh_config.keepalive_interval =
            Some(Duration::from_secs(config.server.keepalive_interval_secs));
        ssh_config.keepalive_max = config.server.keepalive_max as usize;
    }
    Arc::new(ssh_config)
}

/// Spawn the SSH listener task
fn spawn_ssh_server(
    listen_addr: &str,
    host_key: russh::keys::PrivateKey,
    config: &AppConfig,
    ctx: Arc<AppContext>,
) -> tokio::task::JoinHandle<()> {
    let listen = listen_addr.to_string();
    let ssh_config = build_server_config(config, host_key);

    tokio::spawn(async move {
        let mut server = ProxyServer { ctx };
        if let Err(e) = server.run_on_address(ssh_config, &listen as &str).await {
            error!(error = %e, "SSH server error");
        }
    })
}

pub struct ProxyServer {
    pub ctx: Arc<AppContext>,
}

impl russh::server::Server for ProxyServer {
    type Handler = ProxyHandler;

    fn new_client(&mut self, peer_addr: Option<std::net::SocketAddr>) -> ProxyHandler {
        let handler = ProxyHandler::new(self.ctx.clone(), peer_addr);
        info!(peer = ?peer_addr, conn_id = %handler.conn_id(), "New SSH connection");
        handler
    }
}

#[cfg(unix)]
async fn handle_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, initiating graceful shutdown");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, initiating graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn handle_signals(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Interrupt received, initiating graceful shutdown");
    shutdown.cancel();
}
