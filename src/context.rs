use crate::config::types::AppConfig;
use crate::metrics::MetricsRegistry;
use crate::ssh::handler::ConnState;
use anyhow::Result;
use dashmap::DashMap;
use russh::keys::PrivateKey;
use std::sync::Arc;
use std::time::Instant;

/// Shared application context, replacing scattered Arc parameters
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<MetricsRegistry>,
    /// Private key for backend public-key authentication, parsed once at
    /// startup (the configuration is immutable afterwards).
    pub client_key: Option<Arc<PrivateKey>>,
    /// Live inbound connections by connection id, used by the shutdown path
    /// to drive per-session signal escalation.
    pub connections: DashMap<String, Arc<ConnState>>,
    pub start_time: Instant,
}

impl AppContext {
    /// Validates the configuration and loads the backend client key.
    /// Configuration errors abort startup here, before any listener binds.
    pub fn new(config: Arc<AppConfig>, metrics: Arc<MetricsRegistry>) -> Result<Self> {
        crate::config::validate_config(&config)?;
        let client_key =
            crate::ssh::keys::load_client_key(&config.upstream.private_key)?.map(Arc::new);
        Ok(Self {
            config,
            metrics,
            client_key,
            connections: DashMap::new(),
            start_time: Instant::now(),
        })
    }
}
