//! Shared outbound connection pool.
//!
//! One `reqwest::Client` owns the keep-alive sockets to the backend host.
//! Callers borrow cheap clones of it; `close` drops the pool's own handle so
//! idle sockets are released once in-flight calls finish.

use std::sync::RwLock;

use encore_core::{GatewayResult, PoolConfig, TransportError};
use reqwest::Client;

/// Bounded set of persistent connections to the backend.
#[derive(Debug)]
pub struct ConnectionPool {
    client: RwLock<Option<Client>>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Build the pool. No sockets are opened until the first call.
    pub fn new(config: PoolConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.keep_alive)
            .tcp_keepalive(config.keep_alive)
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("encore-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Fatal {
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        tracing::debug!(
            max_idle_per_host = config.max_idle_per_host,
            keep_alive_secs = config.keep_alive.as_secs(),
            "Connection pool ready"
        );

        Ok(Self {
            client: RwLock::new(Some(client)),
            config,
        })
    }

    /// A transport-capable handle sharing the pool's sockets.
    pub fn handle(&self) -> GatewayResult<Client> {
        match self.client.read() {
            Ok(guard) => guard.clone().ok_or_else(|| TransportError::Closed.into()),
            Err(_) => Err(TransportError::Closed.into()),
        }
    }

    /// Drop the pool's handle. Later calls to `handle` fail with `Closed`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.client.write() {
            if guard.take().is_some() {
                tracing::info!("Connection pool closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client.read().map(|guard| guard.is_none()).unwrap_or(true)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}
