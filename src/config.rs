//! Client configuration.

use std::time::Duration;

use crate::error::DriverError;

/// How the executor picks a target server for each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStrategy {
    /// Stay pinned to the session's current node; only fall back to list
    /// selection when no node has been picked yet.
    #[default]
    Sticky,
    /// Rotate servers only when establishing a brand-new connection.
    RoundRobinConnect,
    /// Rotate servers on every request.
    RoundRobinRequest,
}

impl ConnectionStrategy {
    /// Parse a strategy name from configuration. Unknown names are a
    /// configuration error, not a silent default.
    pub fn parse(name: &str) -> Result<Self, DriverError> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "sticky" => Ok(Self::Sticky),
            "round-robin-connect" => Ok(Self::RoundRobinConnect),
            "round-robin-request" => Ok(Self::RoundRobinRequest),
            other => Err(DriverError::Config(format!(
                "unknown connection strategy '{other}'"
            ))),
        }
    }
}

/// Configuration for one remote storage and its sessions.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retry budget for network operations that allow retries.
    pub connection_retries: u32,
    /// Backoff between budgeted retries.
    pub retry_delay: Duration,
    /// Target-selection strategy.
    pub strategy: ConnectionStrategy,
    /// Enable TXT-record peer discovery when a single bootstrap host is given.
    pub dns_discovery: bool,
    /// Timeout for the discovery lookup.
    pub dns_timeout: Duration,
    /// Free connections unused longer than this are swept from the pool.
    pub idle_timeout: Duration,
    /// Maximum live connections per server address.
    pub pool_capacity: usize,
    /// How long `acquire` may wait for a free slot before giving up.
    pub acquire_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Timeout for subscribe acknowledgments and other bounded reads.
    pub request_timeout: Duration,
    /// Wait before retrying an operation rejected because the database is
    /// frozen.
    pub freeze_backoff: Duration,
    /// Default result-set page size.
    pub page_size: i32,
    /// Normalize bare hosts with the TLS default port instead of the plain
    /// one.
    pub use_ssl: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_retries: 5,
            retry_delay: Duration::from_millis(500),
            strategy: ConnectionStrategy::Sticky,
            dns_discovery: false,
            dns_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            pool_capacity: 8,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            freeze_backoff: Duration::from_secs(1),
            page_size: 100,
            use_ssl: false,
        }
    }
}

impl ClientConfig {
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.connection_retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_strategy(mut self, strategy: ConnectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_dns_discovery(mut self, enabled: bool) -> Self {
        self.dns_discovery = enabled;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = if page_size > 0 { page_size } else { 100 };
        self
    }
}
