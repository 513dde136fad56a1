use std::time::Duration;

use crate::error::Error;
use crate::retry::RetryPolicy;

const DEFAULT_POOLED_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONNECTION_POOL_CLEANER_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CLIENT_NAME: &str = "reqflow";

/// Order in which idle connections of one partition are handed out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeaseStrategy {
    /// Most recently offered first; keeps a hot subset of connections busy.
    #[default]
    Lifo,
    /// Oldest first; spreads use across every idle connection.
    Fifo,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    Standard,
    LowLatency,
    HighThroughput,
}

impl ClientProfile {
    pub fn config(self) -> ClientConfig {
        match self {
            Self::Standard => ClientConfig::default(),
            Self::LowLatency => ClientConfig::default()
                .with_request_timeout(Duration::from_secs(5))
                .with_read_timeout(Duration::from_secs(2))
                .with_connect_timeout(Duration::from_secs(1))
                .with_retry_policy(RetryPolicy::standard().max_retries(1))
                .with_pooled_connection_idle_timeout(Duration::from_secs(30)),
            Self::HighThroughput => ClientConfig::default()
                .with_request_timeout(Duration::from_secs(120))
                .with_read_timeout(Duration::from_secs(30))
                .with_retry_policy(
                    RetryPolicy::standard()
                        .max_retries(3)
                        .base_backoff(Duration::from_millis(50))
                        .max_backoff(Duration::from_millis(500)),
                )
                .with_pooled_connection_idle_timeout(Duration::from_secs(120))
                .with_lease_strategy(LeaseStrategy::Fifo),
        }
    }
}

/// Engine configuration. Read-only once an [`HttpClient`](crate::HttpClient) is built.
///
/// `None` on a duration disables that dimension entirely (no timer, no eviction).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub max_connections: Option<usize>,
    pub max_connections_per_host: Option<usize>,
    pub pooled_connection_idle_timeout: Option<Duration>,
    pub connection_ttl: Option<Duration>,
    pub connection_pool_cleaner_period: Duration,
    pub request_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub keep_alive: bool,
    pub ssl_connection_pool_enabled: bool,
    pub chunked_framing: bool,
    pub lease_strategy: LeaseStrategy,
    pub metrics_enabled: bool,
    pub client_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_connections_per_host: None,
            pooled_connection_idle_timeout: Some(DEFAULT_POOLED_CONNECTION_IDLE_TIMEOUT),
            connection_ttl: None,
            connection_pool_cleaner_period: DEFAULT_CONNECTION_POOL_CLEANER_PERIOD,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            retry_policy: RetryPolicy::standard(),
            keep_alive: true,
            ssl_connection_pool_enabled: true,
            chunked_framing: true,
            lease_strategy: LeaseStrategy::Lifo,
            metrics_enabled: false,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    pub fn with_max_connections_per_host(mut self, max_connections_per_host: usize) -> Self {
        self.max_connections_per_host = Some(max_connections_per_host);
        self
    }

    pub fn with_pooled_connection_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.pooled_connection_idle_timeout = Some(idle_timeout);
        self
    }

    pub fn without_pooled_connection_idle_timeout(mut self) -> Self {
        self.pooled_connection_idle_timeout = None;
        self
    }

    pub fn with_connection_ttl(mut self, connection_ttl: Duration) -> Self {
        self.connection_ttl = Some(connection_ttl);
        self
    }

    pub fn with_connection_pool_cleaner_period(mut self, period: Duration) -> Self {
        self.connection_pool_cleaner_period = period;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub fn without_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    pub fn without_read_timeout(mut self) -> Self {
        self.read_timeout = None;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry_policy = self.retry_policy.max_retries(max_retries);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_ssl_connection_pool_enabled(mut self, enabled: bool) -> Self {
        self.ssl_connection_pool_enabled = enabled;
        self
    }

    pub fn with_chunked_framing(mut self, chunked_framing: bool) -> Self {
        self.chunked_framing = chunked_framing;
        self
    }

    pub fn with_lease_strategy(mut self, lease_strategy: LeaseStrategy) -> Self {
        self.lease_strategy = lease_strategy;
        self
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Period of the background eviction sweep, or `None` when neither TTL
    /// nor idle eviction is enabled.
    pub(crate) fn cleaner_period(&self) -> Option<Duration> {
        let enabled = [self.connection_ttl, self.pooled_connection_idle_timeout]
            .into_iter()
            .flatten()
            .min()?;
        Some(
            enabled
                .min(self.connection_pool_cleaner_period)
                .max(Duration::from_millis(1)),
        )
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == Some(0) {
            return Err(Error::InvalidConfig {
                message: "max_connections must be >= 1",
            });
        }
        if self.max_connections_per_host == Some(0) {
            return Err(Error::InvalidConfig {
                message: "max_connections_per_host must be >= 1",
            });
        }
        if let (Some(global), Some(per_host)) =
            (self.max_connections, self.max_connections_per_host)
            && per_host > global
        {
            return Err(Error::InvalidConfig {
                message: "max_connections_per_host must be <= max_connections",
            });
        }
        let zero_durations = [
            self.pooled_connection_idle_timeout,
            self.connection_ttl,
            self.request_timeout,
            self.read_timeout,
            self.connect_timeout,
        ];
        if zero_durations.into_iter().flatten().any(|value| value.is_zero()) {
            return Err(Error::InvalidConfig {
                message: "timeouts must be non-zero; use None to disable",
            });
        }
        if self.connection_pool_cleaner_period.is_zero() {
            return Err(Error::InvalidConfig {
                message: "connection_pool_cleaner_period must be non-zero",
            });
        }
        Ok(())
    }
}
