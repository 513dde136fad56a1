use std::sync::Arc;
use std::time::Duration;

use http::Method;

use crate::Result;
use crate::config::{ClientConfig, ClientProfile};
use crate::connection::Transport;
use crate::handler::AsyncHandler;
use crate::lifecycle::ResponseFuture;
use crate::metrics::ClientMetricsSnapshot;
use crate::pool::ConnectionPool;
use crate::request::{Request, RequestBuilder};
use crate::retry::RetryPolicy;
use crate::sender::RequestSender;
use crate::transport::TcpTransport;

pub struct HttpClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl HttpClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            transport: None,
        }
    }

    /// Replaces the whole configuration, including earlier builder calls.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let client_name = std::mem::take(&mut self.config.client_name);
        self.config = profile.config().with_client_name(client_name);
        self
    }

    pub fn transport<T: Transport>(self, transport: T) -> Self {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.config.client_name = client_name.into();
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = Some(max_connections);
        self
    }

    pub fn max_connections_per_host(mut self, max_connections_per_host: usize) -> Self {
        self.config.max_connections_per_host = Some(max_connections_per_host);
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = Some(request_timeout);
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.config.read_timeout = Some(read_timeout);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.config.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn pooled_connection_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.pooled_connection_idle_timeout = Some(idle_timeout);
        self
    }

    pub fn connection_ttl(mut self, connection_ttl: Duration) -> Self {
        self.config.connection_ttl = Some(connection_ttl);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> Result<HttpClient> {
        self.config.validate()?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new()));
        Ok(HttpClient {
            sender: Arc::new(RequestSender::new(self.config, transport)),
        })
    }

    #[track_caller]
    pub fn build(self) -> HttpClient {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqflow http client: {error}; use try_build() to handle configuration errors")
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point of the engine. Cheap to clone; clones share the connection
/// pool, the limits and the metrics.
#[derive(Clone)]
pub struct HttpClient {
    sender: Arc<RequestSender>,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    pub fn request(&self, method: Method, uri: impl Into<String>) -> RequestBuilder {
        Request::builder(method, uri)
    }

    pub fn get(&self, uri: impl Into<String>) -> RequestBuilder {
        Request::get(uri)
    }

    pub fn post(&self, uri: impl Into<String>) -> RequestBuilder {
        Request::post(uri)
    }

    /// Starts executing `request` in the background and returns its handle.
    ///
    /// Must be called from within a tokio runtime. Submission never fails
    /// synchronously: every error, including an invalid request or a closed
    /// client, is delivered through the returned [`ResponseFuture`].
    pub fn submit<H: AsyncHandler>(&self, request: Request, handler: H) -> ResponseFuture<H> {
        self.sender.submit(request, handler)
    }

    pub fn config(&self) -> &ClientConfig {
        self.sender.config()
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.sender.pool()
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.sender.metrics().snapshot()
    }

    /// Closes every pooled connection and fails later submissions with
    /// [`crate::Error::Closed`]. Returns whether this call closed the client.
    pub fn close(&self) -> bool {
        self.sender.close()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("client_name", &self.config().client_name)
            .field("closed", &self.is_closed())
            .field("pool", self.pool())
            .finish()
    }
}
