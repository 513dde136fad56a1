//! `reqflow` is the request engine of an asynchronous HTTP/1.1 client: a
//! partitioned connection pool, per-request timeouts, an exactly-once request
//! lifecycle, transparent replay of requests lost to dead connections, and
//! push-style streaming request bodies.
//!
//! The engine does not parse responses. An [`AsyncHandler`] receives the raw
//! response bytes and decides when the exchange is complete.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{BytesHandler, HttpClient, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .client_name("my-sdk")
//!         .request_timeout(Duration::from_secs(8))
//!         .read_timeout(Duration::from_secs(3))
//!         .retry_policy(RetryPolicy::standard().max_retries(2))
//!         .try_build()?;
//!
//!     let request = client
//!         .get("http://127.0.0.1:8080/health")
//!         .try_header("accept", "text/plain")?
//!         .build()?;
//!     let raw = client
//!         .submit(request, BytesHandler::new())
//!         .get_timeout(Duration::from_secs(10))
//!         .await?;
//!
//!     println!("received {} bytes", raw.len());
//!     Ok(())
//! }
//! ```
//!
//! # Streaming bodies
//!
//! ```no_run
//! use reqflow::prelude::{BytesHandler, HttpClient, Request, StreamingBodyFeeder};
//!
//! # async fn upload(client: HttpClient) -> reqflow::Result<()> {
//! let (feeder, body) = StreamingBodyFeeder::new();
//! let request = Request::post("http://127.0.0.1:8080/upload")
//!     .feed_body(body)
//!     .build()?;
//! let response = client.submit(request, BytesHandler::new());
//! feeder.feed("first part", false)?;
//! feeder.feed("last part", true)?;
//! response.get().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod feeder;
mod handler;
mod lifecycle;
mod limits;
mod metrics;
mod partition;
mod pool;
mod request;
mod retry;
mod sender;
mod timeout;
mod transport;
mod util;

#[cfg(test)]
mod test_support;

pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::config::{ClientConfig, ClientProfile, LeaseStrategy};
pub use crate::connection::{
    CloseCallback, CloseNotifier, CloseRegistration, Connection, ConnectionId, ConnectionIo,
    PooledConnection, Transport,
};
pub use crate::error::{BoxError, Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::feeder::{BodyRead, FeedListener, FeedableBody, StreamingBodyFeeder};
pub use crate::handler::{AsyncHandler, BytesHandler, HandlerState};
pub use crate::lifecycle::{Completion, RequestState, ResponseFuture};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::partition::{NoProxyRule, PartitionKey, ProxyIdentity, ProxyServer, Scheme};
pub use crate::pool::{ConnectionPool, PoolSettings};
pub use crate::request::{Request, RequestBody, RequestBuilder};
pub use crate::retry::{ReplayClassifier, ReplayDecision, RetryPolicy};
pub use crate::transport::TcpTransport;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AsyncHandler, BytesHandler, ClientConfig, ClientProfile, Error, ErrorCode, HandlerState,
        HttpClient, Request, ResponseFuture, RetryPolicy, StreamingBodyFeeder, TimeoutPhase,
        TransportErrorKind,
    };
}
