use std::io;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{Instrument, debug, info_span, trace};

use crate::config::ClientConfig;
use crate::connection::{ConnectionIo, PooledConnection, Transport};
use crate::error::{Error, TransportErrorKind};
use crate::feeder::DEFAULT_PULL_SIZE;
use crate::handler::{AsyncHandler, HandlerState};
use crate::lifecycle::{RequestLifecycle, ResponseFuture};
use crate::limits::ConnectionLimits;
use crate::metrics::ClientMetrics;
use crate::partition::PartitionKey;
use crate::pool::{ConnectionPool, PoolSettings};
use crate::request::{Request, RequestBody};
use crate::retry::{AttemptContext, ReplayOutcome, RetryCoordinator};
use crate::timeout::{TimeoutTarget, TimeoutsHolder};
use crate::util::redact_uri_for_logs;

/// Drives requests from submission to their terminal outcome: acquires a
/// connection, writes the request, feeds response parts to the handler and
/// loops back through the retry coordinator on failure.
pub(crate) struct RequestSender {
    config: ClientConfig,
    pool: ConnectionPool,
    limits: ConnectionLimits,
    transport: Arc<dyn Transport>,
    retry: RetryCoordinator,
    metrics: ClientMetrics,
    closed: AtomicBool,
}

impl RequestSender {
    pub(crate) fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let metrics = ClientMetrics::new(config.metrics_enabled);
        let pool = ConnectionPool::with_metrics(PoolSettings::from_config(&config), metrics.clone());
        let limits = ConnectionLimits::new(config.max_connections, config.max_connections_per_host);
        let retry = RetryCoordinator::new(config.retry_policy.clone(), metrics.clone());
        Self {
            config,
            pool,
            limits,
            transport,
            retry,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting requests and closes every pooled connection. Requests
    /// already in flight run to completion but are never replayed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.pool.destroy();
        true
    }

    pub(crate) fn submit<H: AsyncHandler>(
        self: &Arc<Self>,
        request: Request,
        handler: H,
    ) -> ResponseFuture<H> {
        let lifecycle = RequestLifecycle::new(
            handler,
            self.config.retry_policy.configured_max_retries(),
            self.metrics.clone(),
        );
        lifecycle.set_in_auth(request.is_in_auth());
        lifecycle.set_in_proxy_auth(request.is_in_proxy_auth());
        let future = ResponseFuture::new(Arc::clone(&lifecycle));

        if self.is_closed() {
            lifecycle.fail(Error::Closed);
            return future;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            lifecycle.fail(Error::InvalidConfig {
                message: "requests must be submitted from within a tokio runtime",
            });
            return future;
        };
        let key = match request.partition_key() {
            Ok(key) => key,
            Err(error) => {
                lifecycle.fail(error);
                return future;
            }
        };
        if let Err(error) = request.apply_body_framing(self.config.chunked_framing) {
            lifecycle.fail(error);
            return future;
        }

        let weak: Weak<RequestLifecycle<H>> = Arc::downgrade(&lifecycle);
        let target: Weak<dyn TimeoutTarget> = weak;
        let timeouts = TimeoutsHolder::new(
            target,
            TimeoutTarget::started_at(&*lifecycle),
            request.request_timeout(self.config.request_timeout),
            request.read_timeout(self.config.read_timeout),
            key.remote_label(),
        );
        lifecycle.set_timeouts(Arc::clone(&timeouts));
        timeouts.start_request_timeout();

        let sender = Arc::clone(self);
        runtime.spawn(async move {
            sender.drive(lifecycle, request, key).await;
        });
        future
    }

    async fn drive<H: AsyncHandler>(
        &self,
        lifecycle: Arc<RequestLifecycle<H>>,
        request: Request,
        key: PartitionKey,
    ) {
        let uri = redact_uri_for_logs(request.uri());
        while !lifecycle.is_done() {
            let span = info_span!(
                "reqflow.request",
                client = %self.config.client_name,
                method = %request.method(),
                partition = %key,
                attempt = lifecycle.retries() + 1,
            );
            let result = async {
                tokio::select! {
                    biased;
                    () = lifecycle.terminated() => Ok(()),
                    result = self.attempt(&lifecycle, &request, &key) => result,
                }
            }
            .instrument(span)
            .await;

            let Err(error) = result else {
                break;
            };
            let attempt = AttemptContext {
                method: request.method(),
                uri: &uri,
                secure: key.is_secure(),
                body_replayable: request.is_body_replayable(),
                client_closed: self.is_closed(),
            };
            match self.retry.on_failure(&lifecycle, &attempt, error) {
                ReplayOutcome::Final => break,
                ReplayOutcome::Replay { delay } => {
                    if !wait_before_replay(&lifecycle, delay).await {
                        break;
                    }
                }
            }
        }
        if let Some(connection) = lifecycle.take_connection() {
            connection.close();
        }
    }

    async fn attempt<H: AsyncHandler>(
        &self,
        lifecycle: &Arc<RequestLifecycle<H>>,
        request: &Request,
        key: &PartitionKey,
    ) -> Result<(), Error> {
        let connection = self.acquire(lifecycle, key).await?;
        let io = connection.io();
        if let Err(refused) = lifecycle.attach(connection) {
            drop(io);
            refused.close();
            return Ok(());
        }
        let keep_alive = self.config.keep_alive && lifecycle.handler().keep_alive();
        let reusable = self.exchange(lifecycle, request, key, io, keep_alive).await?;
        self.release(lifecycle, reusable);
        Ok(())
    }

    async fn acquire<H: AsyncHandler>(
        &self,
        lifecycle: &RequestLifecycle<H>,
        key: &PartitionKey,
    ) -> Result<PooledConnection, Error> {
        if let Some(connection) = self.pool.poll(key) {
            self.metrics.record_connection_reused();
            lifecycle.handler().on_connection_pooled(connection.id());
            trace!(connection = %connection.id(), "reusing pooled connection");
            return Ok(connection);
        }

        let permits = self.limits.try_acquire(key)?;
        let open = self.transport.open(key);
        let opened = match self.config.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, open).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            },
            None => open.await,
        };
        let io = opened.map_err(|source| {
            let kind = if key.is_secure() && source.kind() == io::ErrorKind::Unsupported {
                TransportErrorKind::Tls
            } else {
                TransportErrorKind::Connect
            };
            Error::transport(kind, key.remote_label(), source)
        })?;
        self.metrics.record_connection_opened();
        debug!(connection = %io.id(), "opened connection");
        Ok(PooledConnection::with_permits(io, key.clone(), permits))
    }

    /// Writes the request and feeds the response to the handler until it
    /// reports completion. Returns whether the connection may be reused.
    async fn exchange<H: AsyncHandler>(
        &self,
        lifecycle: &RequestLifecycle<H>,
        request: &Request,
        key: &PartitionKey,
        io: ConnectionIo,
        keep_alive: bool,
    ) -> Result<bool, Error> {
        let remote = key.remote_label();
        let write_error =
            |source: io::Error| Error::transport(TransportErrorKind::Write, remote.clone(), source);

        let head = request.encode_head(key, keep_alive);
        io.write(head).await.map_err(write_error)?;
        lifecycle.touch();
        match request.body() {
            RequestBody::Empty => {}
            RequestBody::Buffered(bytes) => {
                if !bytes.is_empty() {
                    io.write(bytes.clone()).await.map_err(write_error)?;
                    lifecycle.touch();
                }
            }
            RequestBody::Feed(body) => {
                while let Some(chunk) = body.next_chunk(DEFAULT_PULL_SIZE).await {
                    io.write(chunk).await.map_err(write_error)?;
                    lifecycle.touch();
                }
            }
        }
        lifecycle.handler().on_request_sent();
        if let Some(timeouts) = lifecycle.timeouts() {
            timeouts.start_read_timeout();
        }

        let mut received = false;
        loop {
            let part = io
                .read()
                .await
                .map_err(|source| Error::transport(TransportErrorKind::Read, remote.clone(), source))?;
            let Some(part) = part else {
                if !received {
                    return Err(Error::transport(
                        TransportErrorKind::RemotelyClosed,
                        remote,
                        "connection closed before any response byte",
                    ));
                }
                // Close-delimited response.
                self.finish(lifecycle)?;
                return Ok(false);
            };
            lifecycle.touch();
            received |= !part.is_empty();
            match lifecycle.handler().on_body_part(&part).map_err(Error::handler)? {
                HandlerState::Continue => {}
                HandlerState::Complete => {
                    self.finish(lifecycle)?;
                    return Ok(keep_alive);
                }
                HandlerState::Abort => {
                    io.close();
                    self.finish(lifecycle)?;
                    return Ok(false);
                }
            }
        }
    }

    fn finish<H: AsyncHandler>(&self, lifecycle: &RequestLifecycle<H>) -> Result<(), Error> {
        let output = lifecycle.handler().on_completed().map_err(Error::handler)?;
        lifecycle.complete(output);
        Ok(())
    }

    /// Hands the connection of a completed exchange back to the pool, or
    /// closes it.
    fn release<H: AsyncHandler>(&self, lifecycle: &RequestLifecycle<H>, reusable: bool) {
        let Some(connection) = lifecycle.take_connection() else {
            return;
        };
        if !reusable || !connection.is_open() || self.is_closed() {
            connection.close();
            return;
        }
        lifecycle.handler().on_connection_offer(connection.id());
        if let Err(refused) = self.pool.offer(connection) {
            trace!(connection = %refused.id(), "pool refused connection");
            refused.close();
        }
    }
}

/// Waits out the replay backoff on the request's retry timer. Returns false
/// when the request settled in the meantime.
async fn wait_before_replay<H: AsyncHandler>(lifecycle: &RequestLifecycle<H>, delay: Duration) -> bool {
    let timeouts = lifecycle.timeouts();
    if let Some(timeouts) = &timeouts {
        timeouts.stop_read_timeout();
    }
    if delay.is_zero() {
        return !lifecycle.is_done();
    }
    let Some(timeouts) = timeouts else {
        tokio::time::sleep(delay).await;
        return !lifecycle.is_done();
    };
    let elapsed = timeouts.schedule_retry(delay);
    tokio::select! {
        biased;
        () = lifecycle.terminated() => false,
        fired = elapsed => fired.is_ok() && !lifecycle.is_done(),
    }
}
