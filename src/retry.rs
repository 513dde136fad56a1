use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, TransportErrorKind};
use crate::handler::AsyncHandler;
use crate::lifecycle::RequestLifecycle;
use crate::metrics::ClientMetrics;

const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Clone, Debug)]
pub struct ReplayDecision {
    pub retry: u32,
    pub max_retries: u32,
    pub method: Method,
    pub uri: String,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub connection_open: bool,
    pub secure: bool,
}

/// Consulted before the built-in replay rules; returning `false` makes the
/// failure final.
pub trait ReplayClassifier: Send + Sync {
    fn should_replay(&self, decision: &ReplayDecision) -> bool;
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    replay_classifier: Option<Arc<dyn ReplayClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field("replay_classifier", &self.replay_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self::standard().max_retries(0)
    }

    /// Five immediate replays on transport failures.
    pub fn standard() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter_ratio: 0.0,
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            replay_classifier: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn replay_classifier(mut self, replay_classifier: Arc<dyn ReplayClassifier>) -> Self {
        self.replay_classifier = Some(replay_classifier);
        self
    }

    pub fn configured_max_retries(&self) -> u32 {
        self.max_retries
    }

    fn is_retryable(&self, error: &Error) -> bool {
        error
            .transport_kind()
            .is_some_and(|kind| self.retryable_transport_error_kinds.contains(&kind))
    }

    pub(crate) fn backoff_for_retry(&self, retry_index: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let capped_exponent = retry_index.saturating_sub(1).min(31);
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let sampled_ms = rand::rng()
            .random_range(low..=high)
            .min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Connect,
        TransportErrorKind::Write,
        TransportErrorKind::Read,
        TransportErrorKind::RemotelyClosed,
        TransportErrorKind::Other,
    ]
    .into_iter()
    .collect()
}

/// What the sender knows about the attempt that just failed.
#[derive(Clone, Debug)]
pub(crate) struct AttemptContext<'a> {
    pub(crate) method: &'a Method,
    pub(crate) uri: &'a str,
    pub(crate) secure: bool,
    pub(crate) body_replayable: bool,
    pub(crate) client_closed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReplayOutcome {
    Replay { delay: Duration },
    Final,
}

pub(crate) struct RetryCoordinator {
    policy: RetryPolicy,
    metrics: ClientMetrics,
}

impl RetryCoordinator {
    pub(crate) fn new(policy: RetryPolicy, metrics: ClientMetrics) -> Self {
        Self { policy, metrics }
    }

    /// Replay needs a live request with retries left, no authentication
    /// handshake in progress, a body that can be sent again, and either a
    /// dead connection or a TLS scheme.
    pub(crate) fn can_be_replayed<H: AsyncHandler>(
        &self,
        lifecycle: &RequestLifecycle<H>,
        attempt: &AttemptContext<'_>,
    ) -> bool {
        !lifecycle.is_done()
            && lifecycle.can_retry()
            && !lifecycle.is_in_auth()
            && (!lifecycle.connection_is_open() || attempt.secure)
            && attempt.body_replayable
    }

    /// Either re-arms the lifecycle for another attempt, or delivers `error`
    /// as its final outcome.
    pub(crate) fn on_failure<H: AsyncHandler>(
        &self,
        lifecycle: &RequestLifecycle<H>,
        attempt: &AttemptContext<'_>,
        error: Error,
    ) -> ReplayOutcome {
        let decision = ReplayDecision {
            retry: lifecycle.retries() + 1,
            max_retries: self.policy.max_retries,
            method: attempt.method.clone(),
            uri: attempt.uri.to_owned(),
            transport_error_kind: error.transport_kind(),
            connection_open: lifecycle.connection_is_open(),
            secure: attempt.secure,
        };
        let classified = match &self.policy.replay_classifier {
            Some(classifier) => classifier.should_replay(&decision),
            None => self.policy.is_retryable(&error),
        };
        let replay = classified
            && !attempt.client_closed
            && self.can_be_replayed(lifecycle, attempt)
            && lifecycle.try_acquire_retry();
        if !replay {
            debug!(
                method = %attempt.method,
                uri = attempt.uri,
                retries = lifecycle.retries(),
                error = %error,
                "request failure is final"
            );
            lifecycle.abort(error);
            return ReplayOutcome::Final;
        }

        if let Some(connection) = lifecycle.take_connection() {
            connection.close();
        }
        lifecycle.handler().on_retry();
        self.metrics.record_retry();
        let retry = lifecycle.retries();
        let delay = self.policy.backoff_for_retry(retry);
        warn!(
            method = %attempt.method,
            uri = attempt.uri,
            retry,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "replaying request on a fresh connection"
        );
        ReplayOutcome::Replay { delay }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::connection::{Connection, PooledConnection};
    use crate::partition::{PartitionKey, Scheme};
    use crate::test_support::{CountingHandler, MockConnection};

    static GET: Method = Method::GET;

    fn reset() -> Error {
        Error::transport(
            TransportErrorKind::Write,
            "example.com:80",
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        )
    }

    fn attempt(secure: bool) -> AttemptContext<'static> {
        AttemptContext {
            method: &GET,
            uri: "http://example.com/",
            secure,
            body_replayable: true,
            client_closed: false,
        }
    }

    fn lifecycle(max_retries: u32) -> Arc<RequestLifecycle<CountingHandler>> {
        RequestLifecycle::new(CountingHandler::new(1), max_retries, ClientMetrics::default())
    }

    fn attach_open_connection(
        lifecycle: &RequestLifecycle<CountingHandler>,
    ) -> Arc<MockConnection> {
        let mock = MockConnection::new(false);
        lifecycle
            .attach(PooledConnection::new(
                Arc::clone(&mock) as Arc<dyn Connection>,
                PartitionKey::new(Scheme::Http, "example.com", 80),
            ))
            .expect("attach");
        mock
    }

    #[tokio::test]
    async fn two_retries_then_final_failure() {
        let coordinator = RetryCoordinator::new(
            RetryPolicy::standard().max_retries(2),
            ClientMetrics::default(),
        );
        let lifecycle = lifecycle(2);
        let outcomes: Vec<_> = (0..3)
            .map(|_| coordinator.on_failure(&lifecycle, &attempt(false), reset()))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ReplayOutcome::Replay { delay: Duration::ZERO },
                ReplayOutcome::Replay { delay: Duration::ZERO },
                ReplayOutcome::Final,
            ]
        );
        assert_eq!(
            lifecycle
                .handler()
                .retries
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
        assert!(lifecycle.is_done());
    }

    #[tokio::test]
    async fn open_plain_connection_blocks_replay() {
        let coordinator = RetryCoordinator::new(RetryPolicy::standard(), ClientMetrics::default());
        let lifecycle = lifecycle(5);
        let mock = attach_open_connection(&lifecycle);
        assert!(!coordinator.can_be_replayed(&lifecycle, &attempt(false)));
        assert!(coordinator.can_be_replayed(&lifecycle, &attempt(true)));

        assert_eq!(
            coordinator.on_failure(&lifecycle, &attempt(false), reset()),
            ReplayOutcome::Final
        );
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn auth_in_progress_blocks_replay() {
        let coordinator = RetryCoordinator::new(RetryPolicy::standard(), ClientMetrics::default());
        let lifecycle = lifecycle(5);
        lifecycle.set_in_proxy_auth(true);
        assert!(!coordinator.can_be_replayed(&lifecycle, &attempt(false)));
    }

    #[tokio::test]
    async fn started_streaming_body_is_not_replayed() {
        let coordinator = RetryCoordinator::new(RetryPolicy::standard(), ClientMetrics::default());
        let lifecycle = lifecycle(5);
        let attempt = AttemptContext {
            body_replayable: false,
            ..attempt(false)
        };
        assert_eq!(
            coordinator.on_failure(&lifecycle, &attempt, reset()),
            ReplayOutcome::Final
        );
    }

    #[tokio::test]
    async fn non_transport_errors_are_final() {
        let coordinator = RetryCoordinator::new(RetryPolicy::standard(), ClientMetrics::default());
        let lifecycle = lifecycle(5);
        let outcome = coordinator.on_failure(
            &lifecycle,
            &attempt(false),
            Error::TooManyConnections { limit: 1 },
        );
        assert_eq!(outcome, ReplayOutcome::Final);
        assert_eq!(lifecycle.retries(), 0);
    }

    #[tokio::test]
    async fn classifier_can_veto_replay() {
        struct NeverOnRead;
        impl ReplayClassifier for NeverOnRead {
            fn should_replay(&self, decision: &ReplayDecision) -> bool {
                decision.transport_error_kind != Some(TransportErrorKind::Read)
            }
        }

        let policy = RetryPolicy::standard().replay_classifier(Arc::new(NeverOnRead));
        let coordinator = RetryCoordinator::new(policy, ClientMetrics::default());
        let read_error = Error::transport(TransportErrorKind::Read, "example.com:80", "eof");
        assert_eq!(
            coordinator.on_failure(&lifecycle(5), &attempt(false), read_error),
            ReplayOutcome::Final
        );
        assert!(matches!(
            coordinator.on_failure(&lifecycle(5), &attempt(false), reset()),
            ReplayOutcome::Replay { .. }
        ));
    }

    #[test]
    fn jittered_backoff_never_exceeds_configured_max_backoff() {
        let policy = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(120))
            .jitter_ratio(1.0);

        for _ in 0..256 {
            let backoff = policy.backoff_for_retry(3);
            assert!(backoff <= Duration::from_millis(120));
        }
    }

    #[test]
    fn backoff_grows_exponentially_until_capped() {
        let policy = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_millis(35));
        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for_retry(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for_retry(3), Duration::from_millis(35));
        assert_eq!(RetryPolicy::standard().backoff_for_retry(4), Duration::ZERO);
    }
}
