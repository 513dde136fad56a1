//! The per-request state machine and the caller's handle to it.
//!
//! Every terminal transition (`complete`, `fail`, `abort`, `cancel`) goes
//! through one compare-and-set on the state word. The winner stores the
//! outcome, cancels the timers, wakes waiters and runs listeners; every other
//! caller observes `false` and does nothing.

use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::connection::PooledConnection;
use crate::error::Error;
use crate::handler::AsyncHandler;
use crate::metrics::{ClientMetrics, InFlightGuard};
use crate::timeout::{TimeoutTarget, TimeoutsHolder};
use crate::util::lock_unpoisoned;

const STATE_NEW: u8 = 0;
const STATE_IN_FLIGHT: u8 = 1;
const STATE_DONE: u8 = 2;
const STATE_CANCELLED: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    New,
    InFlight,
    Done,
    Cancelled,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_NEW => Self::New,
            STATE_IN_FLIGHT => Self::InFlight,
            STATE_DONE => Self::Done,
            _ => Self::Cancelled,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Terminal outcome handed to completion listeners.
#[derive(Clone, Debug)]
pub enum Completion {
    Succeeded,
    Failed(Error),
    Cancelled,
}

type Listener = Box<dyn FnOnce(&Completion) + Send + 'static>;

pub(crate) struct RequestLifecycle<H: AsyncHandler> {
    handler: H,
    state: AtomicU8,
    outcome: Mutex<Option<Result<H::Output, Error>>>,
    settled: Condvar,
    notify: Notify,
    handler_notified: AtomicBool,
    started_at: Instant,
    last_touch_nanos: AtomicU64,
    retries: AtomicU32,
    max_retries: u32,
    connection: Mutex<Option<PooledConnection>>,
    timeouts: Mutex<Option<Arc<TimeoutsHolder>>>,
    in_auth: AtomicBool,
    in_proxy_auth: AtomicBool,
    listeners: Mutex<Option<Vec<Listener>>>,
    metrics: ClientMetrics,
    in_flight: Mutex<Option<InFlightGuard>>,
}

impl<H: AsyncHandler> RequestLifecycle<H> {
    pub(crate) fn new(handler: H, max_retries: u32, metrics: ClientMetrics) -> Arc<Self> {
        metrics.record_request_started();
        let in_flight = metrics.enter_in_flight();
        Arc::new(Self {
            handler,
            state: AtomicU8::new(STATE_NEW),
            outcome: Mutex::new(None),
            settled: Condvar::new(),
            notify: Notify::new(),
            handler_notified: AtomicBool::new(false),
            started_at: Instant::now(),
            last_touch_nanos: AtomicU64::new(0),
            retries: AtomicU32::new(0),
            max_retries,
            connection: Mutex::new(None),
            timeouts: Mutex::new(None),
            in_auth: AtomicBool::new(false),
            in_proxy_auth: AtomicBool::new(false),
            listeners: Mutex::new(Some(Vec::new())),
            metrics,
            in_flight: Mutex::new(Some(in_flight)),
        })
    }

    pub(crate) fn handler(&self) -> &H {
        &self.handler
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    pub(crate) fn set_timeouts(&self, timeouts: Arc<TimeoutsHolder>) {
        let mut slot = lock_unpoisoned(&self.timeouts);
        if self.is_done() {
            timeouts.cancel();
        }
        *slot = Some(timeouts);
    }

    pub(crate) fn timeouts(&self) -> Option<Arc<TimeoutsHolder>> {
        lock_unpoisoned(&self.timeouts).clone()
    }

    pub(crate) fn cancel_timeouts(&self) {
        if let Some(timeouts) = self.timeouts() {
            timeouts.cancel();
        }
    }

    /// Attaches the connection serving the current attempt. A settled
    /// lifecycle refuses it and hands it back.
    pub(crate) fn attach(&self, connection: PooledConnection) -> Result<(), PooledConnection> {
        let mut slot = lock_unpoisoned(&self.connection);
        if self.is_done() {
            return Err(connection);
        }
        let _ = self.state.compare_exchange(
            STATE_NEW,
            STATE_IN_FLIGHT,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if let Some(previous) = slot.replace(connection) {
            previous.close();
        }
        Ok(())
    }

    pub(crate) fn take_connection(&self) -> Option<PooledConnection> {
        lock_unpoisoned(&self.connection).take()
    }

    pub(crate) fn connection_is_open(&self) -> bool {
        lock_unpoisoned(&self.connection)
            .as_ref()
            .is_some_and(PooledConnection::is_open)
    }

    pub(crate) fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.started_at);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.last_touch_nanos.fetch_max(nanos, Ordering::AcqRel);
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    pub(crate) fn can_retry(&self) -> bool {
        self.retries() < self.max_retries
    }

    /// Consumes one retry. Concurrent callers never take more than the budget.
    pub(crate) fn try_acquire_retry(&self) -> bool {
        self.retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |retries| {
                (retries < self.max_retries).then_some(retries + 1)
            })
            .is_ok()
    }

    pub(crate) fn set_in_auth(&self, in_auth: bool) {
        self.in_auth.store(in_auth, Ordering::Release);
    }

    pub(crate) fn set_in_proxy_auth(&self, in_proxy_auth: bool) {
        self.in_proxy_auth.store(in_proxy_auth, Ordering::Release);
    }

    pub(crate) fn is_in_auth(&self) -> bool {
        self.in_auth.load(Ordering::Acquire) || self.in_proxy_auth.load(Ordering::Acquire)
    }

    pub(crate) fn complete(&self, output: H::Output) -> bool {
        self.settle(STATE_DONE, Ok(output), false)
    }

    pub(crate) fn fail(&self, error: Error) -> bool {
        self.settle(STATE_DONE, Err(error), false)
    }

    /// Fails the request and closes its connection.
    pub(crate) fn abort(&self, error: Error) -> bool {
        self.settle(STATE_DONE, Err(error), true)
    }

    pub(crate) fn cancel(&self) -> bool {
        self.settle(STATE_CANCELLED, Err(Error::Cancelled), true)
    }

    fn settle(&self, terminal: u8, outcome: Result<H::Output, Error>, close: bool) -> bool {
        let won = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                matches!(current, STATE_NEW | STATE_IN_FLIGHT).then_some(terminal)
            })
            .is_ok();
        if !won {
            return false;
        }
        self.cancel_timeouts();
        if close && let Some(connection) = self.take_connection() {
            connection.close();
        }

        let completion = match &outcome {
            Ok(_) => Completion::Succeeded,
            Err(Error::Cancelled) if terminal == STATE_CANCELLED => Completion::Cancelled,
            Err(error) => Completion::Failed(error.clone()),
        };
        if let Err(error) = &outcome
            && !self.handler_notified.swap(true, Ordering::AcqRel)
        {
            self.handler.on_throwable(error);
        }
        self.metrics
            .record_request_completed(&outcome, self.started_at.elapsed());
        lock_unpoisoned(&self.in_flight).take();

        *lock_unpoisoned(&self.outcome) = Some(outcome);
        self.settled.notify_all();
        self.notify.notify_waiters();

        let listeners = lock_unpoisoned(&self.listeners).take().unwrap_or_default();
        for listener in listeners {
            listener(&completion);
        }
        true
    }

    pub(crate) fn add_listener(&self, listener: Listener) {
        {
            let mut listeners = lock_unpoisoned(&self.listeners);
            if let Some(pending) = listeners.as_mut() {
                pending.push(listener);
                return;
            }
        }
        if let Some(completion) = self.completion() {
            listener(&completion);
        }
    }

    fn completion(&self) -> Option<Completion> {
        let outcome = lock_unpoisoned(&self.outcome);
        Some(match outcome.as_ref()? {
            Ok(_) => Completion::Succeeded,
            Err(Error::Cancelled) if self.is_cancelled() => Completion::Cancelled,
            Err(error) => Completion::Failed(error.clone()),
        })
    }

    fn try_outcome(&self) -> Option<Result<H::Output, Error>> {
        lock_unpoisoned(&self.outcome).clone()
    }

    /// Resolves once a terminal outcome has been stored.
    pub(crate) async fn outcome(&self) -> Result<H::Output, Error> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    pub(crate) async fn terminated(&self) {
        let _ = self.outcome().await;
    }

    pub(crate) fn blocking_outcome(&self, timeout: Option<Duration>) -> Result<H::Output, Error> {
        let deadline = timeout.map(|timeout| std::time::Instant::now() + timeout);
        let mut outcome = lock_unpoisoned(&self.outcome);
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            outcome = match deadline {
                None => self
                    .settled
                    .wait(outcome)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        return Err(wait_timeout(timeout));
                    }
                    self.settled
                        .wait_timeout(outcome, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

impl<H: AsyncHandler> TimeoutTarget for RequestLifecycle<H> {
    fn is_done(&self) -> bool {
        RequestLifecycle::is_done(self)
    }

    fn started_at(&self) -> Instant {
        self.started_at
    }

    fn last_touch(&self) -> Instant {
        self.started_at + Duration::from_nanos(self.last_touch_nanos.load(Ordering::Acquire))
    }

    fn expire(&self, error: Error) {
        self.abort(error);
    }
}

fn wait_timeout(timeout: Option<Duration>) -> Error {
    Error::WaitTimeout {
        timeout_ms: timeout.unwrap_or_default().as_millis(),
    }
}

/// Caller handle for a submitted request.
///
/// Clones share the same request; every `get` returns the same outcome.
pub struct ResponseFuture<H: AsyncHandler> {
    lifecycle: Arc<RequestLifecycle<H>>,
}

impl<H: AsyncHandler> ResponseFuture<H> {
    pub(crate) fn new(lifecycle: Arc<RequestLifecycle<H>>) -> Self {
        Self { lifecycle }
    }

    /// Waits for the request to settle.
    pub async fn get(&self) -> crate::Result<H::Output> {
        self.lifecycle.outcome().await
    }

    /// Like [`get`](Self::get) but gives up after `timeout` with
    /// [`Error::WaitTimeout`]. Giving up does not affect the request.
    pub async fn get_timeout(&self, timeout: Duration) -> crate::Result<H::Output> {
        match tokio::time::timeout(timeout, self.lifecycle.outcome()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(wait_timeout(Some(timeout))),
        }
    }

    /// Blocks the current thread. Must not be called from an async task.
    pub fn blocking_get(&self) -> crate::Result<H::Output> {
        self.lifecycle.blocking_outcome(None)
    }

    pub fn blocking_get_timeout(&self, timeout: Duration) -> crate::Result<H::Output> {
        self.lifecycle.blocking_outcome(Some(timeout))
    }

    /// Cancels the request. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        self.lifecycle.cancel()
    }

    pub fn touch(&self) {
        self.lifecycle.touch();
    }

    pub fn state(&self) -> RequestState {
        self.lifecycle.state()
    }

    pub fn is_done(&self) -> bool {
        self.lifecycle.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    pub fn retries(&self) -> u32 {
        self.lifecycle.retries()
    }

    /// Runs `listener` once the request settles, or right away if it already has.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        self.lifecycle.add_listener(Box::new(listener));
    }
}

impl<H: AsyncHandler> Clone for ResponseFuture<H> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl<H: AsyncHandler> IntoFuture for ResponseFuture<H> {
    type Output = crate::Result<H::Output>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.lifecycle.outcome().await })
    }
}

impl<H: AsyncHandler> fmt::Debug for ResponseFuture<H> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ResponseFuture")
            .field("state", &self.state())
            .field("retries", &self.retries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::connection::Connection;
    use crate::partition::{PartitionKey, Scheme};
    use crate::test_support::{CountingHandler, MockConnection};

    fn lifecycle(max_retries: u32) -> Arc<RequestLifecycle<CountingHandler>> {
        RequestLifecycle::new(CountingHandler::new(1), max_retries, ClientMetrics::new(true))
    }

    fn connection(mock: &Arc<MockConnection>) -> PooledConnection {
        PooledConnection::new(
            Arc::clone(mock) as Arc<dyn Connection>,
            PartitionKey::new(Scheme::Http, "example.com", 80),
        )
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let lifecycle = lifecycle(0);
        assert!(lifecycle.complete(Bytes::from_static(b"ok")));
        assert!(!lifecycle.fail(Error::Closed));
        assert!(!lifecycle.cancel());

        let future = ResponseFuture::new(Arc::clone(&lifecycle));
        assert_eq!(future.get().await.expect("success"), Bytes::from_static(b"ok"));
        assert_eq!(future.get().await.expect("same outcome"), Bytes::from_static(b"ok"));
        assert_eq!(future.state(), RequestState::Done);
        assert_eq!(lifecycle.handler().throwables.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settles_have_one_winner() {
        for _ in 0..32 {
            let lifecycle = lifecycle(0);
            let winners = Arc::new(AtomicUsize::new(0));
            let mut tasks = Vec::new();
            for index in 0..12 {
                let lifecycle = Arc::clone(&lifecycle);
                let winners = Arc::clone(&winners);
                tasks.push(tokio::spawn(async move {
                    let won = match index % 3 {
                        0 => lifecycle.complete(Bytes::from_static(b"ok")),
                        1 => lifecycle.fail(Error::Closed),
                        _ => lifecycle.cancel(),
                    };
                    if won {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for task in tasks {
                task.await.expect("settle task");
            }
            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert!(lifecycle.handler().throwables.load(Ordering::SeqCst) <= 1);
            let first = ResponseFuture::new(Arc::clone(&lifecycle)).get().await;
            let second = ResponseFuture::new(Arc::clone(&lifecycle)).get().await;
            assert_eq!(first.is_ok(), second.is_ok());
        }
    }

    #[tokio::test]
    async fn cancel_closes_attached_connection_and_notifies_once() {
        let lifecycle = lifecycle(0);
        let mock = MockConnection::new(false);
        lifecycle.attach(connection(&mock)).expect("attach");
        assert_eq!(lifecycle.state(), RequestState::InFlight);

        assert!(lifecycle.cancel());
        assert!(!lifecycle.cancel());
        assert_eq!(mock.close_calls(), 1);
        assert!(lifecycle.take_connection().is_none());
        assert_eq!(lifecycle.handler().throwables.load(Ordering::SeqCst), 1);

        let error = ResponseFuture::new(lifecycle).get().await.expect_err("cancelled");
        assert!(error.is_cancelled());
    }

    #[tokio::test]
    async fn settled_lifecycle_refuses_connections() {
        let lifecycle = lifecycle(0);
        lifecycle.cancel();
        let mock = MockConnection::new(false);
        let refused = lifecycle
            .attach(connection(&mock))
            .expect_err("terminal lifecycle refuses attach");
        assert_eq!(refused.id(), mock.id());
    }

    #[test]
    fn retry_budget_is_never_exceeded() {
        let lifecycle = lifecycle(2);
        assert!(lifecycle.can_retry());
        assert!(lifecycle.try_acquire_retry());
        assert!(lifecycle.try_acquire_retry());
        assert!(!lifecycle.try_acquire_retry());
        assert!(!lifecycle.can_retry());
        assert_eq!(lifecycle.retries(), 2);

        let no_retries = self::lifecycle(0);
        assert!(!no_retries.can_retry());
        assert!(!no_retries.try_acquire_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_keeps_latest_value() {
        let lifecycle = lifecycle(0);
        tokio::time::advance(Duration::from_millis(40)).await;
        lifecycle.touch();
        let touched = lifecycle.last_touch();
        assert_eq!(touched - lifecycle.started_at, Duration::from_millis(40));
        lifecycle
            .last_touch_nanos
            .fetch_max(1, Ordering::AcqRel);
        assert_eq!(lifecycle.last_touch(), touched);
    }

    #[tokio::test]
    async fn listeners_run_once_even_when_added_late() {
        let lifecycle = lifecycle(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        lifecycle.add_listener(Box::new(move |completion| {
            assert!(matches!(completion, Completion::Failed(Error::Closed)));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        lifecycle.fail(Error::Closed);
        lifecycle.fail(Error::Closed);

        let counter = Arc::clone(&calls);
        lifecycle.add_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn get_timeout_leaves_request_running() {
        let future = ResponseFuture::new(lifecycle(0));
        let error = future
            .get_timeout(Duration::from_millis(10))
            .await
            .expect_err("nothing settles the request");
        assert!(matches!(error, Error::WaitTimeout { timeout_ms: 10 }));
        assert_eq!(future.state(), RequestState::New);
    }

    #[test]
    fn blocking_get_waits_for_other_thread() {
        let lifecycle = lifecycle(0);
        let future = ResponseFuture::new(Arc::clone(&lifecycle));
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            lifecycle.complete(Bytes::from_static(b"done"));
        });
        assert_eq!(
            future.blocking_get().expect("completed"),
            Bytes::from_static(b"done")
        );
        completer.join().expect("completer thread");

        let pending = ResponseFuture::new(self::lifecycle(0));
        let error = pending
            .blocking_get_timeout(Duration::from_millis(10))
            .expect_err("never settles");
        assert!(matches!(error, Error::WaitTimeout { .. }));
    }
}
