use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Duration;

use crate::connection::{
    CloseCallback, CloseNotifier, CloseRegistration, Connection, ConnectionId, Transport,
};
use crate::error::BoxError;
use crate::handler::{AsyncHandler, HandlerState};
use crate::partition::PartitionKey;
use crate::util::lock_unpoisoned;

/// What a scripted connection does once the request has been written to it.
#[derive(Clone, Debug)]
pub(crate) enum MockBehavior {
    /// Replies with the given chunks, each after its delay.
    Respond(Vec<(Duration, Bytes)>),
    /// Every write fails with a connection reset.
    ResetOnWrite,
    /// The head goes through; every later write fails with a connection reset.
    ResetAfterHead,
    /// The peer closes after the first write.
    CloseOnWrite,
    /// Accepts writes and never answers.
    Silent,
}

impl MockBehavior {
    pub(crate) fn respond(body: &'static [u8]) -> Self {
        Self::Respond(vec![(Duration::ZERO, Bytes::from_static(body))])
    }
}

type ReadItem = (Duration, io::Result<Option<Bytes>>);

pub(crate) struct MockConnection {
    id: ConnectionId,
    secure: bool,
    open: AtomicBool,
    behavior: MockBehavior,
    responded: AtomicBool,
    writes: AtomicUsize,
    notifier: Arc<CloseNotifier>,
    written: Mutex<Vec<u8>>,
    reads: Mutex<VecDeque<ReadItem>>,
    readable: Notify,
    close_calls: AtomicUsize,
}

impl MockConnection {
    pub(crate) fn new(secure: bool) -> Arc<Self> {
        Self::with_behavior(secure, MockBehavior::Silent)
    }

    pub(crate) fn with_behavior(secure: bool, behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            secure,
            open: AtomicBool::new(true),
            behavior,
            responded: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            notifier: CloseNotifier::new(),
            written: Mutex::new(Vec::new()),
            reads: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Simulates the peer closing the connection.
    pub(crate) fn close_remotely(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.push_read(Duration::ZERO, Ok(None));
        self.notifier.notify_remote_close();
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        lock_unpoisoned(&self.written).clone()
    }

    fn push_read(&self, delay: Duration, item: io::Result<Option<Bytes>>) {
        lock_unpoisoned(&self.reads).push_back((delay, item));
        self.readable.notify_waiters();
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn write(&self, bytes: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection is closed",
                ));
            }
            let write_index = self.writes.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                MockBehavior::ResetAfterHead if write_index == 0 => {
                    lock_unpoisoned(&self.written).extend_from_slice(&bytes);
                }
                MockBehavior::ResetOnWrite | MockBehavior::ResetAfterHead => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    ));
                }
                MockBehavior::CloseOnWrite => {
                    lock_unpoisoned(&self.written).extend_from_slice(&bytes);
                    self.close_remotely();
                }
                MockBehavior::Respond(chunks) => {
                    lock_unpoisoned(&self.written).extend_from_slice(&bytes);
                    if !self.responded.swap(true, Ordering::SeqCst) {
                        for (delay, chunk) in chunks {
                            self.push_read(*delay, Ok(Some(chunk.clone())));
                        }
                    }
                }
                MockBehavior::Silent => {
                    lock_unpoisoned(&self.written).extend_from_slice(&bytes);
                }
            }
            Ok(())
        })
    }

    fn read(&self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            loop {
                let notified = self.readable.notified();
                let next = {
                    let mut reads = lock_unpoisoned(&self.reads);
                    let next = reads.pop_front();
                    if next.is_some() && reads.is_empty() {
                        // Drained; the next request written gets a fresh reply.
                        self.responded.store(false, Ordering::SeqCst);
                    }
                    next
                };
                if let Some((delay, item)) = next {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    return item;
                }
                notified.await;
            }
        })
    }

    fn on_remote_close(&self, callback: CloseCallback) -> CloseRegistration {
        self.notifier.subscribe(callback)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        self.notifier.mark_closed();
    }
}

/// Hands out scripted connections, one behavior per `open` call.
pub(crate) struct MockTransport {
    behaviors: Mutex<VecDeque<MockBehavior>>,
    fallback: MockBehavior,
    open_failures: Mutex<VecDeque<io::ErrorKind>>,
    opened: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub(crate) fn new(fallback: MockBehavior) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback)
    }

    pub(crate) fn scripted(behaviors: Vec<MockBehavior>, fallback: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(behaviors.into()),
            fallback,
            open_failures: Mutex::new(VecDeque::new()),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn fail_next_open(&self, kind: io::ErrorKind) {
        lock_unpoisoned(&self.open_failures).push_back(kind);
    }

    pub(crate) fn opened(&self) -> Vec<Arc<MockConnection>> {
        lock_unpoisoned(&self.opened).clone()
    }
}

impl Transport for MockTransport {
    fn open<'a>(
        &'a self,
        key: &'a PartitionKey,
    ) -> BoxFuture<'a, io::Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            if let Some(kind) = lock_unpoisoned(&self.open_failures).pop_front() {
                return Err(io::Error::new(kind, "scripted connect failure"));
            }
            let behavior = lock_unpoisoned(&self.behaviors)
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            let connection = MockConnection::with_behavior(key.is_secure(), behavior);
            lock_unpoisoned(&self.opened).push(Arc::clone(&connection));
            Ok(connection as Arc<dyn Connection>)
        })
    }
}

/// Collects response bytes until `expected` bytes have arrived.
pub(crate) struct CountingHandler {
    expected: usize,
    received: Mutex<Vec<u8>>,
    pub(crate) retries: AtomicUsize,
    pub(crate) throwables: AtomicUsize,
    pub(crate) keep_alive: bool,
}

impl CountingHandler {
    pub(crate) fn new(expected: usize) -> Self {
        Self {
            expected,
            received: Mutex::new(Vec::new()),
            retries: AtomicUsize::new(0),
            throwables: AtomicUsize::new(0),
            keep_alive: true,
        }
    }
}

impl AsyncHandler for CountingHandler {
    type Output = Bytes;

    fn on_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.received).clear();
    }

    fn on_throwable(&self, _error: &crate::Error) {
        self.throwables.fetch_add(1, Ordering::SeqCst);
    }

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn on_body_part(&self, part: &[u8]) -> Result<HandlerState, BoxError> {
        let mut received = lock_unpoisoned(&self.received);
        received.extend_from_slice(part);
        if received.len() >= self.expected {
            Ok(HandlerState::Complete)
        } else {
            Ok(HandlerState::Continue)
        }
    }

    fn on_completed(&self) -> Result<Self::Output, BoxError> {
        Ok(Bytes::from(lock_unpoisoned(&self.received).clone()))
    }
}
