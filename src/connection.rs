//! The transport boundary consumed by the engine.
//!
//! A [`Transport`] opens [`Connection`]s for a [`PartitionKey`]. The engine
//! wraps every opened connection in a [`PooledConnection`], an owned,
//! non-cloneable handle: whoever holds it owns the connection, so handing a
//! connection from the pool to a request and back is always a move.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::limits::ConnectionPermits;
use crate::partition::PartitionKey;
use crate::util::lock_unpoisoned;

pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "conn-{}", self.0)
    }
}

/// An open, reusable transport handle.
///
/// `read` resolves to `Ok(None)` once the peer has closed its side.
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_secure(&self) -> bool;

    fn is_open(&self) -> bool;

    fn write(&self, bytes: Bytes) -> BoxFuture<'_, io::Result<()>>;

    fn read(&self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;

    /// Runs `callback` once if the peer closes the connection. A callback
    /// registered after the close already happened runs immediately.
    fn on_remote_close(&self, callback: CloseCallback) -> CloseRegistration;

    /// Local close. Idempotent; does not run remote-close callbacks.
    fn close(&self);
}

pub trait Transport: Send + Sync + 'static {
    fn open<'a>(&'a self, key: &'a PartitionKey)
    -> BoxFuture<'a, io::Result<Arc<dyn Connection>>>;
}

#[derive(Default)]
struct CloseNotifierState {
    closed: bool,
    next_id: u64,
    callbacks: BTreeMap<u64, CloseCallback>,
}

/// Remote-close callback registry for [`Connection`] implementations.
#[derive(Default)]
pub struct CloseNotifier {
    state: Mutex<CloseNotifierState>,
}

impl CloseNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, callback: CloseCallback) -> CloseRegistration {
        let mut state = lock_unpoisoned(&self.state);
        if state.closed {
            drop(state);
            callback();
            return CloseRegistration::noop();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, callback);
        CloseRegistration {
            notifier: Arc::downgrade(self),
            id,
        }
    }

    /// Fires every registered callback exactly once, outside the registry lock.
    pub fn notify_remote_close(&self) {
        let callbacks = {
            let mut state = lock_unpoisoned(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks.into_values() {
            callback();
        }
    }

    /// Marks the connection closed locally; pending callbacks are dropped unrun.
    pub fn mark_closed(&self) {
        let callbacks = {
            let mut state = lock_unpoisoned(&self.state);
            state.closed = true;
            std::mem::take(&mut state.callbacks)
        };
        drop(callbacks);
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.state).closed
    }

    fn unregister(&self, id: u64) -> bool {
        lock_unpoisoned(&self.state).callbacks.remove(&id).is_some()
    }
}

#[derive(Debug)]
pub struct CloseRegistration {
    notifier: Weak<CloseNotifier>,
    id: u64,
}

impl CloseRegistration {
    pub fn noop() -> Self {
        Self {
            notifier: Weak::new(),
            id: 0,
        }
    }

    /// Returns whether the callback was still pending.
    pub fn unregister(self) -> bool {
        self.notifier
            .upgrade()
            .is_some_and(|notifier| notifier.unregister(self.id))
    }
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.state);
        formatter
            .debug_struct("CloseNotifier")
            .field("closed", &state.closed)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

/// Exclusive ownership of one open connection.
pub struct PooledConnection {
    io: Arc<dyn Connection>,
    key: PartitionKey,
    created_at: Instant,
    /// Shared with every [`ConnectionIo`]; the limit permits are released
    /// only once neither the owner nor any I/O handle is left.
    lease: Arc<ConnectionPermits>,
}

impl PooledConnection {
    pub fn new(io: Arc<dyn Connection>, key: PartitionKey) -> Self {
        Self::with_permits(io, key, ConnectionPermits::default())
    }

    pub(crate) fn with_permits(
        io: Arc<dyn Connection>,
        key: PartitionKey,
        permits: ConnectionPermits,
    ) -> Self {
        Self {
            io,
            key,
            created_at: Instant::now(),
            lease: Arc::new(permits),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.io.id()
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_open(&self) -> bool {
        self.io.is_open()
    }

    pub fn is_secure(&self) -> bool {
        self.io.is_secure()
    }

    pub fn close(&self) {
        self.io.close();
    }

    /// A borrowed I/O handle. While any handle is alive the connection counts
    /// as attached to an exchange.
    pub fn io(&self) -> ConnectionIo {
        ConnectionIo {
            io: Arc::clone(&self.io),
            _lease: Arc::clone(&self.lease),
        }
    }

    pub(crate) fn in_flight(&self) -> bool {
        Arc::strong_count(&self.lease) > 1
    }

    pub(crate) fn shared_io(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.io)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("key", &self.key)
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Clone)]
pub struct ConnectionIo {
    io: Arc<dyn Connection>,
    _lease: Arc<ConnectionPermits>,
}

impl Deref for ConnectionIo {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.io
    }
}
