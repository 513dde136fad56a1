//! Partitioned cache of idle connections.
//!
//! Each partition is a queue of idle entries behind its own lock; the map of
//! partitions is a concurrent map, so `offer` and `poll` on different
//! partitions never contend. An entry's connection sits in a one-shot slot:
//! whichever of `poll`, the eviction sweep, a remote-close callback, `remove_all`
//! or `destroy` takes it first owns it, and the losers see an empty slot.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::{ClientConfig, LeaseStrategy};
use crate::connection::{CloseRegistration, Connection, ConnectionId, PooledConnection};
use crate::metrics::ClientMetrics;
use crate::partition::PartitionKey;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_idle_per_partition: Option<usize>,
    pub max_idle_total: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub ttl: Option<Duration>,
    pub cleaner_period: Option<Duration>,
    pub ssl_pooling_enabled: bool,
    pub lease_strategy: LeaseStrategy,
}

impl PoolSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_idle_per_partition: config.max_connections_per_host,
            max_idle_total: config.max_connections,
            idle_timeout: config.pooled_connection_idle_timeout,
            ttl: config.connection_ttl,
            cleaner_period: config.cleaner_period(),
            ssl_pooling_enabled: config.ssl_connection_pool_enabled,
            lease_strategy: config.lease_strategy,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expiry {
    Closed,
    Ttl,
    Idle,
}

impl Expiry {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "remotely closed",
            Self::Ttl => "ttl expired",
            Self::Idle => "idle timeout",
        }
    }
}

struct IdleEntry {
    id: ConnectionId,
    key: PartitionKey,
    created_at: Instant,
    idle_since: Instant,
    io: Arc<dyn Connection>,
    connection: Mutex<Option<PooledConnection>>,
    registration: Mutex<Option<CloseRegistration>>,
}

impl IdleEntry {
    /// Claims the connection. Succeeds for exactly one caller.
    fn take(&self) -> Option<PooledConnection> {
        let connection = lock_unpoisoned(&self.connection).take()?;
        if let Some(registration) = lock_unpoisoned(&self.registration).take() {
            registration.unregister();
        }
        Some(connection)
    }

    fn is_taken(&self) -> bool {
        lock_unpoisoned(&self.connection).is_none()
    }

    fn expiry(&self, settings: &PoolSettings, now: Instant) -> Option<Expiry> {
        if !self.io.is_open() {
            return Some(Expiry::Closed);
        }
        if let Some(ttl) = settings.ttl
            && now.saturating_duration_since(self.created_at) >= ttl
        {
            return Some(Expiry::Ttl);
        }
        if let Some(idle_timeout) = settings.idle_timeout
            && now.saturating_duration_since(self.idle_since) >= idle_timeout
        {
            return Some(Expiry::Idle);
        }
        None
    }
}

#[derive(Default)]
struct Partition {
    idle: Mutex<VecDeque<Arc<IdleEntry>>>,
}

struct PoolInner {
    partitions: DashMap<PartitionKey, Arc<Partition>>,
    settings: PoolSettings,
    closed: AtomicBool,
    idle_total: AtomicUsize,
    metrics: ClientMetrics,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweeper_started: AtomicBool,
}

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool. The eviction sweep starts right away inside a tokio
    /// runtime, otherwise with the first `offer` made from one.
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_metrics(settings, ClientMetrics::default())
    }

    pub(crate) fn with_metrics(settings: PoolSettings, metrics: ClientMetrics) -> Self {
        let inner = Arc::new(PoolInner {
            partitions: DashMap::new(),
            settings,
            closed: AtomicBool::new(false),
            idle_total: AtomicUsize::new(0),
            metrics,
            sweeper: Mutex::new(None),
            sweeper_started: AtomicBool::new(false),
        });
        inner.ensure_sweeper();
        Self { inner }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Caches `connection` for reuse.
    ///
    /// A refused connection is handed back; the caller must close it.
    pub fn offer(&self, connection: PooledConnection) -> Result<(), PooledConnection> {
        let inner = &self.inner;
        let settings = &inner.settings;
        let now = Instant::now();
        if inner.closed.load(Ordering::Acquire)
            || !connection.is_open()
            || (connection.is_secure() && !settings.ssl_pooling_enabled)
        {
            return Err(connection);
        }
        if let Some(ttl) = settings.ttl
            && now.saturating_duration_since(connection.created_at()) >= ttl
        {
            return Err(connection);
        }

        let key = connection.key().clone();
        let partition = match inner.partitions.get(&key) {
            Some(partition) => Arc::clone(partition.value()),
            None => Arc::clone(inner.partitions.entry(key.clone()).or_default().value()),
        };
        let entry = Arc::new(IdleEntry {
            id: connection.id(),
            key,
            created_at: connection.created_at(),
            idle_since: now,
            io: connection.shared_io(),
            connection: Mutex::new(None),
            registration: Mutex::new(None),
        });
        {
            let mut idle = lock_unpoisoned(&partition.idle);
            if inner.closed.load(Ordering::Acquire)
                || settings
                    .max_idle_per_partition
                    .is_some_and(|limit| idle.len() >= limit)
                || !inner.reserve_idle_slot()
            {
                return Err(connection);
            }
            *lock_unpoisoned(&entry.connection) = Some(connection);
            idle.push_back(Arc::clone(&entry));
        }
        inner.metrics.record_connection_offered();
        inner.ensure_sweeper();

        let weak_pool = Arc::downgrade(inner);
        let weak_entry = Arc::downgrade(&entry);
        let registration = entry.io.on_remote_close(Box::new(move || {
            if let (Some(pool), Some(entry)) = (weak_pool.upgrade(), weak_entry.upgrade()) {
                pool.evict_remotely_closed(&entry);
            }
        }));
        let mut slot = lock_unpoisoned(&entry.registration);
        if entry.is_taken() {
            drop(slot);
            registration.unregister();
        } else {
            *slot = Some(registration);
        }
        Ok(())
    }

    /// Pops one live idle connection for `key`, closing stale entries on the way.
    pub fn poll(&self, key: &PartitionKey) -> Option<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire)
            || (key.is_secure() && !inner.settings.ssl_pooling_enabled)
        {
            return None;
        }
        let partition = Arc::clone(inner.partitions.get(key)?.value());
        loop {
            let entry = {
                let mut idle = lock_unpoisoned(&partition.idle);
                match inner.settings.lease_strategy {
                    LeaseStrategy::Lifo => idle.pop_back(),
                    LeaseStrategy::Fifo => idle.pop_front(),
                }
            }?;
            inner.release_idle_slot(1);
            let Some(connection) = entry.take() else {
                continue;
            };
            if let Some(expiry) = entry.expiry(&inner.settings, Instant::now()) {
                trace!(
                    connection = %entry.id,
                    partition = %entry.key,
                    reason = expiry.as_str(),
                    "discarding pooled connection"
                );
                connection.close();
                inner.metrics.record_connections_evicted(1);
                continue;
            }
            return Some(connection);
        }
    }

    /// Removes and closes the idle connection `id`. Returns `false` if it was
    /// not pooled.
    pub fn remove_all(&self, id: ConnectionId) -> bool {
        let partitions = self.inner.partition_list();
        for partition in partitions {
            let removed = {
                let mut idle = lock_unpoisoned(&partition.idle);
                idle.iter()
                    .position(|entry| entry.id == id)
                    .and_then(|index| idle.remove(index))
            };
            if let Some(entry) = removed {
                self.inner.release_idle_slot(1);
                return match entry.take() {
                    Some(connection) => {
                        connection.close();
                        true
                    }
                    None => false,
                };
            }
        }
        false
    }

    /// Closes and drops every idle connection of the partitions matching `predicate`.
    pub fn flush_partitions<F>(&self, mut predicate: F)
    where
        F: FnMut(&PartitionKey) -> bool,
    {
        let partitions: Vec<_> = self
            .inner
            .partitions
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for partition in partitions {
            self.inner.close_partition(&partition);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle_total.load(Ordering::Acquire)
    }

    pub fn idle_count_per_host(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for partition in self.inner.partitions.iter() {
            let idle = lock_unpoisoned(&partition.value().idle).len();
            if idle > 0 {
                *counts.entry(partition.key().host().to_owned()).or_insert(0) += idle;
            }
        }
        counts
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes every pooled connection and stops the sweep. Idempotent.
    pub fn destroy(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = lock_unpoisoned(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        for partition in self.inner.partition_list() {
            self.inner.close_partition(&partition);
        }
        self.inner.partitions.clear();
        debug!("connection pool destroyed");
    }

    #[cfg(test)]
    fn sweep_now(&self) {
        self.inner.sweep();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ConnectionPool")
            .field("partitions", &self.inner.partitions.len())
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl PoolInner {
    fn ensure_sweeper(self: &Arc<Self>) {
        if self.settings.cleaner_period.is_none() || self.sweeper_started.load(Ordering::Acquire) {
            return;
        }
        let mut slot = lock_unpoisoned(&self.sweeper);
        if slot.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(sweeper) = spawn_sweeper(self) {
            *slot = Some(sweeper);
            self.sweeper_started.store(true, Ordering::Release);
        }
    }

    fn reserve_idle_slot(&self) -> bool {
        match self.settings.max_idle_total {
            Some(limit) => self
                .idle_total
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    (count < limit).then_some(count + 1)
                })
                .is_ok(),
            None => {
                self.idle_total.fetch_add(1, Ordering::AcqRel);
                true
            }
        }
    }

    fn release_idle_slot(&self, count: usize) {
        if count > 0 {
            self.idle_total.fetch_sub(count, Ordering::AcqRel);
        }
    }

    fn partition_list(&self) -> Vec<Arc<Partition>> {
        self.partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn evict_remotely_closed(&self, entry: &Arc<IdleEntry>) {
        if let Some(partition) = self.partitions.get(&entry.key).map(|p| Arc::clone(p.value())) {
            let mut idle = lock_unpoisoned(&partition.idle);
            if let Some(index) = idle.iter().position(|queued| Arc::ptr_eq(queued, entry)) {
                idle.remove(index);
                drop(idle);
                self.release_idle_slot(1);
            }
        }
        if let Some(connection) = entry.take() {
            trace!(
                connection = %entry.id,
                partition = %entry.key,
                "pooled connection closed by peer"
            );
            connection.close();
            self.metrics.record_connections_evicted(1);
        }
    }

    fn close_partition(&self, partition: &Partition) {
        let drained: Vec<_> = lock_unpoisoned(&partition.idle).drain(..).collect();
        self.release_idle_slot(drained.len());
        for entry in drained {
            if let Some(connection) = entry.take() {
                connection.close();
            }
        }
    }

    fn sweep(&self) {
        let started = Instant::now();
        let mut expired = Vec::new();
        let mut total = 0;
        for partition in self.partition_list() {
            let mut idle = lock_unpoisoned(&partition.idle);
            total += idle.len();
            idle.retain(|entry| match entry.expiry(&self.settings, started) {
                Some(expiry) => {
                    expired.push((Arc::clone(entry), expiry));
                    false
                }
                None => true,
            });
        }
        self.release_idle_slot(expired.len());

        let mut closed = 0;
        for (entry, expiry) in expired {
            let Some(connection) = entry.take() else {
                continue;
            };
            if connection.in_flight() {
                warn!(
                    connection = %entry.id,
                    partition = %entry.key,
                    reason = expiry.as_str(),
                    "evicted pooled connection is still attached to an active request; not closing it"
                );
                continue;
            }
            trace!(
                connection = %entry.id,
                partition = %entry.key,
                reason = expiry.as_str(),
                "closing expired pooled connection"
            );
            connection.close();
            closed += 1;
        }
        self.metrics.record_connections_evicted(closed);
        if total > 0 {
            debug!(
                closed,
                total,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "idle connection sweep finished"
            );
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock_unpoisoned(&self.sweeper).take() {
            sweeper.abort();
        }
    }
}

fn spawn_sweeper(inner: &Arc<PoolInner>) -> Option<JoinHandle<()>> {
    let period = inner.settings.cleaner_period?;
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let pool: Weak<PoolInner> = Arc::downgrade(inner);
    Some(runtime.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.closed.load(Ordering::Acquire) {
                break;
            }
            pool.sweep();
        }
    }))
}
