use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};

use crate::error::Error;
use crate::partition::PartitionKey;
use crate::util::lock_unpoisoned;

const PER_HOST_LIMITER_ENTRY_TTL: Duration = Duration::from_secs(300);
const PER_HOST_LIMITER_MAX_ENTRIES: usize = 1024;

/// Caps on open connections, enforced when a new connection is about to be opened.
///
/// Acquisition never waits: an exhausted cap is reported to the caller immediately.
pub(crate) struct ConnectionLimits {
    global: Option<(Arc<Semaphore>, usize)>,
    per_host_limit: Option<usize>,
    per_host: Mutex<BTreeMap<String, PerHostLimiterEntry>>,
}

struct PerHostLimiterEntry {
    semaphore: Arc<Semaphore>,
    limit: usize,
    last_used_at: Instant,
}

impl PerHostLimiterEntry {
    fn is_idle(&self) -> bool {
        self.semaphore.available_permits() == self.limit
    }
}

/// Released when the owning connection is dropped.
#[derive(Debug, Default)]
pub struct ConnectionPermits {
    _global: Option<OwnedSemaphorePermit>,
    _host: Option<OwnedSemaphorePermit>,
}

impl ConnectionLimits {
    pub(crate) fn new(max_connections: Option<usize>, per_host_limit: Option<usize>) -> Self {
        Self {
            global: max_connections.map(|limit| (Arc::new(Semaphore::new(limit)), limit)),
            per_host_limit,
            per_host: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn try_acquire(&self, key: &PartitionKey) -> crate::Result<ConnectionPermits> {
        let global = match &self.global {
            Some((semaphore, limit)) => Some(
                semaphore
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| Error::TooManyConnections { limit: *limit })?,
            ),
            None => None,
        };

        let host = match self.per_host_limit {
            Some(limit) => {
                let partition = key.to_string();
                let semaphore = {
                    let mut guard = lock_unpoisoned(&self.per_host);
                    let now = Instant::now();
                    cleanup_stale_per_host_limiters(&mut guard, now);
                    let entry = guard
                        .entry(partition.clone())
                        .or_insert_with(|| PerHostLimiterEntry {
                            semaphore: Arc::new(Semaphore::new(limit)),
                            limit,
                            last_used_at: now,
                        });
                    entry.last_used_at = now;
                    entry.semaphore.clone()
                };
                Some(
                    semaphore
                        .try_acquire_owned()
                        .map_err(|_| Error::TooManyConnectionsPerHost { partition, limit })?,
                )
            }
            None => None,
        };

        Ok(ConnectionPermits {
            _global: global,
            _host: host,
        })
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        lock_unpoisoned(&self.per_host).len()
    }
}

fn cleanup_stale_per_host_limiters(
    entries: &mut BTreeMap<String, PerHostLimiterEntry>,
    now: Instant,
) {
    entries.retain(|_, entry| {
        !entry.is_idle() || now.duration_since(entry.last_used_at) <= PER_HOST_LIMITER_ENTRY_TTL
    });

    while entries.len() > PER_HOST_LIMITER_MAX_ENTRIES {
        let oldest_key = entries
            .iter()
            .filter(|(_, entry)| entry.is_idle())
            .min_by_key(|(_, entry)| entry.last_used_at)
            .map(|(host, _)| host.clone());
        let Some(oldest_key) = oldest_key else {
            break;
        };
        entries.remove(&oldest_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Scheme;

    fn key(host: &str) -> PartitionKey {
        PartitionKey::new(Scheme::Http, host, 80)
    }

    #[test]
    fn global_cap_fails_fast_and_recovers_on_drop() {
        let limits = ConnectionLimits::new(Some(1), None);
        let first = limits.try_acquire(&key("a")).expect("first permit");
        let error = limits
            .try_acquire(&key("b"))
            .expect_err("global cap reached");
        assert!(matches!(error, Error::TooManyConnections { limit: 1 }));

        drop(first);
        limits.try_acquire(&key("b")).expect("permit released on drop");
    }

    #[test]
    fn per_host_cap_is_scoped_to_the_partition() {
        let limits = ConnectionLimits::new(None, Some(1));
        let _a = limits.try_acquire(&key("a")).expect("permit for a");
        let _b = limits.try_acquire(&key("b")).expect("permit for b");
        let error = limits
            .try_acquire(&key("a"))
            .expect_err("per-host cap reached");
        match error {
            Error::TooManyConnectionsPerHost { partition, limit } => {
                assert_eq!(partition, "http://a:80");
                assert_eq!(limit, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_per_host_entries_expire() {
        let limits = ConnectionLimits::new(None, Some(2));
        drop(limits.try_acquire(&key("a")).expect("permit"));
        let held = limits.try_acquire(&key("b")).expect("permit");
        assert_eq!(limits.tracked_hosts(), 2);

        tokio::time::advance(PER_HOST_LIMITER_ENTRY_TTL + Duration::from_secs(1)).await;
        let _c = limits.try_acquire(&key("c")).expect("permit");
        // "b" is still in use and must survive cleanup.
        assert_eq!(limits.tracked_hosts(), 2);
        drop(held);
    }
}
