use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, TimeoutPhase};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub retries: u64,
    pub request_timeouts: u64,
    pub read_timeouts: u64,
    pub transport_errors: u64,
    pub connections_opened: u64,
    pub connections_reused: u64,
    pub connections_offered: u64,
    pub connections_evicted: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub error_counts: BTreeMap<String, u64>,
}

/// In-process counters; every method is a no-op when metrics are disabled.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Option<Arc<ClientMetricsInner>>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    retries: AtomicU64,
    request_timeouts: AtomicU64,
    read_timeouts: AtomicU64,
    transport_errors: AtomicU64,
    connections_opened: AtomicU64,
    connections_reused: AtomicU64,
    connections_offered: AtomicU64,
    connections_evicted: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: ClientMetrics,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ClientMetrics {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            inner: enabled.then(|| Arc::new(ClientMetricsInner::default())),
        }
    }

    pub(crate) fn record_request_started(&self) {
        if let Some(inner) = &self.inner {
            bump(&inner.requests_started);
        }
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        if let Some(inner) = &self.inner {
            bump(&inner.in_flight);
        }
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_retry(&self) {
        if let Some(inner) = &self.inner {
            bump(&inner.retries);
        }
    }

    pub(crate) fn record_connection_opened(&self) {
        if let Some(inner) = &self.inner {
            bump(&inner.connections_opened);
        }
    }

    pub(crate) fn record_connection_reused(&self) {
        if let Some(inner) = &self.inner {
            bump(&inner.connections_reused);
        }
    }

    pub(crate) fn record_connection_offered(&self) {
        if let Some(inner) = &self.inner {
            bump(&inner.connections_offered);
        }
    }

    pub(crate) fn record_connections_evicted(&self, count: usize) {
        if let Some(inner) = &self.inner
            && count > 0
        {
            inner
                .connections_evicted
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_request_completed<T>(&self, result: &Result<T, Error>, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
        let error = match result {
            Ok(_) => {
                bump(&inner.requests_succeeded);
                return;
            }
            Err(error) => error,
        };
        match error {
            Error::Cancelled => {
                bump(&inner.requests_cancelled);
            }
            Error::Timeout { phase, .. } => {
                bump(&inner.requests_failed);
                match phase {
                    TimeoutPhase::Request => bump(&inner.request_timeouts),
                    TimeoutPhase::Read => bump(&inner.read_timeouts),
                }
            }
            Error::Transport { .. } => {
                bump(&inner.requests_failed);
                bump(&inner.transport_errors);
            }
            _ => bump(&inner.requests_failed),
        }
        let error_key = match error {
            Error::Timeout { phase, .. } => format!("timeout:{phase}"),
            Error::Transport { kind, .. } => format!("transport:{kind}"),
            other => other.code().as_str().to_owned(),
        };
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return ClientMetricsSnapshot::default();
        };
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let latency_samples = load(&inner.latency_samples);
        let latency_total_ms = load(&inner.latency_total_ms);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        ClientMetricsSnapshot {
            requests_started: load(&inner.requests_started),
            requests_succeeded: load(&inner.requests_succeeded),
            requests_failed: load(&inner.requests_failed),
            requests_cancelled: load(&inner.requests_cancelled),
            retries: load(&inner.retries),
            request_timeouts: load(&inner.request_timeouts),
            read_timeouts: load(&inner.read_timeouts),
            transport_errors: load(&inner.transport_errors),
            connections_opened: load(&inner.connections_opened),
            connections_reused: load(&inner.connections_reused),
            connections_offered: load(&inner.connections_offered),
            connections_evicted: load(&inner.connections_evicted),
            in_flight: load(&inner.in_flight),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.metrics.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
