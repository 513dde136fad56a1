//! Per-request timers.
//!
//! A [`TimeoutsHolder`] owns one replaceable slot per timer kind. Installing
//! a timer into a slot aborts whatever the slot held before, and once the
//! holder is cancelled every install is aborted on the spot. A timer that
//! wakes up after cancellation, or after its request settled, returns without
//! touching anything.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{Error, TimeoutPhase};
use crate::util::lock_unpoisoned;

/// The request a [`TimeoutsHolder`] watches.
pub(crate) trait TimeoutTarget: Send + Sync + 'static {
    fn is_done(&self) -> bool;

    fn started_at(&self) -> Instant;

    fn last_touch(&self) -> Instant;

    fn expire(&self, error: Error);
}

#[derive(Default)]
struct TimerSlot {
    armed: Mutex<Option<(u64, AbortHandle)>>,
}

impl TimerSlot {
    fn install(&self, id: u64, handle: AbortHandle, cancelled: &AtomicBool) {
        let mut armed = lock_unpoisoned(&self.armed);
        if cancelled.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        if let Some((_, previous)) = armed.replace((id, handle)) {
            previous.abort();
        }
    }

    fn disarm_if(&self, id: u64) {
        let mut armed = lock_unpoisoned(&self.armed);
        if armed.as_ref().is_some_and(|(current, _)| *current == id) {
            *armed = None;
        }
    }

    fn cancel(&self) -> bool {
        match lock_unpoisoned(&self.armed).take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn is_armed(&self) -> bool {
        lock_unpoisoned(&self.armed).is_some()
    }
}

pub struct TimeoutsHolder {
    cancelled: AtomicBool,
    target: Weak<dyn TimeoutTarget>,
    request_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    request_deadline: Option<Instant>,
    remote: String,
    next_timer_id: AtomicU64,
    request: TimerSlot,
    read: TimerSlot,
    retry: TimerSlot,
}

impl TimeoutsHolder {
    pub(crate) fn new(
        target: Weak<dyn TimeoutTarget>,
        started_at: Instant,
        request_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        remote: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            target,
            request_timeout,
            read_timeout,
            request_deadline: request_timeout.map(|timeout| started_at + timeout),
            remote,
            next_timer_id: AtomicU64::new(1),
            request: TimerSlot::default(),
            read: TimerSlot::default(),
            retry: TimerSlot::default(),
        })
    }

    /// Arms the absolute request deadline. Has no effect when the request
    /// timeout is disabled.
    pub(crate) fn start_request_timeout(self: &Arc<Self>) {
        let Some(deadline) = self.request_deadline else {
            return;
        };
        let id = self.next_timer_id();
        let holder = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(holder) = holder.upgrade() else {
                return;
            };
            holder.request.disarm_if(id);
            holder.on_request_timeout();
        });
        self.request.install(id, task.abort_handle(), &self.cancelled);
    }

    /// Arms (or re-arms) the sliding read timeout for a full window.
    pub(crate) fn start_read_timeout(self: &Arc<Self>) {
        if let Some(read_timeout) = self.read_timeout {
            self.schedule_read(read_timeout);
        }
    }

    pub(crate) fn stop_read_timeout(&self) {
        self.read.cancel();
    }

    /// Resolves after `delay` unless the holder is cancelled or the request
    /// settles first, in which case the sender side is dropped.
    pub(crate) fn schedule_retry(self: &Arc<Self>, delay: Duration) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_timer_id();
        let holder = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(holder) = holder.upgrade() else {
                return;
            };
            holder.retry.disarm_if(id);
            if holder.is_cancelled() || holder.target_done() {
                return;
            }
            let _ = sender.send(());
        });
        self.retry.install(id, task.abort_handle(), &self.cancelled);
        receiver
    }

    /// Cancels every timer. Only the first call has an effect; returns whether
    /// this call was it.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.request.cancel();
        self.read.cancel();
        self.retry.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn next_timer_id(&self) -> u64 {
        self.next_timer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn target_done(&self) -> bool {
        self.target.upgrade().is_none_or(|target| target.is_done())
    }

    fn schedule_read(self: &Arc<Self>, delay: Duration) {
        if self.is_cancelled() {
            return;
        }
        let fire_at = Instant::now() + delay;
        if let Some(deadline) = self.request_deadline
            && deadline <= fire_at
        {
            trace!(
                remote = %self.remote,
                "request timeout fires first; read timeout not scheduled"
            );
            self.read.cancel();
            return;
        }
        let id = self.next_timer_id();
        let holder = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            let Some(holder) = holder.upgrade() else {
                return;
            };
            holder.read.disarm_if(id);
            holder.on_read_timeout();
        });
        self.read.install(id, task.abort_handle(), &self.cancelled);
    }

    fn on_request_timeout(&self) {
        if self.is_cancelled() {
            return;
        }
        let Some(target) = self.target.upgrade() else {
            return;
        };
        if target.is_done() {
            return;
        }
        let elapsed = Instant::now().saturating_duration_since(target.started_at());
        debug!(
            remote = %self.remote,
            elapsed_ms = elapsed.as_millis() as u64,
            "request timeout fired"
        );
        self.cancel();
        target.expire(Error::Timeout {
            phase: TimeoutPhase::Request,
            elapsed_ms: elapsed.as_millis(),
            remote: self.remote.clone(),
        });
    }

    fn on_read_timeout(self: &Arc<Self>) {
        let Some(read_timeout) = self.read_timeout else {
            return;
        };
        if self.is_cancelled() {
            return;
        }
        let Some(target) = self.target.upgrade() else {
            return;
        };
        if target.is_done() {
            return;
        }
        let silence = Instant::now().saturating_duration_since(target.last_touch());
        if silence < read_timeout {
            let remaining = read_timeout - silence;
            trace!(
                remote = %self.remote,
                remaining_ms = remaining.as_millis() as u64,
                "read timeout rescheduled"
            );
            self.schedule_read(remaining);
            return;
        }
        debug!(
            remote = %self.remote,
            silence_ms = silence.as_millis() as u64,
            "read timeout fired"
        );
        self.cancel();
        target.expire(Error::Timeout {
            phase: TimeoutPhase::Read,
            elapsed_ms: silence.as_millis(),
            remote: self.remote.clone(),
        });
    }

    #[cfg(test)]
    fn armed(&self) -> (bool, bool, bool) {
        (
            self.request.is_armed(),
            self.read.is_armed(),
            self.retry.is_armed(),
        )
    }
}

impl Drop for TimeoutsHolder {
    fn drop(&mut self) {
        self.request.cancel();
        self.read.cancel();
        self.retry.cancel();
    }
}

impl fmt::Debug for TimeoutsHolder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TimeoutsHolder")
            .field("remote", &self.remote)
            .field("cancelled", &self.is_cancelled())
            .field("request_timeout", &self.request_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}
