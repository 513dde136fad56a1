//! Push-style request bodies.
//!
//! A producer holds a [`StreamingBodyFeeder`] and calls [`feed`](StreamingBodyFeeder::feed)
//! whenever bytes become available; the sender pulls from the paired
//! [`FeedableBody`] on its own schedule. Pulling from an empty, unfinished
//! body reports [`BodyRead::Suspend`] instead of blocking; the next `feed`
//! wakes the suspended reader.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::task::AtomicWaker;
use http_body::{Body, Frame, SizeHint};

use crate::error::Error;
use crate::util::lock_unpoisoned;

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
const CRLF: &[u8] = b"\r\n";
pub(crate) const DEFAULT_PULL_SIZE: usize = 16 * 1024;

/// Notified from the producer side of a feeder.
pub trait FeedListener: Send + Sync + 'static {
    fn on_content_added(&self);

    fn on_error(&self, _error: &Error) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyRead {
    Produced(usize),
    /// Nothing queued yet; wait for the next `feed`.
    Suspend,
    Finished,
}

struct BodyPart {
    data: Bytes,
    is_last: bool,
}

impl BodyPart {
    /// Wire segments of this part. Computed once, when the part is first read.
    fn into_segments(self, chunked: bool) -> VecDeque<Bytes> {
        let mut segments = VecDeque::with_capacity(4);
        if !chunked {
            if !self.data.is_empty() {
                segments.push_back(self.data);
            }
            return segments;
        }
        if !self.data.is_empty() {
            segments.push_back(Bytes::from(format!("{:x}\r\n", self.data.len())));
            segments.push_back(self.data);
            segments.push_back(Bytes::from_static(CRLF));
        }
        if self.is_last {
            segments.push_back(Bytes::from_static(LAST_CHUNK));
        }
        segments
    }
}

struct CurrentPart {
    segments: VecDeque<Bytes>,
    is_last: bool,
}

#[derive(Default)]
struct FeederState {
    queue: VecDeque<BodyPart>,
    current: Option<CurrentPart>,
    last_queued: bool,
    finished: bool,
}

struct Shared {
    state: Mutex<FeederState>,
    waker: AtomicWaker,
    chunked: AtomicBool,
    started: AtomicBool,
    listener: Mutex<Option<Arc<dyn FeedListener>>>,
}

/// Producer handle. Cheap to clone; every clone feeds the same body.
#[derive(Clone)]
pub struct StreamingBodyFeeder {
    shared: Arc<Shared>,
}

/// Consumer side of a [`StreamingBodyFeeder`]; its length is never known upfront.
/// Clones share one read position.
#[derive(Clone)]
pub struct FeedableBody {
    shared: Arc<Shared>,
}

impl StreamingBodyFeeder {
    /// Creates a feeder and the body it feeds. Chunked framing is on until
    /// the sender applies the client's setting.
    pub fn new() -> (Self, FeedableBody) {
        let shared = Arc::new(Shared {
            state: Mutex::new(FeederState::default()),
            waker: AtomicWaker::new(),
            chunked: AtomicBool::new(true),
            started: AtomicBool::new(false),
            listener: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            FeedableBody { shared },
        )
    }

    pub fn set_listener(&self, listener: Arc<dyn FeedListener>) {
        *lock_unpoisoned(&self.shared.listener) = Some(listener);
    }

    /// Queues one part. After a part with `is_last` has been queued every
    /// further call fails with [`Error::BodyAlreadyFinished`].
    pub fn feed(&self, data: impl Into<Bytes>, is_last: bool) -> Result<(), Error> {
        let listener = lock_unpoisoned(&self.shared.listener).clone();
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            if state.last_queued {
                drop(state);
                let error = Error::BodyAlreadyFinished;
                if let Some(listener) = listener {
                    listener.on_error(&error);
                }
                return Err(error);
            }
            state.last_queued = is_last;
            state.queue.push_back(BodyPart {
                data: data.into(),
                is_last,
            });
        }
        self.shared.waker.wake();
        if let Some(listener) = listener {
            listener.on_content_added();
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.shared.state).last_queued
    }
}

impl FeedableBody {
    pub fn content_length(&self) -> Option<u64> {
        None
    }

    pub fn is_chunked(&self) -> bool {
        self.shared.chunked.load(Ordering::Acquire)
    }

    pub(crate) fn set_chunked(&self, chunked: bool) {
        self.shared.chunked.store(chunked, Ordering::Release);
    }

    /// `false` once any byte has been handed out; such a body cannot be resent.
    pub fn is_replayable(&self) -> bool {
        !self.shared.started.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        lock_unpoisoned(&self.shared.state).finished
    }

    /// Copies queued bytes into `buffer`, wire framing included.
    pub fn read(&self, buffer: &mut [u8]) -> BodyRead {
        let chunked = self.is_chunked();
        let mut state = lock_unpoisoned(&self.shared.state);
        if state.finished {
            return BodyRead::Finished;
        }
        let mut produced = 0;
        while produced < buffer.len() {
            if state.current.is_none() {
                let Some(part) = state.queue.pop_front() else {
                    break;
                };
                let is_last = part.is_last;
                state.current = Some(CurrentPart {
                    segments: part.into_segments(chunked),
                    is_last,
                });
            }
            let Some(current) = state.current.as_mut() else {
                break;
            };
            while produced < buffer.len() {
                let Some(segment) = current.segments.front_mut() else {
                    break;
                };
                let count = segment.len().min(buffer.len() - produced);
                buffer[produced..produced + count].copy_from_slice(&segment[..count]);
                segment.advance(count);
                produced += count;
                if segment.is_empty() {
                    current.segments.pop_front();
                }
            }
            if current.segments.is_empty() {
                let is_last = current.is_last;
                state.current = None;
                if is_last {
                    state.finished = true;
                    break;
                }
            }
        }
        if produced > 0 {
            self.shared.started.store(true, Ordering::Release);
            BodyRead::Produced(produced)
        } else if state.finished {
            BodyRead::Finished
        } else {
            BodyRead::Suspend
        }
    }

    /// Next run of at most `max` framed bytes, or `None` at end of stream.
    pub fn poll_chunk(&self, cx: &mut Context<'_>, max: usize) -> Poll<Option<Bytes>> {
        let mut buffer = vec![0; max.max(1)];
        match self.read(&mut buffer) {
            BodyRead::Produced(count) => {
                buffer.truncate(count);
                return Poll::Ready(Some(Bytes::from(buffer)));
            }
            BodyRead::Finished => return Poll::Ready(None),
            BodyRead::Suspend => {}
        }
        self.shared.waker.register(cx.waker());
        // A feed may have landed between the first read and the registration.
        match self.read(&mut buffer) {
            BodyRead::Produced(count) => {
                buffer.truncate(count);
                Poll::Ready(Some(Bytes::from(buffer)))
            }
            BodyRead::Finished => Poll::Ready(None),
            BodyRead::Suspend => Poll::Pending,
        }
    }

    pub async fn next_chunk(&self, max: usize) -> Option<Bytes> {
        poll_fn(|cx| self.poll_chunk(cx, max)).await
    }
}

impl Body for FeedableBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.poll_chunk(cx, DEFAULT_PULL_SIZE)
            .map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }

    fn is_end_stream(&self) -> bool {
        self.is_finished()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

impl std::fmt::Debug for FeedableBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("FeedableBody")
            .field("chunked", &self.is_chunked())
            .field("finished", &self.is_finished())
            .finish()
    }
}
