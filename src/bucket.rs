//! Rate-limited dispatch queue for outbound gateway sends.
//!
//! A [`TokenBucket`] queues zero-argument thunks and runs at most
//! `capacity` of them per `interval` window. `reserved` tokens carve
//! out capacity only priority submissions may consume; priority
//! submissions are also inserted at the head of the queue. When the
//! head of the queue cannot run, a one-shot timer re-checks the queue
//! at the next window boundary.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// A queued unit of work. Thunks are fire-and-forget: failures are
/// logged and must not block the bucket.
type Thunk = Box<dyn FnOnce() + Send + 'static>;

struct Queued {
    run: Thunk,
    priority: bool,
}

struct Inner {
    capacity: u32,
    interval: Duration,
    reserved: u32,
    used: u32,
    window_start: Instant,
    queue: VecDeque<Queued>,
    timer_armed: bool,
}

/// Window-based token bucket dispatching queued thunks.
#[derive(Clone)]
pub(crate) struct TokenBucket {
    inner: Arc<Mutex<Inner>>,
}

impl TokenBucket {
    /// Create a bucket running `capacity` thunks per `interval`, with
    /// `reserved` slots usable only by priority submissions.
    pub(crate) fn new(capacity: u32, interval: Duration, reserved: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                interval,
                reserved,
                used: 0,
                window_start: Instant::now(),
                queue: VecDeque::new(),
                timer_armed: false,
            })),
        }
    }

    /// Queue a thunk. Priority thunks jump to the head of the queue
    /// and may consume reserved tokens.
    pub(crate) fn queue(&self, priority: bool, run: impl FnOnce() + Send + 'static) {
        {
            let mut inner = lock(&self.inner);
            let item = Queued {
                run: Box::new(run),
                priority,
            };
            if priority {
                inner.queue.push_front(item);
            } else {
                inner.queue.push_back(item);
            }
        }
        Self::check(&self.inner);
    }

    /// Number of thunks still waiting.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    /// Dispatch every eligible thunk at the head of the queue; arm the
    /// refill timer when the head is blocked on the current window.
    fn check(inner_arc: &Arc<Mutex<Inner>>) {
        loop {
            let item = {
                let mut inner = lock(inner_arc);
                let now = Instant::now();
                if now >= inner.window_start + inner.interval {
                    inner.used = 0;
                    inner.window_start = now;
                }

                let Some(priority) = inner.queue.front().map(|q| q.priority) else {
                    return;
                };
                let limit = if priority {
                    inner.capacity
                } else {
                    inner.capacity.saturating_sub(inner.reserved)
                };
                if inner.used >= limit {
                    if !inner.timer_armed {
                        inner.timer_armed = true;
                        let wake_at = inner.window_start + inner.interval;
                        let arc = Arc::clone(inner_arc);
                        tokio::spawn(async move {
                            tokio::time::sleep_until(wake_at).await;
                            lock(&arc).timer_armed = false;
                            Self::check(&arc);
                        });
                    }
                    return;
                }

                inner.used += 1;
                inner.queue.pop_front()
            };

            // Run outside the lock so a thunk may queue more work.
            if let Some(item) = item {
                if panic::catch_unwind(AssertUnwindSafe(item.run)).is_err() {
                    warn!("rate bucket thunk panicked");
                }
            }
        }
    }
}

fn lock(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
