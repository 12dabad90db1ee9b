//! Serialized outbound send path.
//!
//! Every outbound packet passes through the global token bucket;
//! presence updates additionally need a ticket from the presence
//! bucket. A send scheduled on both buckets runs as a join barrier:
//! the thunk is queued on each bucket and only the final arrival
//! performs the send. Payloads are encoded at fire time, and dropped
//! (never queued across reconnects) whenever the socket is not open.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{trace, warn};

use crate::bucket::TokenBucket;
use crate::codec::{self, Encoding};
use crate::protocol::opcode;

/// Global bucket: 120 sends per 60 s, 5 slots reserved for priority.
const GLOBAL_CAPACITY: u32 = 120;
const GLOBAL_INTERVAL: Duration = Duration::from_secs(60);
const GLOBAL_RESERVED: u32 = 5;

/// Presence bucket: 5 presence updates per 20 s.
const PRESENCE_CAPACITY: u32 = 5;
const PRESENCE_INTERVAL: Duration = Duration::from_secs(20);

type WsTx = mpsc::UnboundedSender<Message>;

/// Rate-limited, serialized writer front-end for one shard.
///
/// The buckets live for the shard's lifetime; the socket sender is
/// attached per connection and detached at teardown, which makes any
/// still-queued thunks drop their payloads at fire time.
pub(crate) struct OutboundSender {
    encoding: Encoding,
    global: TokenBucket,
    presence: TokenBucket,
    ws: Arc<Mutex<Option<WsTx>>>,
}

impl OutboundSender {
    pub(crate) fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            global: TokenBucket::new(GLOBAL_CAPACITY, GLOBAL_INTERVAL, GLOBAL_RESERVED),
            presence: TokenBucket::new(PRESENCE_CAPACITY, PRESENCE_INTERVAL, 0),
            ws: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach the current connection's writer channel.
    pub(crate) fn attach(&self, tx: WsTx) {
        *lock(&self.ws) = Some(tx);
    }

    /// Detach the writer channel; queued sends drop from here on.
    pub(crate) fn detach(&self) {
        *lock(&self.ws) = None;
    }

    /// Whether a socket is currently attached.
    pub(crate) fn is_attached(&self) -> bool {
        lock(&self.ws).is_some()
    }

    /// Queue an `{op, d}` send. Priority sends jump the queue and may
    /// use the reserved global tokens.
    pub(crate) fn send(&self, op: u8, data: Value, priority: bool) {
        if !self.is_attached() {
            trace!(op, "dropping send, socket not open");
            return;
        }

        let ws = Arc::clone(&self.ws);
        let encoding = self.encoding;
        let fire = move || {
            let guard = lock(&ws);
            let Some(tx) = guard.as_ref() else {
                trace!(op, "dropping queued send, socket closed");
                return;
            };
            match codec::encode_packet(op, &data, encoding) {
                Ok(frame) => {
                    trace!(op, payload = %redact_token(&data), "sending gateway packet");
                    let _ = tx.send(frame);
                }
                Err(error) => {
                    warn!(op, error = %error, "failed to encode outbound packet");
                }
            }
        };

        if op == opcode::PRESENCE_UPDATE {
            let mut thunks = join_barrier(2, fire);
            // Both tickets must be held before the send fires.
            if let Some(thunk) = thunks.pop() {
                self.presence.queue(priority, thunk);
            }
            if let Some(thunk) = thunks.pop() {
                self.global.queue(priority, thunk);
            }
        } else {
            self.global.queue(priority, fire);
        }
    }
}

/// Split one closure into `parts` thunks; only the last one to run
/// performs the work.
fn join_barrier(
    parts: usize,
    run: impl FnOnce() + Send + 'static,
) -> Vec<Box<dyn FnOnce() + Send + 'static>> {
    let counter = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> =
        Arc::new(Mutex::new(Some(Box::new(run))));
    (0..parts)
        .map(|_| {
            let counter = Arc::clone(&counter);
            let slot = Arc::clone(&slot);
            Box::new(move || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == parts {
                    let run = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let Some(run) = run {
                        run();
                    }
                }
            }) as Box<dyn FnOnce() + Send + 'static>
        })
        .collect()
}

/// Render a payload for trace logs with the token field blanked.
fn redact_token(data: &Value) -> String {
    match data.as_object() {
        Some(object) if object.contains_key("token") => {
            let mut clone = object.clone();
            clone.insert("token".to_string(), Value::from("[REDACTED]"));
            Value::Object(clone).to_string()
        }
        _ => data.to_string(),
    }
}

fn lock(ws: &Arc<Mutex<Option<WsTx>>>) -> MutexGuard<'_, Option<WsTx>> {
    ws.lock().unwrap_or_else(PoisonError::into_inner)
}
