//! Per-shard session state.
//!
//! Tracks the identity of the gateway session (`session_id`, sequence,
//! resume URL), the connection status, heartbeat bookkeeping, and the
//! randomized reconnect backoff.

use std::time::{Duration, Instant};

use crate::protocol::{MAX_RECONNECT_INTERVAL_MS, Presence};

/// Connection status of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// No socket.
    Disconnected,
    /// Socket opening.
    Connecting,
    /// Socket open, waiting for Hello.
    Handshaking,
    /// Identify sent, waiting for READY.
    Identifying,
    /// Resume sent, waiting for RESUMED.
    Resuming,
    /// Session established.
    Ready,
}

impl ShardStatus {
    /// Human-readable name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
        }
    }
}

/// Session state for a single shard.
///
/// A `session_id` survives reconnects (it is what makes a resume
/// possible) until a hard reset or a close code that invalidates it.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Last observed dispatch sequence; 0 when no session.
    pub sequence: u64,
    /// Session token granted by the identify flow; `None` until the
    /// first READY.
    pub session_id: Option<String>,
    /// Normalized URL to reconnect to when resuming.
    pub resume_url: Option<String>,
    /// Connection status.
    pub status: ShardStatus,
    /// `connect()` calls since the last hard reset.
    pub connect_attempts: u32,
    /// Current reconnect backoff in milliseconds.
    pub reconnect_interval_ms: u64,
    /// READY received; guild streaming may still be in progress.
    pub pre_ready: bool,
    /// Fully ready: startup guilds and member chunking drained.
    pub ready: bool,
    /// Last requested presence.
    pub presence: Presence,
    /// When the most recent heartbeat was sent.
    pub last_heartbeat_sent: Option<Instant>,
    /// When the most recent heartbeat ACK arrived.
    pub last_heartbeat_received: Option<Instant>,
    /// Whether the most recent heartbeat has been acknowledged.
    /// `true` when no heartbeat has been sent yet.
    pub last_heartbeat_ack: bool,
    /// Round-trip latency derived from the last heartbeat cycle.
    pub latency: Option<Duration>,
}

impl SessionState {
    /// Fresh session state with the given initial presence.
    #[must_use]
    pub fn new(presence: Presence) -> Self {
        Self {
            sequence: 0,
            session_id: None,
            resume_url: None,
            status: ShardStatus::Disconnected,
            connect_attempts: 0,
            reconnect_interval_ms: 1000,
            pre_ready: false,
            ready: false,
            presence,
            last_heartbeat_sent: None,
            last_heartbeat_received: None,
            last_heartbeat_ack: true,
            latency: None,
        }
    }

    /// Returns `true` if a resume is possible.
    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Track a dispatch sequence number.
    ///
    /// The stored sequence is monotonically non-decreasing. Returns
    /// `true` when the new value skips ahead by more than one.
    pub(crate) fn track_sequence(&mut self, s: u64) -> bool {
        let gapped = self.sequence != 0 && s > self.sequence + 1;
        if s > self.sequence {
            self.sequence = s;
        }
        gapped
    }

    /// Reset transient connection state, keeping the session identity.
    ///
    /// Called on every teardown; does not touch `session_id`,
    /// `sequence`, `resume_url`, `connect_attempts`, or the backoff.
    pub(crate) fn reset(&mut self) {
        self.pre_ready = false;
        self.ready = false;
        self.last_heartbeat_sent = None;
        self.last_heartbeat_received = None;
        self.last_heartbeat_ack = true;
        self.latency = None;
    }

    /// Wipe everything back to initial values.
    pub(crate) fn hard_reset(&mut self) {
        let presence = self.presence.clone();
        *self = Self::new(presence);
    }

    /// Consume the current reconnect delay and grow the interval.
    ///
    /// Growth is `min(round(interval * (rand * 2 + 1)), 30_000)`: a
    /// randomized exponential-like progression that never decreases.
    pub(crate) fn next_reconnect_delay(&mut self) -> Duration {
        let current = self.reconnect_interval_ms;
        let factor = fastrand::f64() * 2.0 + 1.0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let grown = (self.reconnect_interval_ms as f64 * factor).round() as u64;
        self.reconnect_interval_ms = grown.min(MAX_RECONNECT_INTERVAL_MS);
        Duration::from_millis(current)
    }
}
