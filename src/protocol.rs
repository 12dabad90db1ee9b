//! Gateway wire protocol: opcodes, close codes, intents, payloads.
//!
//! Implements the envelope and payload builders for the Discord Gateway
//! v10 protocol. Dispatch event payloads stay opaque
//! [`serde_json::Value`]; only the fields the shard itself consumes are
//! modelled.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Gateway protocol version spoken by this crate.
pub const GATEWAY_VERSION: u16 = 10;

/// Ceiling for the randomized reconnect interval, in milliseconds.
pub const MAX_RECONNECT_INTERVAL_MS: u64 = 30_000;

/// Close code sent by the shard when tearing down a resumable session.
pub(crate) const RECONNECT_CLOSE_CODE: u16 = 4999;

// ── Opcodes ──────────────────────────────────────────────────

/// Gateway opcodes.
pub mod opcode {
    /// Event dispatch (receive only).
    pub const DISPATCH: u8 = 0;
    /// Heartbeat (bidirectional).
    pub const HEARTBEAT: u8 = 1;
    /// Identify (send only).
    pub const IDENTIFY: u8 = 2;
    /// Presence update (send only).
    pub const PRESENCE_UPDATE: u8 = 3;
    /// Voice state update (send only).
    pub const VOICE_STATE_UPDATE: u8 = 4;
    /// Resume (send only).
    pub const RESUME: u8 = 6;
    /// Server requests reconnect (receive only).
    pub const RECONNECT: u8 = 7;
    /// Request guild members (send only).
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    /// Invalid session (receive only).
    pub const INVALID_SESSION: u8 = 9;
    /// Hello, carrying the heartbeat interval (receive only).
    pub const HELLO: u8 = 10;
    /// Heartbeat ACK (receive only).
    pub const HEARTBEAT_ACK: u8 = 11;
}

// ── Close codes ──────────────────────────────────────────────

/// Gateway close codes and their reconnect/session classification.
pub mod close_code {
    /// Unknown opcode sent by the client.
    pub const UNKNOWN_OPCODE: u16 = 4001;
    /// Malformed payload sent by the client.
    pub const DECODE_ERROR: u16 = 4002;
    /// Payload sent before identifying.
    pub const NOT_AUTHENTICATED: u16 = 4003;
    /// Authentication failed: bad token.
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    /// Identify sent more than once.
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    /// Invalid resume sequence.
    pub const INVALID_SEQUENCE: u16 = 4007;
    /// Payloads sent too quickly.
    pub const RATE_LIMITED: u16 = 4008;
    /// Invalid shard configuration.
    pub const INVALID_SHARD: u16 = 4010;
    /// The session would handle too many guilds.
    pub const SHARDING_REQUIRED: u16 = 4011;
    /// Invalid gateway API version.
    pub const INVALID_API_VERSION: u16 = 4012;
    /// Invalid intents bitmask.
    pub const INVALID_INTENTS: u16 = 4013;
    /// Disallowed (privileged, un-enabled) intents.
    pub const DISALLOWED_INTENTS: u16 = 4014;

    /// Returns `true` if the code is fatal: the shard must not
    /// reconnect and must hard-reset its session.
    #[must_use]
    pub fn is_fatal(code: u16) -> bool {
        matches!(
            code,
            AUTHENTICATION_FAILED
                | INVALID_SHARD
                | SHARDING_REQUIRED
                | INVALID_API_VERSION
                | INVALID_INTENTS
                | DISALLOWED_INTENTS
        )
    }

    /// Returns `true` if the code invalidates the session ID.
    #[must_use]
    pub fn clears_session(code: u16) -> bool {
        matches!(
            code,
            NOT_AUTHENTICATED
                | AUTHENTICATION_FAILED
                | INVALID_SHARD
                | SHARDING_REQUIRED
                | INVALID_API_VERSION
                | INVALID_INTENTS
                | DISALLOWED_INTENTS
        )
    }

    /// Returns `true` if the code resets the stored sequence to 0.
    #[must_use]
    pub fn resets_sequence(code: u16) -> bool {
        code == INVALID_SEQUENCE
    }

    /// Human-readable classification for a close code.
    #[must_use]
    pub fn message(code: u16) -> &'static str {
        match code {
            1000 => "Clean close",
            1001 => "Endpoint going away",
            1006 => "Connection reset by peer",
            UNKNOWN_OPCODE => "Gateway received an invalid opcode",
            DECODE_ERROR => "Gateway received an invalid message",
            NOT_AUTHENTICATED => "Not authenticated",
            AUTHENTICATION_FAILED => "Invalid Token",
            ALREADY_AUTHENTICATED => "Already authenticated",
            INVALID_SEQUENCE => "Invalid sequence number",
            RATE_LIMITED => "Gateway connection was rate limited",
            INVALID_SHARD => "Invalid shard key",
            SHARDING_REQUIRED => "Shard would handle too many guilds",
            INVALID_API_VERSION => "Invalid API version",
            INVALID_INTENTS => "Invalid intents",
            DISALLOWED_INTENTS => "Disallowed intents",
            _ => "Unknown close code",
        }
    }
}

// ── Intents ──────────────────────────────────────────────────

/// Gateway intent bits.
pub mod intents {
    /// Guild create/update/delete, channels, threads, roles.
    pub const GUILDS: u32 = 1 << 0;
    /// Member add/update/remove and full member chunking (privileged).
    pub const GUILD_MEMBERS: u32 = 1 << 1;
    /// Bans and audit-log moderation events.
    pub const GUILD_MODERATION: u32 = 1 << 2;
    /// Emoji and sticker updates.
    pub const GUILD_EXPRESSIONS: u32 = 1 << 3;
    /// Integration updates.
    pub const GUILD_INTEGRATIONS: u32 = 1 << 4;
    /// Webhook updates.
    pub const GUILD_WEBHOOKS: u32 = 1 << 5;
    /// Invite create/delete.
    pub const GUILD_INVITES: u32 = 1 << 6;
    /// Voice state updates.
    pub const GUILD_VOICE_STATES: u32 = 1 << 7;
    /// Presence updates (privileged).
    pub const GUILD_PRESENCES: u32 = 1 << 8;
    /// Guild message create/update/delete.
    pub const GUILD_MESSAGES: u32 = 1 << 9;
    /// Guild message reactions.
    pub const GUILD_MESSAGE_REACTIONS: u32 = 1 << 10;
    /// Guild typing notifications.
    pub const GUILD_MESSAGE_TYPING: u32 = 1 << 11;
    /// Direct message create/update/delete.
    pub const DIRECT_MESSAGES: u32 = 1 << 12;
    /// Direct message reactions.
    pub const DIRECT_MESSAGE_REACTIONS: u32 = 1 << 13;
    /// Direct message typing notifications.
    pub const DIRECT_MESSAGE_TYPING: u32 = 1 << 14;
    /// Message content (privileged).
    pub const MESSAGE_CONTENT: u32 = 1 << 15;

    /// Every non-privileged intent.
    pub const ALL_NON_PRIVILEGED: u32 = GUILDS
        | GUILD_MODERATION
        | GUILD_EXPRESSIONS
        | GUILD_INTEGRATIONS
        | GUILD_WEBHOOKS
        | GUILD_INVITES
        | GUILD_VOICE_STATES
        | GUILD_MESSAGES
        | GUILD_MESSAGE_REACTIONS
        | GUILD_MESSAGE_TYPING
        | DIRECT_MESSAGES
        | DIRECT_MESSAGE_REACTIONS
        | DIRECT_MESSAGE_TYPING;
}

// ── Wire envelope ────────────────────────────────────────────

/// Raw gateway packet as received/sent over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Opcode for the packet.
    pub op: u8,
    /// Payload (opcode-dependent, opaque).
    #[serde(default)]
    pub d: Option<Value>,
    /// Sequence number (dispatch packets only).
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name (dispatch packets only).
    #[serde(default)]
    pub t: Option<String>,
}

/// Hello payload (`op=10`).
#[derive(Debug, Deserialize)]
pub(crate) struct HelloData {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

// ── Presence ─────────────────────────────────────────────────

/// Online status carried in a presence update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Shown as online.
    Online,
    /// Shown as do-not-disturb.
    Dnd,
    /// Shown as idle.
    Idle,
    /// Connected but shown as offline.
    Invisible,
    /// Offline.
    Offline,
}

impl PresenceStatus {
    /// Wire representation of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Dnd => "dnd",
            Self::Idle => "idle",
            Self::Invisible => "invisible",
            Self::Offline => "offline",
        }
    }
}

/// A requested presence, sent with identify and presence updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    /// Online status.
    pub status: PresenceStatus,
    /// Whether the session is marked away-from-keyboard.
    pub afk: bool,
    /// Epoch milliseconds since the session went idle.
    pub since: Option<u64>,
    /// Activity objects, forwarded verbatim.
    pub activities: Vec<Value>,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            status: PresenceStatus::Online,
            afk: false,
            since: None,
            activities: Vec::new(),
        }
    }
}

impl Presence {
    /// Wire payload for `op=3` (also embedded in identify).
    #[must_use]
    pub(crate) fn to_payload(&self) -> Value {
        json!({
            "status": self.status.as_str(),
            "afk": self.afk,
            "since": self.since,
            "activities": self.activities,
        })
    }
}

// ── Payload builders ─────────────────────────────────────────

/// Parameters for the identify payload.
pub(crate) struct IdentifyParams<'a> {
    /// Bot token.
    pub token: &'a str,
    /// Intent bitmask.
    pub intents: u32,
    /// Whether transport compression was requested.
    pub compress: bool,
    /// Member-list threshold for large guilds.
    pub large_threshold: u64,
    /// `[shard index, shard count]`.
    pub shard: (u32, u32),
    /// Initial presence.
    pub presence: &'a Presence,
    /// Connection property reported as `browser`.
    pub browser: &'a str,
    /// Connection property reported as `device`.
    pub device: &'a str,
}

/// Build the identify payload (`op=2`).
pub(crate) fn build_identify(params: &IdentifyParams<'_>) -> Value {
    json!({
        "token": params.token,
        "properties": {
            "os": std::env::consts::OS,
            "browser": params.browser,
            "device": params.device,
        },
        "compress": params.compress,
        "large_threshold": params.large_threshold,
        "shard": [params.shard.0, params.shard.1],
        "presence": params.presence.to_payload(),
        "intents": params.intents,
    })
}

/// Build the resume payload (`op=6`).
pub(crate) fn build_resume(token: &str, session_id: &str, sequence: u64) -> Value {
    json!({
        "token": token,
        "session_id": session_id,
        "seq": sequence,
    })
}

/// Build the heartbeat payload (`op=1`): the last observed sequence.
pub(crate) fn build_heartbeat(sequence: u64) -> Value {
    Value::from(sequence)
}

/// Build the voice state payload (`op=4`).
pub(crate) fn build_voice_state(
    guild_id: &str,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> Value {
    json!({
        "guild_id": guild_id,
        "channel_id": channel_id,
        "self_mute": self_mute,
        "self_deaf": self_deaf,
    })
}

// ── Endpoint URLs ────────────────────────────────────────────

/// Build the connect URL for a fresh session.
pub(crate) fn gateway_connect_url(base: &str, encoding: &str, compress: bool) -> String {
    let base = base.trim_end_matches('/');
    let mut url = format!("{base}/?v={GATEWAY_VERSION}&encoding={encoding}");
    if compress {
        url.push_str("&compress=zlib-stream");
    }
    url
}

/// Normalize a `resume_gateway_url` from READY: strip any query, then
/// re-append the version and encoding parameters.
pub(crate) fn normalize_resume_url(raw: &str, encoding: &str) -> String {
    let base = raw.split('?').next().unwrap_or(raw);
    let base = base.trim_end_matches('/');
    format!("{base}/?v={GATEWAY_VERSION}&encoding={encoding}")
}
