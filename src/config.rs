//! Shard configuration.

use std::time::Duration;

use crate::protocol::{Presence, intents};

/// Configuration shared by every shard of a client.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    /// Gateway URL used for fresh (non-resume) connections.
    pub gateway_url: String,
    /// Gateway intent bitmask.
    pub intents: u32,
    /// Request zlib-stream transport compression.
    pub compress: bool,
    /// Member-list threshold for large guilds (identify field).
    pub large_threshold: u64,
    /// Total number of shards in the session.
    pub shard_count: u32,
    /// Reconnect automatically on non-fatal connection loss.
    pub autoreconnect: bool,
    /// Time allowed for the socket to open and Hello to arrive.
    pub connect_timeout: Duration,
    /// Quiet period after which a starting shard stops waiting for
    /// further `GUILD_CREATE` packets and completes readiness.
    pub guild_create_timeout: Duration,
    /// Default timeout for guild member requests.
    pub request_timeout: Duration,
    /// Resume attempts allowed before the session is invalidated and
    /// the shard re-identifies.
    pub max_reconnect_attempts: u32,
    /// Chunk every guild's full member list while starting up.
    /// Requires the `GUILD_MEMBERS` intent.
    pub fetch_all_members: bool,
    /// Messages cached per channel; the oldest are evicted first.
    pub message_limit: usize,
    /// Presence requested at identify time.
    pub presence: Presence,
    /// Connection property reported as `browser`.
    pub browser: String,
    /// Connection property reported as `device`.
    pub device: String,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            gateway_url: "wss://gateway.discord.gg".to_string(),
            intents: intents::ALL_NON_PRIVILEGED,
            compress: false,
            large_threshold: 250,
            shard_count: 1,
            autoreconnect: true,
            connect_timeout: Duration::from_secs(30),
            guild_create_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(15),
            max_reconnect_attempts: 5,
            fetch_all_members: false,
            message_limit: 100,
            presence: Presence::default(),
            browser: "corvus".to_string(),
            device: "corvus".to_string(),
        }
    }
}
