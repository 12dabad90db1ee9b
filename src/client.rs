//! The client capability handle.
//!
//! A [`Client`] is what a shard is constructed against: it owns the
//! auth token, the shared options, the entity caches, and the event
//! bus. Shards mutate the caches while dispatching and emit events
//! through the bus; the client itself never talks to the network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::ShardOptions;
use crate::events::{Event, EventBus};
use crate::model::{Guild, User};

/// Shared client state: token, options, caches, and the event bus.
///
/// Cheap to clone; all clones point at the same state.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    token: String,
    options: ShardOptions,
    bus: EventBus,
    user: RwLock<Option<User>>,
    application: RwLock<Option<Value>>,
    guilds: RwLock<HashMap<String, Guild>>,
    users: RwLock<HashMap<String, User>>,
    unavailable_guilds: RwLock<HashSet<String>>,
    guild_shard_map: RwLock<HashMap<String, u32>>,
    channel_guild_map: RwLock<HashMap<String, String>>,
    thread_guild_map: RwLock<HashMap<String, String>>,
}

impl Client {
    /// Create a client from a bot token and shard options.
    #[must_use]
    pub fn new(token: impl Into<String>, options: ShardOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                token: token.into(),
                options,
                bus: EventBus::new(),
                user: RwLock::new(None),
                application: RwLock::new(None),
                guilds: RwLock::new(HashMap::new()),
                users: RwLock::new(HashMap::new()),
                unavailable_guilds: RwLock::new(HashSet::new()),
                guild_shard_map: RwLock::new(HashMap::new()),
                channel_guild_map: RwLock::new(HashMap::new()),
                thread_guild_map: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The bot token. Read-only; the shard never mutates options.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// The shared shard options.
    #[must_use]
    pub fn options(&self) -> &ShardOptions {
        &self.inner.options
    }

    /// Base gateway URL for fresh connections.
    #[must_use]
    pub fn gateway_url(&self) -> String {
        self.inner.options.gateway_url.clone()
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.bus.subscribe()
    }

    /// Publish an event on the client's bus.
    pub fn emit(&self, event: Event) -> usize {
        self.inner.bus.publish(event)
    }

    /// The bot's own user, once READY has been seen.
    #[must_use]
    pub fn user(&self) -> Option<User> {
        read(&self.inner.user).clone()
    }

    /// The application object from READY.
    #[must_use]
    pub fn application(&self) -> Option<Value> {
        read(&self.inner.application).clone()
    }

    /// Snapshot of a cached guild.
    #[must_use]
    pub fn guild(&self, id: &str) -> Option<Guild> {
        read(&self.inner.guilds).get(id).cloned()
    }

    /// Snapshot of a cached user.
    #[must_use]
    pub fn cached_user(&self, id: &str) -> Option<User> {
        read(&self.inner.users).get(id).cloned()
    }

    /// IDs of guilds currently marked unavailable.
    #[must_use]
    pub fn unavailable_guilds(&self) -> HashSet<String> {
        read(&self.inner.unavailable_guilds).clone()
    }

    /// Shard that owns a guild.
    #[must_use]
    pub fn guild_shard(&self, guild_id: &str) -> Option<u32> {
        read(&self.inner.guild_shard_map).get(guild_id).copied()
    }

    /// Guild that owns a channel.
    #[must_use]
    pub fn guild_for_channel(&self, channel_id: &str) -> Option<String> {
        read(&self.inner.channel_guild_map).get(channel_id).cloned()
    }

    /// Guild that owns a thread.
    #[must_use]
    pub fn guild_for_thread(&self, thread_id: &str) -> Option<String> {
        read(&self.inner.thread_guild_map).get(thread_id).cloned()
    }

    // ── Cache guards (dispatch-internal) ─────────────────────

    pub(crate) fn set_user(&self, user: User) {
        *write(&self.inner.user) = Some(user);
    }

    pub(crate) fn set_application(&self, application: Option<Value>) {
        *write(&self.inner.application) = application;
    }

    pub(crate) fn guilds_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Guild>> {
        write(&self.inner.guilds)
    }

    pub(crate) fn users_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, User>> {
        write(&self.inner.users)
    }

    pub(crate) fn unavailable_mut(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        write(&self.inner.unavailable_guilds)
    }

    pub(crate) fn guild_shard_map_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, u32>> {
        write(&self.inner.guild_shard_map)
    }

    pub(crate) fn channel_guild_map_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        write(&self.inner.channel_guild_map)
    }

    pub(crate) fn thread_guild_map_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        write(&self.inner.thread_guild_map)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
