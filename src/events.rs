//! High-level events and the bus that broadcasts them.
//!
//! The shard normalizes dispatch packets into a closed set of typed
//! [`Event`]s and publishes them on an [`EventBus`]. The raw
//! [`Event::Packet`] variant remains untyped for observers that want
//! the wire payloads.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::GatewayError;
use crate::model::{Channel, Guild, MaybeCached, Member, Message, User};
use crate::protocol::Packet;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus delivering [`Event`]s to all subscribers, in order.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Event>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers that got the event; an event
    /// with no receivers is dropped silently.
    pub fn publish(&self, event: Event) -> usize {
        let name = event.name();
        match self.sender.send(Arc::new(event)) {
            Ok(count) => count,
            Err(_) => {
                trace!(event = name, "no receivers for event");
                0
            }
        }
    }

    /// Subscribe to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by a shard.
///
/// Update-style events carry the previous raw payload (`old`) when the
/// entity was cached; creation/deletion events carry a
/// [`MaybeCached`] when the cache may not have held the entity.
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    /// Raw gateway packet, before any routing.
    Packet {
        /// Shard that received the packet.
        shard: u32,
        /// The wire packet.
        packet: Packet,
    },
    /// A non-fatal or fatal shard error.
    Error {
        /// Shard the error belongs to.
        shard: u32,
        /// The error.
        error: GatewayError,
    },
    /// The socket opened.
    Connect {
        /// Shard that connected.
        shard: u32,
    },
    /// The connection was torn down.
    Disconnect {
        /// Shard that disconnected.
        shard: u32,
    },
    /// READY arrived; startup guilds may still be streaming in.
    ShardPreReady {
        /// Shard that finished its handshake.
        shard: u32,
    },
    /// Startup completed: guilds and member chunking drained.
    ShardReady {
        /// Shard that became ready.
        shard: u32,
    },
    /// An interrupted session resumed.
    ShardResume {
        /// Shard that resumed.
        shard: u32,
    },

    /// Joined a guild, or a startup guild finished streaming.
    GuildCreate(Guild),
    /// A previously unavailable guild came back.
    GuildAvailable(Guild),
    /// Joined a guild that is currently unavailable.
    UnavailableGuildCreate {
        /// Guild ID.
        id: String,
    },
    /// A guild was updated.
    GuildUpdate {
        /// The updated guild.
        guild: Guild,
        /// Raw payload before the update.
        old: Value,
    },
    /// Left or was removed from a guild.
    GuildDelete {
        /// The cached guild, or a stub when uncached.
        guild: MaybeCached<Guild>,
    },
    /// A guild became unavailable (outage).
    GuildUnavailable {
        /// Guild ID.
        id: String,
    },
    /// A user was banned.
    GuildBanAdd {
        /// Guild the ban happened in.
        guild_id: String,
        /// The cached guild, or a stub when uncached.
        guild: MaybeCached<Guild>,
        /// The banned user.
        user: User,
    },
    /// A ban was lifted.
    GuildBanRemove {
        /// Guild the ban was lifted in.
        guild_id: String,
        /// The cached guild, or a stub when uncached.
        guild: MaybeCached<Guild>,
        /// The unbanned user.
        user: User,
    },
    /// A member joined.
    GuildMemberAdd {
        /// Guild joined.
        guild_id: String,
        /// The new member.
        member: Member,
    },
    /// A member was updated.
    GuildMemberUpdate {
        /// Guild the member belongs to.
        guild_id: String,
        /// The updated member.
        member: Member,
        /// Raw payload before the update, when cached.
        old: Option<Value>,
    },
    /// A member left or was removed.
    GuildMemberRemove {
        /// Guild left.
        guild_id: String,
        /// The cached member, or a stub.
        member: MaybeCached<Member>,
    },
    /// One page of a member chunking reply.
    GuildMemberChunk {
        /// Guild the chunk belongs to.
        guild_id: String,
        /// Members delivered in this chunk.
        members: Vec<Member>,
    },
    /// A role was created.
    GuildRoleCreate {
        /// Guild the role belongs to.
        guild_id: String,
        /// Raw role payload.
        role: Value,
    },
    /// A role was updated.
    GuildRoleUpdate {
        /// Guild the role belongs to.
        guild_id: String,
        /// Raw role payload.
        role: Value,
        /// Previous raw role payload, when cached.
        old: Option<Value>,
    },
    /// A role was deleted.
    GuildRoleDelete {
        /// Guild the role belonged to.
        guild_id: String,
        /// Deleted role ID.
        role_id: String,
    },

    /// A channel was created.
    ChannelCreate(Channel),
    /// A channel was updated.
    ChannelUpdate {
        /// The updated channel.
        channel: Channel,
        /// Raw payload before the update.
        old: Value,
    },
    /// A channel was deleted.
    ChannelDelete {
        /// The cached channel, or a stub.
        channel: MaybeCached<Channel>,
    },
    /// A thread was created.
    ThreadCreate(Channel),
    /// A thread was updated.
    ThreadUpdate {
        /// The updated thread.
        thread: Channel,
        /// Raw payload before the update.
        old: Value,
    },
    /// A thread was deleted.
    ThreadDelete {
        /// The cached thread, or a stub.
        thread: MaybeCached<Channel>,
    },

    /// A message was sent.
    MessageCreate(Message),
    /// A message was edited.
    MessageUpdate {
        /// The updated message.
        message: Message,
        /// Raw payload before the update, when cached.
        old: Option<Value>,
    },
    /// A message was deleted.
    MessageDelete {
        /// Channel the message was in.
        channel_id: String,
        /// The cached message, or a stub.
        message: MaybeCached<Message>,
    },
    /// Several messages were deleted at once.
    MessageDeleteBulk {
        /// Channel the messages were in.
        channel_id: String,
        /// Deleted message IDs.
        ids: Vec<String>,
    },
    /// A reaction was added.
    MessageReactionAdd {
        /// Channel the message is in.
        channel_id: String,
        /// The cached message, or a stub.
        message: MaybeCached<Message>,
        /// Reacting user.
        user_id: String,
        /// Raw emoji payload.
        emoji: Value,
    },
    /// A reaction was removed.
    MessageReactionRemove {
        /// Channel the message is in.
        channel_id: String,
        /// The cached message, or a stub.
        message: MaybeCached<Message>,
        /// User whose reaction was removed.
        user_id: String,
        /// Raw emoji payload.
        emoji: Value,
    },
    /// All reactions were cleared from a message.
    MessageReactionRemoveAll {
        /// Channel the message is in.
        channel_id: String,
        /// The cached message, or a stub.
        message: MaybeCached<Message>,
    },
    /// Every reaction of one emoji was removed.
    MessageReactionRemoveEmoji {
        /// Channel the message is in.
        channel_id: String,
        /// The cached message, or a stub.
        message: MaybeCached<Message>,
        /// Raw emoji payload.
        emoji: Value,
    },

    /// A member's presence changed.
    PresenceUpdate {
        /// Guild the presence belongs to.
        guild_id: String,
        /// User whose presence changed.
        user_id: String,
        /// Previous raw presence, when cached.
        old: Option<Value>,
    },
    /// A user started typing.
    TypingStart {
        /// Channel being typed in.
        channel_id: String,
        /// Typing user.
        user_id: String,
        /// Guild, when not a direct message.
        guild_id: Option<String>,
    },
    /// A cached user (possibly the bot itself) was updated.
    UserUpdate {
        /// The updated user.
        user: User,
        /// Raw payload before the update, when cached.
        old: Option<Value>,
    },

    /// A member joined a voice channel.
    VoiceChannelJoin {
        /// Guild the channel belongs to.
        guild_id: String,
        /// Joining user.
        user_id: String,
        /// Channel joined.
        channel_id: String,
    },
    /// A member left a voice channel.
    VoiceChannelLeave {
        /// Guild the channel belongs to.
        guild_id: String,
        /// Leaving user.
        user_id: String,
        /// Channel left.
        channel_id: String,
    },
    /// A member moved between voice channels.
    VoiceChannelSwitch {
        /// Guild the channels belong to.
        guild_id: String,
        /// Moving user.
        user_id: String,
        /// Channel left.
        from: String,
        /// Channel joined.
        to: String,
    },
    /// A member's voice state changed within the same channel.
    VoiceStateUpdate {
        /// Guild the state belongs to.
        guild_id: String,
        /// User whose state changed.
        user_id: String,
        /// Previous raw voice state, when cached.
        old: Option<Value>,
    },

    /// A dispatch event the shard does not model.
    Unknown {
        /// Shard that received the event.
        shard: u32,
        /// Wire event name.
        name: String,
        /// Raw payload.
        data: Value,
    },
}

impl Event {
    /// Stable name of the event, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Packet { .. } => "packet",
            Self::Error { .. } => "error",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::ShardPreReady { .. } => "shardPreReady",
            Self::ShardReady { .. } => "shardReady",
            Self::ShardResume { .. } => "shardResume",
            Self::GuildCreate(_) => "guildCreate",
            Self::GuildAvailable(_) => "guildAvailable",
            Self::UnavailableGuildCreate { .. } => "unavailableGuildCreate",
            Self::GuildUpdate { .. } => "guildUpdate",
            Self::GuildDelete { .. } => "guildDelete",
            Self::GuildUnavailable { .. } => "guildUnavailable",
            Self::GuildBanAdd { .. } => "guildBanAdd",
            Self::GuildBanRemove { .. } => "guildBanRemove",
            Self::GuildMemberAdd { .. } => "guildMemberAdd",
            Self::GuildMemberUpdate { .. } => "guildMemberUpdate",
            Self::GuildMemberRemove { .. } => "guildMemberRemove",
            Self::GuildMemberChunk { .. } => "guildMemberChunk",
            Self::GuildRoleCreate { .. } => "guildRoleCreate",
            Self::GuildRoleUpdate { .. } => "guildRoleUpdate",
            Self::GuildRoleDelete { .. } => "guildRoleDelete",
            Self::ChannelCreate(_) => "channelCreate",
            Self::ChannelUpdate { .. } => "channelUpdate",
            Self::ChannelDelete { .. } => "channelDelete",
            Self::ThreadCreate(_) => "threadCreate",
            Self::ThreadUpdate { .. } => "threadUpdate",
            Self::ThreadDelete { .. } => "threadDelete",
            Self::MessageCreate(_) => "messageCreate",
            Self::MessageUpdate { .. } => "messageUpdate",
            Self::MessageDelete { .. } => "messageDelete",
            Self::MessageDeleteBulk { .. } => "messageDeleteBulk",
            Self::MessageReactionAdd { .. } => "messageReactionAdd",
            Self::MessageReactionRemove { .. } => "messageReactionRemove",
            Self::MessageReactionRemoveAll { .. } => "messageReactionRemoveAll",
            Self::MessageReactionRemoveEmoji { .. } => "messageReactionRemoveEmoji",
            Self::PresenceUpdate { .. } => "presenceUpdate",
            Self::TypingStart { .. } => "typingStart",
            Self::UserUpdate { .. } => "userUpdate",
            Self::VoiceChannelJoin { .. } => "voiceChannelJoin",
            Self::VoiceChannelLeave { .. } => "voiceChannelLeave",
            Self::VoiceChannelSwitch { .. } => "voiceChannelSwitch",
            Self::VoiceStateUpdate { .. } => "voiceStateUpdate",
            Self::Unknown { .. } => "unknown",
        }
    }
}
