//! Cached entity views.
//!
//! The shard does not validate entity schemas; these types are thin
//! typed views over the raw payloads, modelling only the fields the
//! dispatch router reads or mutates. The full payload is kept in `raw`
//! for consumers. The `update` methods are the cache-internal
//! mutators invoked by the router.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

/// Either a cached entity or a bare-ID stub for an entity the cache
/// never held.
#[derive(Debug, Clone)]
pub enum MaybeCached<T> {
    /// The entity was cached at event time.
    Cached(T),
    /// The cache had no entry; only the ID is known.
    Stub {
        /// Entity ID.
        id: String,
    },
}

impl<T: HasId> MaybeCached<T> {
    /// The entity ID, cached or not.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Cached(entity) => entity.id(),
            Self::Stub { id } => id,
        }
    }
}

impl<T> MaybeCached<T> {
    /// Build from an optional cache hit.
    pub(crate) fn from_cache(cached: Option<T>, id: String) -> Self {
        match cached {
            Some(entity) => Self::Cached(entity),
            None => Self::Stub { id },
        }
    }
}

/// Entities addressable by a snowflake ID.
pub trait HasId {
    /// The entity's ID.
    fn id(&self) -> &str;
}

/// Extract a string field from a payload.
pub(crate) fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)?.as_str().map(str::to_owned)
}

/// Parse an ISO-8601 date string into epoch milliseconds.
pub(crate) fn parse_timestamp(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Reactions map key: `name` for unicode emoji, `name:id` for custom.
pub(crate) fn emoji_key(emoji: &Value) -> String {
    let name = emoji
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match emoji.get("id").and_then(Value::as_str) {
        Some(id) => format!("{name}:{id}"),
        None => name.to_owned(),
    }
}

/// Shallow-merge `patch`'s object fields over `raw`.
fn merge_raw(raw: &mut Value, patch: &Value) {
    let Some(source) = patch.as_object() else {
        *raw = patch.clone();
        return;
    };
    if !raw.is_object() {
        *raw = patch.clone();
        return;
    }
    if let Some(target) = raw.as_object_mut() {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
}

// ── User ─────────────────────────────────────────────────────

/// A cached user.
#[derive(Debug, Clone)]
pub struct User {
    /// User ID.
    pub id: String,
    /// Username.
    pub username: String,
    /// Whether the account is a bot.
    pub bot: bool,
    /// Full raw payload.
    pub raw: Value,
}

impl User {
    /// Build from a raw user payload; `None` without an `id`.
    #[must_use]
    pub fn from_value(data: &Value) -> Option<Self> {
        Some(Self {
            id: str_field(data, "id")?,
            username: str_field(data, "username").unwrap_or_default(),
            bot: data.get("bot").and_then(Value::as_bool).unwrap_or(false),
            raw: data.clone(),
        })
    }

    pub(crate) fn update(&mut self, data: &Value) {
        if let Some(username) = str_field(data, "username") {
            self.username = username;
        }
        merge_raw(&mut self.raw, data);
    }
}

impl HasId for User {
    fn id(&self) -> &str {
        &self.id
    }
}

// ── Member ───────────────────────────────────────────────────

/// A cached guild member.
#[derive(Debug, Clone)]
pub struct Member {
    /// User ID of the member.
    pub id: String,
    /// The member's user object, when the payload carried one.
    pub user: Option<User>,
    /// Guild nickname.
    pub nick: Option<String>,
    /// Role IDs.
    pub roles: Vec<String>,
    /// Join time, epoch milliseconds.
    pub joined_at: Option<i64>,
    /// Server-deafened.
    pub deaf: bool,
    /// Server-muted.
    pub mute: bool,
    /// Last known raw presence, attached from presence payloads.
    pub presence: Option<Value>,
    /// Full raw payload.
    pub raw: Value,
}

impl Member {
    /// Build from a raw member payload. The ID comes from the nested
    /// `user` object, or `id`/`user_id` for partial payloads.
    #[must_use]
    pub fn from_value(data: &Value) -> Option<Self> {
        let user = data.get("user").and_then(User::from_value);
        let id = user
            .as_ref()
            .map(|u| u.id.clone())
            .or_else(|| str_field(data, "id"))
            .or_else(|| str_field(data, "user_id"))?;
        Some(Self {
            id,
            user,
            nick: str_field(data, "nick"),
            roles: string_list(data.get("roles")),
            joined_at: data
                .get("joined_at")
                .and_then(Value::as_str)
                .and_then(parse_timestamp),
            deaf: data.get("deaf").and_then(Value::as_bool).unwrap_or(false),
            mute: data.get("mute").and_then(Value::as_bool).unwrap_or(false),
            presence: None,
            raw: data.clone(),
        })
    }

    pub(crate) fn update(&mut self, data: &Value) {
        if let Some(user) = data.get("user") {
            match &mut self.user {
                Some(existing) => existing.update(user),
                None => self.user = User::from_value(user),
            }
        }
        if data.get("nick").is_some() {
            self.nick = str_field(data, "nick");
        }
        if let Some(roles) = data.get("roles") {
            self.roles = string_list(Some(roles));
        }
        if let Some(deaf) = data.get("deaf").and_then(Value::as_bool) {
            self.deaf = deaf;
        }
        if let Some(mute) = data.get("mute").and_then(Value::as_bool) {
            self.mute = mute;
        }
        merge_raw(&mut self.raw, data);
    }
}

impl HasId for Member {
    fn id(&self) -> &str {
        &self.id
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

// ── Message ──────────────────────────────────────────────────

/// Per-emoji reaction bookkeeping on a cached message.
#[derive(Debug, Clone, Default)]
pub struct Reaction {
    /// Number of users who reacted.
    pub count: u64,
    /// Whether the bot's own user is among them.
    pub me: bool,
}

/// A cached message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message ID.
    pub id: String,
    /// Channel the message was sent in.
    pub channel_id: String,
    /// Guild, when not a direct message.
    pub guild_id: Option<String>,
    /// Author, when the payload carried one.
    pub author: Option<User>,
    /// Message content.
    pub content: String,
    /// Send time, epoch milliseconds.
    pub timestamp: Option<i64>,
    /// Reactions keyed by emoji (`name` or `name:id`).
    pub reactions: HashMap<String, Reaction>,
    /// Full raw payload.
    pub raw: Value,
}

impl Message {
    /// Build from a raw message payload; `None` without `id` and
    /// `channel_id`.
    #[must_use]
    pub fn from_value(data: &Value) -> Option<Self> {
        Some(Self {
            id: str_field(data, "id")?,
            channel_id: str_field(data, "channel_id")?,
            guild_id: str_field(data, "guild_id"),
            author: data.get("author").and_then(User::from_value),
            content: str_field(data, "content").unwrap_or_default(),
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_timestamp),
            reactions: HashMap::new(),
            raw: data.clone(),
        })
    }

    pub(crate) fn update(&mut self, data: &Value) {
        if let Some(content) = str_field(data, "content") {
            self.content = content;
        }
        merge_raw(&mut self.raw, data);
    }
}

impl HasId for Message {
    fn id(&self) -> &str {
        &self.id
    }
}

// ── Channel ──────────────────────────────────────────────────

/// Channel type: guild voice.
pub const CHANNEL_TYPE_VOICE: u8 = 2;
/// Channel type: stage voice.
pub const CHANNEL_TYPE_STAGE: u8 = 13;

/// A cached channel (or thread).
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel ID.
    pub id: String,
    /// Wire channel type.
    pub kind: u8,
    /// Owning guild, when not a direct message channel.
    pub guild_id: Option<String>,
    /// Channel name.
    pub name: Option<String>,
    /// Cached messages by ID.
    pub messages: HashMap<String, Message>,
    /// Insertion order of cached messages, oldest first.
    message_order: VecDeque<String>,
    /// Full raw payload.
    pub raw: Value,
}

impl Channel {
    /// Build from a raw channel payload; `None` without an `id`.
    #[must_use]
    pub fn from_value(data: &Value) -> Option<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let kind = data.get("type").and_then(Value::as_u64).unwrap_or(0) as u8;
        Some(Self {
            id: str_field(data, "id")?,
            kind,
            guild_id: str_field(data, "guild_id"),
            name: str_field(data, "name"),
            messages: HashMap::new(),
            message_order: VecDeque::new(),
            raw: data.clone(),
        })
    }

    /// Whether members can hold a voice state in this channel.
    #[must_use]
    pub fn is_voice(&self) -> bool {
        self.kind == CHANNEL_TYPE_VOICE || self.kind == CHANNEL_TYPE_STAGE
    }

    pub(crate) fn update(&mut self, data: &Value) {
        if data.get("name").is_some() {
            self.name = str_field(data, "name");
        }
        if let Some(kind) = data.get("type").and_then(Value::as_u64) {
            #[allow(clippy::cast_possible_truncation)]
            {
                self.kind = kind as u8;
            }
        }
        merge_raw(&mut self.raw, data);
    }

    /// Cache a message, evicting the oldest past `limit`.
    pub(crate) fn add_message(&mut self, message: Message, limit: usize) {
        if limit == 0 {
            return;
        }
        if self.messages.insert(message.id.clone(), message.clone()).is_none() {
            self.message_order.push_back(message.id);
        }
        while self.message_order.len() > limit {
            if let Some(evicted) = self.message_order.pop_front() {
                self.messages.remove(&evicted);
            }
        }
    }

    /// Drop a message from the cache.
    pub(crate) fn remove_message(&mut self, id: &str) -> Option<Message> {
        self.message_order.retain(|m| m != id);
        self.messages.remove(id)
    }
}

impl HasId for Channel {
    fn id(&self) -> &str {
        &self.id
    }
}

// ── Voice state ──────────────────────────────────────────────

/// A cached voice state.
#[derive(Debug, Clone)]
pub struct VoiceState {
    /// User the state belongs to.
    pub user_id: String,
    /// Occupied voice channel, if any.
    pub channel_id: Option<String>,
    /// Voice session ID.
    pub session_id: Option<String>,
    /// Server-deafened.
    pub deaf: bool,
    /// Server-muted.
    pub mute: bool,
    /// Self-deafened.
    pub self_deaf: bool,
    /// Self-muted.
    pub self_mute: bool,
    /// Full raw payload.
    pub raw: Value,
}

impl VoiceState {
    /// Build from a raw voice state payload; `None` without a user ID.
    #[must_use]
    pub fn from_value(data: &Value) -> Option<Self> {
        let user_id = str_field(data, "user_id")
            .or_else(|| data.get("member").and_then(|m| m.get("user")).and_then(|u| str_field(u, "id")))?;
        Some(Self {
            user_id,
            channel_id: str_field(data, "channel_id"),
            session_id: str_field(data, "session_id"),
            deaf: data.get("deaf").and_then(Value::as_bool).unwrap_or(false),
            mute: data.get("mute").and_then(Value::as_bool).unwrap_or(false),
            self_deaf: data
                .get("self_deaf")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            self_mute: data
                .get("self_mute")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            raw: data.clone(),
        })
    }
}

// ── Guild ────────────────────────────────────────────────────

/// A cached guild.
#[derive(Debug, Clone)]
pub struct Guild {
    /// Guild ID.
    pub id: String,
    /// Guild name.
    pub name: Option<String>,
    /// Whether the guild is currently unavailable.
    pub unavailable: bool,
    /// Whether the guild crossed the large threshold at identify.
    pub large: bool,
    /// Total member count reported by the gateway.
    pub member_count: u64,
    /// Join time, epoch milliseconds.
    pub joined_at: Option<i64>,
    /// Channels by ID.
    pub channels: HashMap<String, Channel>,
    /// Active threads by ID.
    pub threads: HashMap<String, Channel>,
    /// Cached members by user ID.
    pub members: HashMap<String, Member>,
    /// Raw roles by role ID.
    pub roles: HashMap<String, Value>,
    /// Voice states by user ID.
    pub voice_states: HashMap<String, VoiceState>,
    /// Full raw payload.
    pub raw: Value,
}

impl Guild {
    /// Build from a raw guild payload; `None` without an `id`.
    #[must_use]
    pub fn from_value(data: &Value) -> Option<Self> {
        let id = str_field(data, "id")?;
        let mut guild = Self {
            id: id.clone(),
            name: str_field(data, "name"),
            unavailable: data
                .get("unavailable")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            large: data.get("large").and_then(Value::as_bool).unwrap_or(false),
            member_count: data
                .get("member_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            joined_at: data
                .get("joined_at")
                .and_then(Value::as_str)
                .and_then(parse_timestamp),
            channels: HashMap::new(),
            threads: HashMap::new(),
            members: HashMap::new(),
            roles: HashMap::new(),
            voice_states: HashMap::new(),
            raw: data.clone(),
        };

        for raw in array_items(data, "channels") {
            if let Some(mut channel) = Channel::from_value(raw) {
                channel.guild_id.get_or_insert_with(|| id.clone());
                guild.channels.insert(channel.id.clone(), channel);
            }
        }
        for raw in array_items(data, "threads") {
            if let Some(mut thread) = Channel::from_value(raw) {
                thread.guild_id.get_or_insert_with(|| id.clone());
                guild.threads.insert(thread.id.clone(), thread);
            }
        }
        for raw in array_items(data, "members") {
            if let Some(member) = Member::from_value(raw) {
                guild.members.insert(member.id.clone(), member);
            }
        }
        for raw in array_items(data, "roles") {
            if let Some(role_id) = str_field(raw, "id") {
                guild.roles.insert(role_id, raw.clone());
            }
        }
        for raw in array_items(data, "voice_states") {
            if let Some(state) = VoiceState::from_value(raw) {
                guild.voice_states.insert(state.user_id.clone(), state);
            }
        }
        for raw in array_items(data, "presences") {
            if let Some(user_id) = raw.get("user").and_then(|u| str_field(u, "id")) {
                if let Some(member) = guild.members.get_mut(&user_id) {
                    member.presence = Some(raw.clone());
                }
            }
        }

        Some(guild)
    }

    /// Update scalar fields from a partial payload. Collections are
    /// maintained by their own dispatch events.
    pub(crate) fn update(&mut self, data: &Value) {
        if data.get("name").is_some() {
            self.name = str_field(data, "name");
        }
        if let Some(unavailable) = data.get("unavailable").and_then(Value::as_bool) {
            self.unavailable = unavailable;
        }
        if let Some(large) = data.get("large").and_then(Value::as_bool) {
            self.large = large;
        }
        if let Some(count) = data.get("member_count").and_then(Value::as_u64) {
            self.member_count = count;
        }
        merge_raw(&mut self.raw, data);
    }
}

impl HasId for Guild {
    fn id(&self) -> &str {
        &self.id
    }
}

fn array_items<'a>(data: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn emoji_keys() {
        assert_eq!(emoji_key(&json!({"name": "👍", "id": null})), "👍");
        assert_eq!(
            emoji_key(&json!({"name": "corvid", "id": "1234"})),
            "corvid:1234"
        );
    }

    #[test]
    fn timestamps_become_epoch_millis() {
        let ms = parse_timestamp("2026-01-01T00:00:00+00:00").unwrap();
        assert_eq!(ms, 1_767_225_600_000);
        assert!(parse_timestamp("yesterday-ish").is_none());
    }

    #[test]
    fn member_id_falls_back_through_shapes() {
        let from_user = Member::from_value(&json!({"user": {"id": "u1"}})).unwrap();
        assert_eq!(from_user.id, "u1");

        let from_id = Member::from_value(&json!({"id": "u2"})).unwrap();
        assert_eq!(from_id.id, "u2");

        assert!(Member::from_value(&json!({"nick": "nameless"})).is_none());
    }

    #[test]
    fn member_update_changes_flags_and_keeps_raw() {
        let mut member = Member::from_value(&json!({
            "user": {"id": "u1", "username": "ada"},
            "deaf": false,
            "mute": false,
            "roles": ["r1"],
        }))
        .unwrap();

        member.update(&json!({"deaf": true, "roles": ["r1", "r2"]}));
        assert!(member.deaf);
        assert_eq!(member.roles, vec!["r1", "r2"]);
        assert_eq!(member.raw["user"]["username"], "ada");
    }

    #[test]
    fn guild_from_value_builds_collections() {
        let guild = Guild::from_value(&json!({
            "id": "g1",
            "name": "workshop",
            "member_count": 2,
            "channels": [
                {"id": "c1", "type": 0, "name": "general"},
                {"id": "c2", "type": 2, "name": "voice"},
            ],
            "members": [
                {"user": {"id": "u1", "username": "ada"}},
                {"user": {"id": "u2", "username": "grace"}},
            ],
            "roles": [{"id": "r1", "name": "admin"}],
            "voice_states": [{"user_id": "u1", "channel_id": "c2"}],
            "presences": [{"user": {"id": "u1"}, "status": "online"}],
        }))
        .unwrap();

        assert_eq!(guild.channels.len(), 2);
        assert_eq!(guild.channels["c1"].guild_id.as_deref(), Some("g1"));
        assert!(guild.channels["c2"].is_voice());
        assert_eq!(guild.members.len(), 2);
        assert_eq!(guild.roles["r1"]["name"], "admin");
        assert_eq!(
            guild.voice_states["u1"].channel_id.as_deref(),
            Some("c2")
        );
        assert_eq!(guild.members["u1"].presence.as_ref().unwrap()["status"], "online");
    }

    #[test]
    fn message_cache_evicts_oldest() {
        let mut channel = Channel::from_value(&json!({"id": "c1", "type": 0})).unwrap();
        for i in 0..4 {
            let message = Message::from_value(&json!({
                "id": format!("m{i}"),
                "channel_id": "c1",
            }))
            .unwrap();
            channel.add_message(message, 3);
        }
        assert_eq!(channel.messages.len(), 3);
        assert!(!channel.messages.contains_key("m0"), "oldest evicted");
        assert!(channel.messages.contains_key("m3"));
    }

    #[test]
    fn message_cache_limit_zero_disables_caching() {
        let mut channel = Channel::from_value(&json!({"id": "c1", "type": 0})).unwrap();
        let message =
            Message::from_value(&json!({"id": "m1", "channel_id": "c1"})).unwrap();
        channel.add_message(message, 0);
        assert!(channel.messages.is_empty());
    }

    #[test]
    fn maybe_cached_exposes_id_for_both_arms() {
        let user = User::from_value(&json!({"id": "u1"})).unwrap();
        let cached = MaybeCached::Cached(user);
        assert_eq!(cached.id(), "u1");

        let stub: MaybeCached<User> = MaybeCached::Stub {
            id: "u2".to_string(),
        };
        assert_eq!(stub.id(), "u2");
    }

    #[test]
    fn voice_state_user_id_from_member() {
        let state = VoiceState::from_value(&json!({
            "member": {"user": {"id": "u9"}},
            "channel_id": "c3",
        }))
        .unwrap();
        assert_eq!(state.user_id, "u9");
    }
}
