//! Dispatch routing.
//!
//! Routes `op=0` packets by event name: each handler updates the
//! client caches and emits the corresponding high-level [`Event`].
//! Events referencing guilds the cache does not hold produce a debug
//! notice; creation/deletion events that carry a full entity payload
//! still emit, with a freshly built entity (or a stub) in place of a
//! cached one.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::events::Event;
use crate::model::{
    Channel, Guild, MaybeCached, Member, Message, User, VoiceState, emoji_key, str_field,
};
use crate::protocol::{self, Packet, intents};
use crate::session::ShardStatus;
use crate::shard::Shard;

impl Shard {
    /// Route one dispatch packet.
    pub(crate) fn handle_dispatch(&mut self, packet: &Packet) {
        let Some(name) = packet.t.as_deref() else {
            return;
        };
        let data = packet.d.clone().unwrap_or(Value::Null);
        match name {
            "READY" => self.on_ready(&data),
            "RESUMED" => self.on_resumed(),
            "GUILD_CREATE" => self.on_guild_create(&data),
            "GUILD_UPDATE" => self.on_guild_update(&data),
            "GUILD_DELETE" => self.on_guild_delete(&data),
            "GUILD_BAN_ADD" => self.on_guild_ban(&data, true),
            "GUILD_BAN_REMOVE" => self.on_guild_ban(&data, false),
            "GUILD_MEMBER_ADD" => self.on_guild_member_add(&data),
            "GUILD_MEMBER_UPDATE" => self.on_guild_member_update(&data),
            "GUILD_MEMBER_REMOVE" => self.on_guild_member_remove(&data),
            "GUILD_MEMBERS_CHUNK" => self.on_guild_members_chunk(&data),
            "GUILD_ROLE_CREATE" => self.on_guild_role_create(&data),
            "GUILD_ROLE_UPDATE" => self.on_guild_role_update(&data),
            "GUILD_ROLE_DELETE" => self.on_guild_role_delete(&data),
            "CHANNEL_CREATE" => self.on_channel_create(&data),
            "CHANNEL_UPDATE" => self.on_channel_update(&data),
            "CHANNEL_DELETE" => self.on_channel_delete(&data),
            "THREAD_CREATE" => self.on_thread_create(&data),
            "THREAD_UPDATE" => self.on_thread_update(&data),
            "THREAD_DELETE" => self.on_thread_delete(&data),
            "MESSAGE_CREATE" => self.on_message_create(&data),
            "MESSAGE_UPDATE" => self.on_message_update(&data),
            "MESSAGE_DELETE" => self.on_message_delete(&data),
            "MESSAGE_DELETE_BULK" => self.on_message_delete_bulk(&data),
            "MESSAGE_REACTION_ADD" => self.on_reaction_add(&data),
            "MESSAGE_REACTION_REMOVE" => self.on_reaction_remove(&data),
            "MESSAGE_REACTION_REMOVE_ALL" => self.on_reaction_remove_all(&data),
            "MESSAGE_REACTION_REMOVE_EMOJI" => self.on_reaction_remove_emoji(&data),
            "PRESENCE_UPDATE" => self.on_presence_update(&data),
            "TYPING_START" => self.on_typing_start(&data),
            "USER_UPDATE" => self.on_user_update(&data),
            "VOICE_STATE_UPDATE" => self.on_voice_state_update(&data),
            other => {
                debug!(shard = self.id, event = other, "unhandled dispatch event");
                self.client.emit(Event::Unknown {
                    shard: self.id,
                    name: other.to_string(),
                    data,
                });
            }
        }
    }

    // ── Session lifecycle ────────────────────────────────────

    fn on_ready(&mut self, d: &Value) {
        self.session.connect_attempts = 0;
        self.session.reconnect_interval_ms = 1000;
        self.session.status = ShardStatus::Ready;
        self.session.session_id = str_field(d, "session_id");
        if let Some(raw) = d.get("resume_gateway_url").and_then(Value::as_str) {
            self.session.resume_url = Some(protocol::normalize_resume_url(
                raw,
                self.codec.encoding().as_str(),
            ));
        }

        if let Some(user) = d.get("user").and_then(User::from_value) {
            self.client
                .users_mut()
                .insert(user.id.clone(), user.clone());
            self.client.set_user(user);
        }
        self.client.set_application(d.get("application").cloned());

        let mut provided = false;
        {
            let mut unavailable = self.client.unavailable_mut();
            for guild in d.get("guilds").and_then(Value::as_array).into_iter().flatten() {
                if let Some(id) = str_field(guild, "id") {
                    provided = true;
                    unavailable.insert(id);
                }
            }
        }

        info!(
            shard = self.id,
            session = self.session.session_id.as_deref().unwrap_or(""),
            "gateway session established"
        );
        self.session.pre_ready = true;
        self.client.emit(Event::ShardPreReady { shard: self.id });

        if provided && !self.client.unavailable_guilds().is_empty() {
            self.restart_guild_create_timeout();
        } else {
            self.check_ready();
        }
    }

    fn on_resumed(&mut self) {
        self.session.connect_attempts = 0;
        self.session.reconnect_interval_ms = 1000;
        self.session.status = ShardStatus::Ready;
        self.session.pre_ready = true;
        self.session.ready = true;
        info!(shard = self.id, "gateway session resumed");
        self.client.emit(Event::ShardResume { shard: self.id });
    }

    // ── Guilds ───────────────────────────────────────────────

    fn on_guild_create(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            warn!(shard = self.id, "GUILD_CREATE without an id");
            return;
        };

        if d.get("unavailable").and_then(Value::as_bool).unwrap_or(false) {
            self.client.guilds_mut().remove(&id);
            self.client.unavailable_mut().insert(id.clone());
            self.client.emit(Event::UnavailableGuildCreate { id });
            return;
        }

        let was_unavailable = self.client.unavailable_mut().remove(&id);
        self.client.guild_shard_map_mut().insert(id.clone(), self.id);

        let Some(guild) = Guild::from_value(d) else {
            return;
        };
        self.client.guilds_mut().insert(id.clone(), guild.clone());
        {
            let mut channel_map = self.client.channel_guild_map_mut();
            for channel_id in guild.channels.keys() {
                channel_map.insert(channel_id.clone(), id.clone());
            }
        }
        {
            let mut thread_map = self.client.thread_guild_map_mut();
            for thread_id in guild.threads.keys() {
                thread_map.insert(thread_id.clone(), id.clone());
            }
        }

        if self.session.ready {
            if was_unavailable {
                self.client.emit(Event::GuildAvailable(guild));
            } else {
                self.client.emit(Event::GuildCreate(guild));
            }
        } else {
            let options = self.client.options();
            if options.fetch_all_members && options.intents & intents::GUILD_MEMBERS != 0 {
                self.get_all_users_queue.push_back(id);
            }
            self.restart_guild_create_timeout();
        }
    }

    fn on_guild_update(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        let updated = {
            let mut guilds = self.client.guilds_mut();
            guilds.get_mut(&id).map(|guild| {
                let old = guild.raw.clone();
                guild.update(d);
                (guild.clone(), old)
            })
        };
        match updated {
            Some((guild, old)) => {
                self.client.emit(Event::GuildUpdate { guild, old });
            }
            None => debug!(shard = self.id, guild = %id, "uncached guild in GUILD_UPDATE"),
        }
    }

    fn on_guild_delete(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        self.client.guild_shard_map_mut().remove(&id);
        let guild = self.client.guilds_mut().remove(&id);

        if let Some(guild) = &guild {
            {
                let mut channel_map = self.client.channel_guild_map_mut();
                for channel_id in guild.channels.keys() {
                    channel_map.remove(channel_id);
                }
            }
            let mut thread_map = self.client.thread_guild_map_mut();
            for thread_id in guild.threads.keys() {
                thread_map.remove(thread_id);
            }
        }

        if d.get("unavailable").and_then(Value::as_bool).unwrap_or(false) {
            self.client.unavailable_mut().insert(id.clone());
            self.client.emit(Event::GuildUnavailable { id });
        } else {
            self.client.emit(Event::GuildDelete {
                guild: MaybeCached::from_cache(guild, id),
            });
        }
    }

    fn on_guild_ban(&mut self, d: &Value, added: bool) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        let Some(user) = d.get("user").and_then(User::from_value) else {
            return;
        };
        let cached = self.client.guild(&guild_id);
        if cached.is_none() {
            debug!(shard = self.id, guild = %guild_id, "ban event for uncached guild");
        }
        let guild = MaybeCached::from_cache(cached, guild_id.clone());
        if added {
            self.client.emit(Event::GuildBanAdd {
                guild_id,
                guild,
                user,
            });
        } else {
            self.client.emit(Event::GuildBanRemove {
                guild_id,
                guild,
                user,
            });
        }
    }

    // ── Members ──────────────────────────────────────────────

    fn on_guild_member_add(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        let Some(member) = Member::from_value(d) else {
            return;
        };
        {
            let mut guilds = self.client.guilds_mut();
            let Some(guild) = guilds.get_mut(&guild_id) else {
                debug!(shard = self.id, guild = %guild_id, "member add for uncached guild");
                return;
            };
            guild.member_count = guild.member_count.saturating_add(1);
            guild.members.insert(member.id.clone(), member.clone());
        }
        self.client.emit(Event::GuildMemberAdd { guild_id, member });
    }

    fn on_guild_member_update(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        let Some(user_id) = d.get("user").and_then(|u| str_field(u, "id")) else {
            return;
        };
        let updated = {
            let mut guilds = self.client.guilds_mut();
            let Some(guild) = guilds.get_mut(&guild_id) else {
                debug!(shard = self.id, guild = %guild_id, "member update for uncached guild");
                return;
            };
            match guild.members.get_mut(&user_id) {
                Some(member) => {
                    let old = member.raw.clone();
                    member.update(d);
                    (member.clone(), Some(old))
                }
                None => {
                    let Some(member) = Member::from_value(d) else {
                        return;
                    };
                    guild.members.insert(user_id.clone(), member.clone());
                    (member, None)
                }
            }
        };
        self.client.emit(Event::GuildMemberUpdate {
            guild_id,
            member: updated.0,
            old: updated.1,
        });
    }

    fn on_guild_member_remove(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        let Some(user_id) = d.get("user").and_then(|u| str_field(u, "id")) else {
            return;
        };
        // The shard's own departure is covered by GUILD_DELETE.
        if self.client.user().is_some_and(|u| u.id == user_id) {
            return;
        }
        let removed = {
            let mut guilds = self.client.guilds_mut();
            let Some(guild) = guilds.get_mut(&guild_id) else {
                debug!(shard = self.id, guild = %guild_id, "member remove for uncached guild");
                return;
            };
            guild.member_count = guild.member_count.saturating_sub(1);
            guild.members.remove(&user_id)
        };
        self.client.emit(Event::GuildMemberRemove {
            guild_id,
            member: MaybeCached::from_cache(removed, user_id),
        });
    }

    fn on_guild_members_chunk(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        // A long chunk burst can block the read loop past a heartbeat
        // deadline; a chunk is proof of liveness.
        self.session.last_heartbeat_ack = true;

        let mut members: Vec<Member> = d
            .get("members")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Member::from_value).collect())
            .unwrap_or_default();
        for presence in d.get("presences").and_then(Value::as_array).into_iter().flatten() {
            let Some(user_id) = presence.get("user").and_then(|u| str_field(u, "id")) else {
                continue;
            };
            if let Some(member) = members.iter_mut().find(|m| m.id == user_id) {
                member.presence = Some(presence.clone());
            }
        }

        {
            let mut guilds = self.client.guilds_mut();
            match guilds.get_mut(&guild_id) {
                Some(guild) => {
                    for member in &members {
                        guild.members.insert(member.id.clone(), member.clone());
                    }
                }
                None => {
                    debug!(shard = self.id, guild = %guild_id, "member chunk for uncached guild");
                }
            }
        }

        let Some(nonce) = str_field(d, "nonce") else {
            warn!(shard = self.id, guild = %guild_id, "member chunk without a nonce");
            return;
        };
        let chunk_index = d.get("chunk_index").and_then(Value::as_u64).unwrap_or(0);
        let chunk_count = d.get("chunk_count").and_then(Value::as_u64).unwrap_or(1);
        let last = chunk_index + 1 >= chunk_count;

        if self.members.contains(&nonce) {
            self.members.append(&nonce, &members);
            if last {
                self.members.finish(&nonce);
            }
        }
        if last && self.get_all_users_count.remove(&guild_id) {
            self.check_ready();
        }

        self.client.emit(Event::GuildMemberChunk { guild_id, members });
    }

    // ── Roles ────────────────────────────────────────────────

    fn on_guild_role_create(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        let Some(role) = d.get("role").cloned() else {
            return;
        };
        let Some(role_id) = str_field(&role, "id") else {
            return;
        };
        {
            let mut guilds = self.client.guilds_mut();
            let Some(guild) = guilds.get_mut(&guild_id) else {
                debug!(shard = self.id, guild = %guild_id, "role create for uncached guild");
                return;
            };
            guild.roles.insert(role_id, role.clone());
        }
        self.client.emit(Event::GuildRoleCreate { guild_id, role });
    }

    fn on_guild_role_update(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        let Some(role) = d.get("role").cloned() else {
            return;
        };
        let Some(role_id) = str_field(&role, "id") else {
            return;
        };
        let old = {
            let mut guilds = self.client.guilds_mut();
            let Some(guild) = guilds.get_mut(&guild_id) else {
                debug!(shard = self.id, guild = %guild_id, "role update for uncached guild");
                return;
            };
            guild.roles.insert(role_id, role.clone())
        };
        self.client.emit(Event::GuildRoleUpdate { guild_id, role, old });
    }

    fn on_guild_role_delete(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            return;
        };
        let Some(role_id) = str_field(d, "role_id") else {
            return;
        };
        {
            let mut guilds = self.client.guilds_mut();
            if let Some(guild) = guilds.get_mut(&guild_id) {
                guild.roles.remove(&role_id);
            }
        }
        self.client.emit(Event::GuildRoleDelete { guild_id, role_id });
    }

    // ── Channels & threads ───────────────────────────────────

    fn on_channel_create(&mut self, d: &Value) {
        let Some(channel) = Channel::from_value(d) else {
            return;
        };
        if let Some(guild_id) = channel.guild_id.clone() {
            self.client
                .channel_guild_map_mut()
                .insert(channel.id.clone(), guild_id.clone());
            let mut guilds = self.client.guilds_mut();
            match guilds.get_mut(&guild_id) {
                Some(guild) => {
                    guild.channels.insert(channel.id.clone(), channel.clone());
                }
                None => {
                    debug!(shard = self.id, guild = %guild_id, "channel create for uncached guild");
                }
            }
        }
        self.client.emit(Event::ChannelCreate(channel));
    }

    fn on_channel_update(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        let guild_id = self
            .client
            .guild_for_channel(&id)
            .or_else(|| str_field(d, "guild_id"));
        let updated = guild_id.and_then(|guild_id| {
            let mut guilds = self.client.guilds_mut();
            guilds
                .get_mut(&guild_id)
                .and_then(|guild| guild.channels.get_mut(&id))
                .map(|channel| {
                    let old = channel.raw.clone();
                    channel.update(d);
                    (channel.clone(), old)
                })
        });
        match updated {
            Some((channel, old)) => {
                self.client.emit(Event::ChannelUpdate { channel, old });
            }
            None => debug!(shard = self.id, channel = %id, "uncached channel in CHANNEL_UPDATE"),
        }
    }

    fn on_channel_delete(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        let guild_id = self
            .client
            .channel_guild_map_mut()
            .remove(&id)
            .or_else(|| str_field(d, "guild_id"));
        let cached = guild_id.and_then(|guild_id| {
            let mut guilds = self.client.guilds_mut();
            guilds
                .get_mut(&guild_id)
                .and_then(|guild| guild.channels.remove(&id))
        });
        self.client.emit(Event::ChannelDelete {
            channel: MaybeCached::from_cache(cached, id),
        });
    }

    fn on_thread_create(&mut self, d: &Value) {
        let Some(thread) = Channel::from_value(d) else {
            return;
        };
        if let Some(guild_id) = thread.guild_id.clone() {
            self.client
                .thread_guild_map_mut()
                .insert(thread.id.clone(), guild_id.clone());
            let mut guilds = self.client.guilds_mut();
            if let Some(guild) = guilds.get_mut(&guild_id) {
                guild.threads.insert(thread.id.clone(), thread.clone());
            }
        }
        self.client.emit(Event::ThreadCreate(thread));
    }

    fn on_thread_update(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        let guild_id = self
            .client
            .guild_for_thread(&id)
            .or_else(|| str_field(d, "guild_id"));
        let updated = guild_id.and_then(|guild_id| {
            let mut guilds = self.client.guilds_mut();
            guilds.get_mut(&guild_id).map(|guild| {
                match guild.threads.get_mut(&id) {
                    Some(thread) => {
                        let old = thread.raw.clone();
                        thread.update(d);
                        (thread.clone(), old)
                    }
                    None => {
                        // A thread can become active without a prior
                        // THREAD_CREATE on this shard.
                        let thread = Channel::from_value(d);
                        if let Some(thread) = &thread {
                            guild.threads.insert(id.clone(), thread.clone());
                        }
                        (thread.unwrap_or_else(|| stub_channel(&id)), Value::Null)
                    }
                }
            })
        });
        match updated {
            Some((thread, old)) => {
                self.client.emit(Event::ThreadUpdate { thread, old });
            }
            None => debug!(shard = self.id, thread = %id, "uncached thread in THREAD_UPDATE"),
        }
    }

    fn on_thread_delete(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        let guild_id = self
            .client
            .thread_guild_map_mut()
            .remove(&id)
            .or_else(|| str_field(d, "guild_id"));
        let cached = guild_id.and_then(|guild_id| {
            let mut guilds = self.client.guilds_mut();
            guilds
                .get_mut(&guild_id)
                .and_then(|guild| guild.threads.remove(&id))
        });
        self.client.emit(Event::ThreadDelete {
            thread: MaybeCached::from_cache(cached, id),
        });
    }

    // ── Messages ─────────────────────────────────────────────

    /// Run a closure against a cached channel (or thread), resolved
    /// through the routing maps.
    fn with_channel<R>(&self, channel_id: &str, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let guild_id = self
            .client
            .guild_for_channel(channel_id)
            .or_else(|| self.client.guild_for_thread(channel_id))?;
        let mut guilds = self.client.guilds_mut();
        let guild = guilds.get_mut(&guild_id)?;
        let channel = match guild.channels.get_mut(channel_id) {
            Some(channel) => channel,
            None => guild.threads.get_mut(channel_id)?,
        };
        Some(f(channel))
    }

    fn on_message_create(&mut self, d: &Value) {
        let Some(message) = Message::from_value(d) else {
            return;
        };
        let limit = self.client.options().message_limit;
        if self
            .with_channel(&message.channel_id, |channel| {
                channel.add_message(message.clone(), limit);
            })
            .is_none()
        {
            debug!(
                shard = self.id,
                channel = %message.channel_id,
                "message for uncached channel"
            );
        }
        self.client.emit(Event::MessageCreate(message));
    }

    fn on_message_update(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let updated = self
            .with_channel(&channel_id, |channel| {
                channel.messages.get_mut(&id).map(|message| {
                    let old = message.raw.clone();
                    message.update(d);
                    (message.clone(), old)
                })
            })
            .flatten();
        match updated {
            Some((message, old)) => {
                self.client.emit(Event::MessageUpdate {
                    message,
                    old: Some(old),
                });
            }
            None => {
                // Uncached message: the partial payload still carries
                // enough to emit with a fresh entity.
                if let Some(message) = Message::from_value(d) {
                    self.client.emit(Event::MessageUpdate { message, old: None });
                }
            }
        }
    }

    fn on_message_delete(&mut self, d: &Value) {
        let Some(id) = str_field(d, "id") else {
            return;
        };
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let cached = self
            .with_channel(&channel_id, |channel| channel.remove_message(&id))
            .flatten();
        self.client.emit(Event::MessageDelete {
            channel_id,
            message: MaybeCached::from_cache(cached, id),
        });
    }

    fn on_message_delete_bulk(&mut self, d: &Value) {
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let ids: Vec<String> = d
            .get("ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        self.with_channel(&channel_id, |channel| {
            for id in &ids {
                channel.remove_message(id);
            }
        });
        self.client.emit(Event::MessageDeleteBulk { channel_id, ids });
    }

    // ── Reactions ────────────────────────────────────────────

    fn on_reaction_add(&mut self, d: &Value) {
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let Some(message_id) = str_field(d, "message_id") else {
            return;
        };
        let Some(user_id) = str_field(d, "user_id") else {
            return;
        };
        let emoji = d.get("emoji").cloned().unwrap_or(Value::Null);
        let key = emoji_key(&emoji);
        let me = self.client.user().is_some_and(|u| u.id == user_id);

        let cached = self
            .with_channel(&channel_id, |channel| {
                channel.messages.get_mut(&message_id).map(|message| {
                    let reaction = message.reactions.entry(key.clone()).or_default();
                    reaction.count += 1;
                    if me {
                        reaction.me = true;
                    }
                    message.clone()
                })
            })
            .flatten();

        self.client.emit(Event::MessageReactionAdd {
            channel_id,
            message: MaybeCached::from_cache(cached, message_id),
            user_id,
            emoji,
        });
    }

    fn on_reaction_remove(&mut self, d: &Value) {
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let Some(message_id) = str_field(d, "message_id") else {
            return;
        };
        let Some(user_id) = str_field(d, "user_id") else {
            return;
        };
        let emoji = d.get("emoji").cloned().unwrap_or(Value::Null);
        let key = emoji_key(&emoji);
        let me = self.client.user().is_some_and(|u| u.id == user_id);

        let cached = self
            .with_channel(&channel_id, |channel| {
                channel.messages.get_mut(&message_id).map(|message| {
                    let mut empty = false;
                    if let Some(reaction) = message.reactions.get_mut(&key) {
                        reaction.count = reaction.count.saturating_sub(1);
                        if reaction.count == 0 {
                            empty = true;
                        } else if me {
                            reaction.me = false;
                        }
                    }
                    if empty {
                        message.reactions.remove(&key);
                    }
                    message.clone()
                })
            })
            .flatten();

        self.client.emit(Event::MessageReactionRemove {
            channel_id,
            message: MaybeCached::from_cache(cached, message_id),
            user_id,
            emoji,
        });
    }

    fn on_reaction_remove_all(&mut self, d: &Value) {
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let Some(message_id) = str_field(d, "message_id") else {
            return;
        };
        let cached = self
            .with_channel(&channel_id, |channel| {
                channel.messages.get_mut(&message_id).map(|message| {
                    message.reactions.clear();
                    message.clone()
                })
            })
            .flatten();
        self.client.emit(Event::MessageReactionRemoveAll {
            channel_id,
            message: MaybeCached::from_cache(cached, message_id),
        });
    }

    fn on_reaction_remove_emoji(&mut self, d: &Value) {
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let Some(message_id) = str_field(d, "message_id") else {
            return;
        };
        let emoji = d.get("emoji").cloned().unwrap_or(Value::Null);
        let key = emoji_key(&emoji);
        let cached = self
            .with_channel(&channel_id, |channel| {
                channel.messages.get_mut(&message_id).map(|message| {
                    message.reactions.remove(&key);
                    message.clone()
                })
            })
            .flatten();
        self.client.emit(Event::MessageReactionRemoveEmoji {
            channel_id,
            message: MaybeCached::from_cache(cached, message_id),
            emoji,
        });
    }

    // ── Presence, typing, users ──────────────────────────────

    fn on_presence_update(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            debug!(shard = self.id, "presence update outside a guild");
            return;
        };
        let Some(user_id) = d.get("user").and_then(|u| str_field(u, "id")) else {
            return;
        };
        let old = {
            let mut guilds = self.client.guilds_mut();
            let Some(guild) = guilds.get_mut(&guild_id) else {
                debug!(shard = self.id, guild = %guild_id, "rogue presence update");
                return;
            };
            match guild.members.get_mut(&user_id) {
                Some(member) => {
                    let old = member.presence.take();
                    member.presence = Some(d.clone());
                    old
                }
                None => None,
            }
        };
        self.client.emit(Event::PresenceUpdate {
            guild_id,
            user_id,
            old,
        });
    }

    fn on_typing_start(&mut self, d: &Value) {
        let Some(channel_id) = str_field(d, "channel_id") else {
            return;
        };
        let Some(user_id) = str_field(d, "user_id") else {
            return;
        };
        self.client.emit(Event::TypingStart {
            channel_id,
            user_id,
            guild_id: str_field(d, "guild_id"),
        });
    }

    fn on_user_update(&mut self, d: &Value) {
        let Some(fresh) = User::from_value(d) else {
            return;
        };
        let (user, old) = {
            let mut users = self.client.users_mut();
            match users.get_mut(&fresh.id) {
                Some(existing) => {
                    let old = existing.raw.clone();
                    existing.update(d);
                    (existing.clone(), Some(old))
                }
                None => {
                    users.insert(fresh.id.clone(), fresh.clone());
                    (fresh, None)
                }
            }
        };
        if self.client.user().is_some_and(|u| u.id == user.id) {
            self.client.set_user(user.clone());
        }
        self.client.emit(Event::UserUpdate { user, old });
    }

    // ── Voice ────────────────────────────────────────────────

    fn on_voice_state_update(&mut self, d: &Value) {
        let Some(guild_id) = str_field(d, "guild_id") else {
            debug!(shard = self.id, "voice state update outside a guild");
            return;
        };
        let Some(state) = VoiceState::from_value(d) else {
            return;
        };
        let user_id = state.user_id.clone();
        let channel_id = state.channel_id.clone();

        let previous = {
            let mut guilds = self.client.guilds_mut();
            let Some(guild) = guilds.get_mut(&guild_id) else {
                debug!(shard = self.id, guild = %guild_id, "voice state for uncached guild");
                return;
            };
            if let Some(channel_id) = &channel_id {
                if let Some(channel) = guild.channels.get(channel_id) {
                    if !channel.is_voice() {
                        warn!(
                            shard = self.id,
                            channel = %channel_id,
                            kind = channel.kind,
                            "voice state update for a non-voice channel"
                        );
                        return;
                    }
                }
            }
            let previous = guild.voice_states.get(&user_id).cloned();
            if channel_id.is_some() {
                guild.voice_states.insert(user_id.clone(), state.clone());
            } else {
                guild.voice_states.remove(&user_id);
            }
            if let Some(member) = guild.members.get_mut(&user_id) {
                if let Some(deaf) = d.get("deaf").and_then(Value::as_bool) {
                    member.deaf = deaf;
                }
                if let Some(mute) = d.get("mute").and_then(Value::as_bool) {
                    member.mute = mute;
                }
            }
            previous
        };

        let old_channel = previous.as_ref().and_then(|p| p.channel_id.clone());
        match (old_channel, channel_id) {
            (None, Some(to)) => {
                self.client.emit(Event::VoiceChannelJoin {
                    guild_id,
                    user_id,
                    channel_id: to,
                });
            }
            (Some(from), None) => {
                self.client.emit(Event::VoiceChannelLeave {
                    guild_id,
                    user_id,
                    channel_id: from,
                });
            }
            (Some(from), Some(to)) if from != to => {
                self.client.emit(Event::VoiceChannelSwitch {
                    guild_id,
                    user_id,
                    from,
                    to,
                });
            }
            (Some(_), Some(_)) => {
                self.client.emit(Event::VoiceStateUpdate {
                    guild_id,
                    user_id,
                    old: previous.map(|p| p.raw),
                });
            }
            (None, None) => {}
        }
    }
}

/// Minimal channel stand-in for payloads missing required fields.
fn stub_channel(id: &str) -> Channel {
    Channel::from_value(&serde_json::json!({ "id": id })).unwrap_or_else(|| {
        // from_value only fails without an id, which is present here.
        unreachable!("stub channel payload always has an id")
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::broadcast;
    use tokio::sync::oneshot;

    use super::*;
    use crate::client::Client;
    use crate::config::ShardOptions;
    use crate::error::GatewayError;
    use crate::session::ShardStatus;

    fn test_shard() -> (Shard, broadcast::Receiver<Arc<Event>>) {
        let client = Client::new("test-token", ShardOptions::default());
        let events = client.subscribe();
        let (shard, _handle) = Shard::new(0, client);
        (shard, events)
    }

    fn dispatch(shard: &mut Shard, name: &str, d: serde_json::Value) {
        shard.handle_dispatch(&Packet {
            op: 0,
            d: Some(d),
            s: None,
            t: Some(name.to_string()),
        });
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<Event>>) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn ready_payload(guilds: serde_json::Value) -> serde_json::Value {
        json!({
            "session_id": "sess-1",
            "resume_gateway_url": "wss://gw/?foo=1",
            "user": {"id": "bot-1", "username": "corvus", "bot": true},
            "application": {"id": "app-1"},
            "guilds": guilds,
        })
    }

    // ── READY / RESUMED ──────────────────────────────────────

    #[tokio::test]
    async fn ready_finalizes_the_session() {
        let (mut shard, mut events) = test_shard();
        shard.session.connect_attempts = 3;
        shard.session.reconnect_interval_ms = 8000;

        dispatch(&mut shard, "READY", ready_payload(json!([])));

        assert_eq!(shard.session.status, ShardStatus::Ready);
        assert_eq!(shard.session.session_id.as_deref(), Some("sess-1"));
        assert_eq!(
            shard.session.resume_url.as_deref(),
            Some("wss://gw/?v=10&encoding=json")
        );
        assert_eq!(shard.session.connect_attempts, 0);
        assert_eq!(shard.session.reconnect_interval_ms, 1000);
        assert_eq!(shard.client.user().unwrap().id, "bot-1");
        assert!(shard.client.application().is_some());

        // No startup guilds: ready immediately.
        assert!(shard.session.ready);
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(&**e, Event::ShardPreReady { .. })));
        assert!(emitted.iter().any(|e| matches!(&**e, Event::ShardReady { .. })));
    }

    #[tokio::test]
    async fn ready_with_unavailable_guilds_waits_for_streaming() {
        let (mut shard, mut events) = test_shard();

        dispatch(
            &mut shard,
            "READY",
            ready_payload(json!([{"id": "g1", "unavailable": true}])),
        );

        assert!(shard.client.unavailable_guilds().contains("g1"));
        assert!(shard.session.pre_ready);
        assert!(!shard.session.ready, "waiting for guild streaming");
        assert!(shard.guild_create_deadline.is_some());
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(&**e, Event::ShardPreReady { .. })));
        assert!(!emitted.iter().any(|e| matches!(&**e, Event::ShardReady { .. })));
    }

    #[tokio::test]
    async fn resumed_restores_readiness() {
        let (mut shard, mut events) = test_shard();
        shard.session.session_id = Some("sess-1".to_string());
        shard.session.status = ShardStatus::Resuming;
        shard.session.connect_attempts = 2;

        dispatch(&mut shard, "RESUMED", json!(null));

        assert_eq!(shard.session.status, ShardStatus::Ready);
        assert!(shard.session.ready);
        assert_eq!(shard.session.connect_attempts, 0);
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(&**e, Event::ShardResume { shard: 0 })));
    }

    // ── GUILD_CREATE / DELETE ────────────────────────────────

    #[tokio::test]
    async fn guild_create_pre_ready_arms_the_timeout_and_stays_quiet() {
        let (mut shard, mut events) = test_shard();
        shard.session.pre_ready = true;

        dispatch(
            &mut shard,
            "GUILD_CREATE",
            json!({"id": "g1", "name": "one", "channels": [{"id": "c1", "type": 0}]}),
        );

        assert!(shard.client.guild("g1").is_some());
        assert_eq!(shard.client.guild_shard("g1"), Some(0));
        assert_eq!(shard.client.guild_for_channel("c1").as_deref(), Some("g1"));
        assert!(shard.guild_create_deadline.is_some());
        let emitted = drain(&mut events);
        assert!(
            !emitted.iter().any(|e| matches!(&**e, Event::GuildCreate(_))),
            "startup guilds do not emit guildCreate"
        );
    }

    #[tokio::test]
    async fn guild_create_after_ready_emits() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;

        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(&**e, Event::GuildCreate(g) if g.id == "g1")));
    }

    #[tokio::test]
    async fn guild_create_for_previously_unavailable_guild_emits_available() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        shard.client.unavailable_mut().insert("g1".to_string());

        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));

        assert!(!shard.client.unavailable_guilds().contains("g1"));
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(&**e, Event::GuildAvailable(g) if g.id == "g1")));
    }

    #[tokio::test]
    async fn unavailable_guild_create_moves_to_unavailable_set() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));
        drain(&mut events);

        dispatch(
            &mut shard,
            "GUILD_CREATE",
            json!({"id": "g1", "unavailable": true}),
        );

        assert!(shard.client.guild("g1").is_none());
        assert!(shard.client.unavailable_guilds().contains("g1"));
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::UnavailableGuildCreate { id } if id == "g1"
        )));
    }

    #[tokio::test]
    async fn guild_delete_cleans_routing_maps() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(
            &mut shard,
            "GUILD_CREATE",
            json!({"id": "g1", "channels": [{"id": "c1", "type": 0}]}),
        );
        drain(&mut events);

        dispatch(&mut shard, "GUILD_DELETE", json!({"id": "g1"}));

        assert!(shard.client.guild("g1").is_none());
        assert!(shard.client.guild_shard("g1").is_none());
        assert!(shard.client.guild_for_channel("c1").is_none());
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::GuildDelete { guild: MaybeCached::Cached(g) } if g.id == "g1"
        )));
    }

    #[tokio::test]
    async fn guild_delete_uncached_emits_stub() {
        let (mut shard, mut events) = test_shard();

        dispatch(&mut shard, "GUILD_DELETE", json!({"id": "gX"}));

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::GuildDelete { guild: MaybeCached::Stub { id } } if id == "gX"
        )));
    }

    #[tokio::test]
    async fn guild_delete_unavailable_emits_guild_unavailable() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));
        drain(&mut events);

        dispatch(
            &mut shard,
            "GUILD_DELETE",
            json!({"id": "g1", "unavailable": true}),
        );

        assert!(shard.client.unavailable_guilds().contains("g1"));
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::GuildUnavailable { id } if id == "g1"
        )));
    }

    #[tokio::test]
    async fn ban_add_for_uncached_guild_emits_a_stub_reference() {
        let (mut shard, mut events) = test_shard();

        dispatch(
            &mut shard,
            "GUILD_BAN_ADD",
            json!({"guild_id": "gX", "user": {"id": "u1"}}),
        );

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::GuildBanAdd {
                guild_id,
                guild: MaybeCached::Stub { id },
                user,
            } if guild_id == "gX" && id == "gX" && user.id == "u1"
        )));
    }

    #[tokio::test]
    async fn ban_remove_for_cached_guild_carries_the_guild() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));
        drain(&mut events);

        dispatch(
            &mut shard,
            "GUILD_BAN_REMOVE",
            json!({"guild_id": "g1", "user": {"id": "u1"}}),
        );

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::GuildBanRemove {
                guild: MaybeCached::Cached(guild),
                user,
                ..
            } if guild.id == "g1" && user.id == "u1"
        )));
    }

    // ── Member chunking ──────────────────────────────────────

    #[tokio::test]
    async fn chunks_accumulate_and_resolve_by_nonce() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));
        drain(&mut events);

        let (tx, mut rx) = oneshot::channel();
        shard.install_member_request(
            "n1".to_string(),
            "g1".to_string(),
            Some(tx),
            Duration::from_secs(15),
        );

        dispatch(
            &mut shard,
            "GUILD_MEMBERS_CHUNK",
            json!({
                "guild_id": "g1",
                "nonce": "n1",
                "chunk_index": 0,
                "chunk_count": 2,
                "members": [{"user": {"id": "u1"}}],
            }),
        );
        assert!(rx.try_recv().is_err(), "not resolved before the final chunk");

        dispatch(
            &mut shard,
            "GUILD_MEMBERS_CHUNK",
            json!({
                "guild_id": "g1",
                "nonce": "n1",
                "chunk_index": 1,
                "chunk_count": 2,
                "members": [{"user": {"id": "u2"}}],
            }),
        );

        let members = rx.try_recv().unwrap().unwrap();
        assert_eq!(members.len(), 2);
        let guild = shard.client.guild("g1").unwrap();
        assert!(guild.members.contains_key("u1"));
        assert!(guild.members.contains_key("u2"));
        let emitted = drain(&mut events);
        assert_eq!(
            emitted
                .iter()
                .filter(|e| matches!(&***e, Event::GuildMemberChunk { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn chunk_counts_as_heartbeat_liveness() {
        let (mut shard, _events) = test_shard();
        shard.session.ready = true;
        shard.session.last_heartbeat_ack = false;

        dispatch(
            &mut shard,
            "GUILD_MEMBERS_CHUNK",
            json!({"guild_id": "gX", "nonce": "n", "members": []}),
        );

        assert!(shard.session.last_heartbeat_ack);
    }

    #[tokio::test]
    async fn chunk_without_nonce_is_dropped() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));
        drain(&mut events);

        dispatch(
            &mut shard,
            "GUILD_MEMBERS_CHUNK",
            json!({"guild_id": "g1", "members": [{"user": {"id": "u1"}}]}),
        );

        let emitted = drain(&mut events);
        assert!(
            !emitted
                .iter()
                .any(|e| matches!(&**e, Event::GuildMemberChunk { .. })),
            "a chunk without a nonce stops before emitting"
        );
    }

    #[tokio::test]
    async fn chunk_attaches_presences_to_members() {
        let (mut shard, _events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));

        dispatch(
            &mut shard,
            "GUILD_MEMBERS_CHUNK",
            json!({
                "guild_id": "g1",
                "nonce": "n1",
                "members": [{"user": {"id": "u1"}}],
                "presences": [{"user": {"id": "u1"}, "status": "idle"}],
            }),
        );

        let guild = shard.client.guild("g1").unwrap();
        assert_eq!(
            guild.members["u1"].presence.as_ref().unwrap()["status"],
            "idle"
        );
    }

    #[tokio::test]
    async fn final_chunk_for_startup_guild_advances_readiness() {
        let (mut shard, mut events) = test_shard();
        shard.session.pre_ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));
        drain(&mut events);
        shard.get_all_users_count.insert("g1".to_string());

        dispatch(
            &mut shard,
            "GUILD_MEMBERS_CHUNK",
            json!({"guild_id": "g1", "nonce": "startup", "members": []}),
        );

        assert!(shard.get_all_users_count.is_empty());
        assert!(shard.session.ready);
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(&**e, Event::ShardReady { .. })));
    }

    // ── Messages & reactions ─────────────────────────────────

    fn seed_guild_with_message(shard: &mut Shard) {
        shard.session.ready = true;
        dispatch(
            shard,
            "GUILD_CREATE",
            json!({"id": "g1", "channels": [{"id": "c1", "type": 0}]}),
        );
        dispatch(
            shard,
            "MESSAGE_CREATE",
            json!({"id": "m1", "channel_id": "c1", "content": "hello"}),
        );
    }

    #[tokio::test]
    async fn message_create_caches_in_channel() {
        let (mut shard, mut events) = test_shard();
        seed_guild_with_message(&mut shard);

        let guild = shard.client.guild("g1").unwrap();
        assert!(guild.channels["c1"].messages.contains_key("m1"));
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::MessageCreate(m) if m.id == "m1" && m.content == "hello"
        )));
    }

    #[tokio::test]
    async fn message_update_keeps_the_old_payload() {
        let (mut shard, mut events) = test_shard();
        seed_guild_with_message(&mut shard);
        drain(&mut events);

        dispatch(
            &mut shard,
            "MESSAGE_UPDATE",
            json!({"id": "m1", "channel_id": "c1", "content": "edited"}),
        );

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::MessageUpdate { message, old: Some(old) }
                if message.content == "edited" && old["content"] == "hello"
        )));
    }

    #[tokio::test]
    async fn message_delete_removes_from_cache() {
        let (mut shard, mut events) = test_shard();
        seed_guild_with_message(&mut shard);
        drain(&mut events);

        dispatch(
            &mut shard,
            "MESSAGE_DELETE",
            json!({"id": "m1", "channel_id": "c1"}),
        );

        let guild = shard.client.guild("g1").unwrap();
        assert!(guild.channels["c1"].messages.is_empty());
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::MessageDelete { message: MaybeCached::Cached(m), .. } if m.id == "m1"
        )));
    }

    #[tokio::test]
    async fn reaction_add_then_remove_leaves_no_key() {
        let (mut shard, mut events) = test_shard();
        seed_guild_with_message(&mut shard);
        drain(&mut events);

        let reaction = json!({
            "channel_id": "c1",
            "message_id": "m1",
            "user_id": "u1",
            "emoji": {"name": "👍", "id": null},
        });
        dispatch(&mut shard, "MESSAGE_REACTION_ADD", reaction.clone());
        {
            let guild = shard.client.guild("g1").unwrap();
            let message = &guild.channels["c1"].messages["m1"];
            assert_eq!(message.reactions["👍"].count, 1);
        }

        dispatch(&mut shard, "MESSAGE_REACTION_REMOVE", reaction);
        let guild = shard.client.guild("g1").unwrap();
        let message = &guild.channels["c1"].messages["m1"];
        assert!(
            !message.reactions.contains_key("👍"),
            "count reaching 0 removes the key"
        );
    }

    #[tokio::test]
    async fn own_reactions_track_the_me_flag() {
        let (mut shard, _events) = test_shard();
        seed_guild_with_message(&mut shard);
        shard
            .client
            .set_user(User::from_value(&json!({"id": "bot-1"})).unwrap());

        dispatch(
            &mut shard,
            "MESSAGE_REACTION_ADD",
            json!({
                "channel_id": "c1",
                "message_id": "m1",
                "user_id": "bot-1",
                "emoji": {"name": "corvid", "id": "e1"},
            }),
        );

        let guild = shard.client.guild("g1").unwrap();
        let message = &guild.channels["c1"].messages["m1"];
        assert!(message.reactions["corvid:e1"].me);
    }

    #[tokio::test]
    async fn reaction_remove_all_clears_the_map() {
        let (mut shard, _events) = test_shard();
        seed_guild_with_message(&mut shard);
        dispatch(
            &mut shard,
            "MESSAGE_REACTION_ADD",
            json!({
                "channel_id": "c1",
                "message_id": "m1",
                "user_id": "u1",
                "emoji": {"name": "👍", "id": null},
            }),
        );

        dispatch(
            &mut shard,
            "MESSAGE_REACTION_REMOVE_ALL",
            json!({"channel_id": "c1", "message_id": "m1"}),
        );

        let guild = shard.client.guild("g1").unwrap();
        assert!(guild.channels["c1"].messages["m1"].reactions.is_empty());
    }

    #[tokio::test]
    async fn reaction_on_uncached_message_emits_stub() {
        let (mut shard, mut events) = test_shard();

        dispatch(
            &mut shard,
            "MESSAGE_REACTION_ADD",
            json!({
                "channel_id": "cX",
                "message_id": "mX",
                "user_id": "u1",
                "emoji": {"name": "👍", "id": null},
            }),
        );

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::MessageReactionAdd { message: MaybeCached::Stub { id }, .. } if id == "mX"
        )));
    }

    // ── Voice ────────────────────────────────────────────────

    fn seed_voice_guild(shard: &mut Shard) {
        shard.session.ready = true;
        dispatch(
            shard,
            "GUILD_CREATE",
            json!({
                "id": "g1",
                "channels": [
                    {"id": "v1", "type": 2},
                    {"id": "v2", "type": 2},
                    {"id": "t1", "type": 0},
                ],
                "members": [{"user": {"id": "u1"}}],
            }),
        );
    }

    fn voice_state(channel: Option<&str>) -> serde_json::Value {
        json!({
            "guild_id": "g1",
            "user_id": "u1",
            "channel_id": channel,
            "deaf": false,
            "mute": false,
            "session_id": "vs1",
        })
    }

    #[tokio::test]
    async fn voice_join_leave_switch_transitions() {
        let (mut shard, mut events) = test_shard();
        seed_voice_guild(&mut shard);
        drain(&mut events);

        dispatch(&mut shard, "VOICE_STATE_UPDATE", voice_state(Some("v1")));
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::VoiceChannelJoin { channel_id, .. } if channel_id == "v1"
        )));

        dispatch(&mut shard, "VOICE_STATE_UPDATE", voice_state(Some("v2")));
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::VoiceChannelSwitch { from, to, .. } if from == "v1" && to == "v2"
        )));

        dispatch(&mut shard, "VOICE_STATE_UPDATE", voice_state(None));
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::VoiceChannelLeave { channel_id, .. } if channel_id == "v2"
        )));
        assert!(shard.client.guild("g1").unwrap().voice_states.is_empty());
    }

    #[tokio::test]
    async fn voice_update_in_same_channel_emits_state_update() {
        let (mut shard, mut events) = test_shard();
        seed_voice_guild(&mut shard);
        dispatch(&mut shard, "VOICE_STATE_UPDATE", voice_state(Some("v1")));
        drain(&mut events);

        let mut muted = voice_state(Some("v1"));
        muted["mute"] = json!(true);
        dispatch(&mut shard, "VOICE_STATE_UPDATE", muted);

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::VoiceStateUpdate { user_id, .. } if user_id == "u1"
        )));
        let guild = shard.client.guild("g1").unwrap();
        assert!(guild.members["u1"].mute);
    }

    #[tokio::test]
    async fn voice_state_for_text_channel_is_rejected() {
        let (mut shard, mut events) = test_shard();
        seed_voice_guild(&mut shard);
        drain(&mut events);

        dispatch(&mut shard, "VOICE_STATE_UPDATE", voice_state(Some("t1")));

        let emitted = drain(&mut events);
        assert!(
            !emitted
                .iter()
                .any(|e| matches!(&**e, Event::VoiceChannelJoin { .. })),
            "non-voice channel types are rejected with a warning"
        );
        assert!(shard.client.guild("g1").unwrap().voice_states.is_empty());
    }

    // ── Misc ─────────────────────────────────────────────────

    #[tokio::test]
    async fn member_remove_emits_stub_when_uncached() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1", "member_count": 5}));
        drain(&mut events);

        dispatch(
            &mut shard,
            "GUILD_MEMBER_REMOVE",
            json!({"guild_id": "g1", "user": {"id": "u9"}}),
        );

        assert_eq!(shard.client.guild("g1").unwrap().member_count, 4);
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::GuildMemberRemove { member: MaybeCached::Stub { id }, .. } if id == "u9"
        )));
    }

    #[tokio::test]
    async fn presence_update_for_uncached_guild_is_dropped() {
        let (mut shard, mut events) = test_shard();

        dispatch(
            &mut shard,
            "PRESENCE_UPDATE",
            json!({"guild_id": "gX", "user": {"id": "u1"}, "status": "online"}),
        );

        let emitted = drain(&mut events);
        assert!(
            !emitted
                .iter()
                .any(|e| matches!(&**e, Event::PresenceUpdate { .. }))
        );
    }

    #[tokio::test]
    async fn unknown_events_are_forwarded() {
        let (mut shard, mut events) = test_shard();

        dispatch(&mut shard, "STAGE_INSTANCE_CREATE", json!({"id": "s1"}));

        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::Unknown { name, .. } if name == "STAGE_INSTANCE_CREATE"
        )));
    }

    #[tokio::test]
    async fn role_lifecycle_updates_the_cache() {
        let (mut shard, mut events) = test_shard();
        shard.session.ready = true;
        dispatch(&mut shard, "GUILD_CREATE", json!({"id": "g1"}));
        drain(&mut events);

        dispatch(
            &mut shard,
            "GUILD_ROLE_CREATE",
            json!({"guild_id": "g1", "role": {"id": "r1", "name": "old"}}),
        );
        dispatch(
            &mut shard,
            "GUILD_ROLE_UPDATE",
            json!({"guild_id": "g1", "role": {"id": "r1", "name": "new"}}),
        );

        assert_eq!(shard.client.guild("g1").unwrap().roles["r1"]["name"], "new");
        let emitted = drain(&mut events);
        assert!(emitted.iter().any(|e| matches!(
            &**e,
            Event::GuildRoleUpdate { old: Some(old), .. } if old["name"] == "old"
        )));

        dispatch(
            &mut shard,
            "GUILD_ROLE_DELETE",
            json!({"guild_id": "g1", "role_id": "r1"}),
        );
        assert!(shard.client.guild("g1").unwrap().roles.is_empty());
    }

    #[tokio::test]
    async fn request_members_reply_errors_when_guild_request_invalid() {
        // Validation happens before the actor sees the command; an
        // invalid request never reaches the wire. Covered here to pin
        // the error type used by the synchronous path.
        let err = crate::members::build_request(
            "g1",
            &crate::members::RequestGuildMembersOptions {
                user_ids: Some((0..150).map(|i| format!("u{i}")).collect()),
                ..Default::default()
            },
            0,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::TooManyUserIds));
    }
}
