//! The shard controller.
//!
//! A [`Shard`] is a single-actor gateway connection: one task owns the
//! socket reader, the session state machine, cache mutation, and event
//! emission. Callers drive it through a cloneable [`ShardHandle`],
//! whose commands are serialized onto the actor's channel. Reconnects
//! (resume when a session exists, randomized backoff otherwise) happen
//! inside [`Shard::run`].

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::client::Client;
use crate::codec::{Encoding, FrameCodec};
use crate::error::GatewayError;
use crate::events::Event;
use crate::heartbeat;
use crate::members::{
    self, MemberReply, MemberRequest, MemberRequestTable, RequestGuildMembersOptions,
};
use crate::model::Member;
use crate::protocol::{
    self, HelloData, IdentifyParams, Packet, Presence, PresenceStatus, RECONNECT_CLOSE_CODE,
    close_code, opcode,
};
use crate::sender::OutboundSender;
use crate::session::{SessionState, ShardStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;
type WsError = tokio_tungstenite::tungstenite::Error;

/// Commands accepted by the shard actor.
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Open a connection (idle) or report an error (connected).
    Connect,
    /// Tear the connection down, optionally reconnecting.
    Disconnect {
        /// Reconnect after teardown.
        reconnect: bool,
    },
    /// Queue a raw `{op, d}` send.
    Send {
        /// Opcode.
        op: u8,
        /// Payload.
        data: Value,
        /// Use the reserved priority tokens and jump the queue.
        priority: bool,
    },
    /// Update the requested presence.
    EditStatus {
        /// The new presence.
        presence: Presence,
    },
    /// Join, move, or leave a voice channel.
    UpdateVoiceState {
        /// Guild to act in.
        guild_id: String,
        /// Channel to join; `None` disconnects.
        channel_id: Option<String>,
        /// Join muted.
        self_mute: bool,
        /// Join deafened.
        self_deaf: bool,
    },
    /// Begin a correlated guild member request.
    RequestMembers {
        /// Guild to chunk.
        guild_id: String,
        /// Correlation nonce.
        nonce: String,
        /// Prebuilt wire payload.
        payload: Value,
        /// Overrides the default request timeout.
        timeout: Option<Duration>,
        /// Completion channel.
        reply: MemberReply,
    },
    /// Snapshot the session state.
    Inspect {
        /// Reply channel.
        reply: oneshot::Sender<SessionState>,
    },
    /// Periodic heartbeat tick from the ticker task.
    HeartbeatTick,
    /// A member request's timeout fired.
    MemberRequestTimeout {
        /// Nonce of the timed-out request.
        nonce: String,
    },
}

/// How a connection (or connection attempt) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    /// Reconnect: immediately when `resume`, after backoff otherwise.
    Retry {
        /// A session exists and a resume will be attempted.
        resume: bool,
    },
    /// Do not reconnect; hard-reset and go idle.
    Stop,
    /// The command channel closed; the actor exits.
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum CycleEnd {
    Idle,
    Shutdown,
}

enum WaitEnd {
    Proceed,
    Idle,
    Shutdown,
}

/// A single gateway shard.
pub struct Shard {
    /// Shard index, immutable for the shard's lifetime.
    pub(crate) id: u32,
    pub(crate) client: Client,
    pub(crate) session: SessionState,
    pub(crate) codec: FrameCodec,
    pub(crate) sender: OutboundSender,
    pub(crate) members: MemberRequestTable,
    /// Guilds queued for startup member chunking.
    pub(crate) get_all_users_queue: VecDeque<String>,
    /// Guilds with a startup member request in flight.
    pub(crate) get_all_users_count: HashSet<String>,
    /// Readiness completes when this quiet-period deadline fires.
    pub(crate) guild_create_deadline: Option<tokio::time::Instant>,
    heartbeat_task: Option<JoinHandle<()>>,
    cmd_tx: mpsc::Sender<ShardCommand>,
    cmd_rx: mpsc::Receiver<ShardCommand>,
}

/// Cloneable front-end to a shard actor.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    id: u32,
    client: Client,
    cmd_tx: mpsc::Sender<ShardCommand>,
}

impl Shard {
    /// Create a shard and its handle. The shard does nothing until
    /// [`Shard::run`] is spawned and [`ShardHandle::connect`] is
    /// called.
    #[must_use]
    pub fn new(id: u32, client: Client) -> (Self, ShardHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let options = client.options();
        let encoding = Encoding::negotiated();
        let shard = Self {
            id,
            session: SessionState::new(options.presence.clone()),
            codec: FrameCodec::new(encoding, options.compress),
            sender: OutboundSender::new(encoding),
            members: MemberRequestTable::new(),
            get_all_users_queue: VecDeque::new(),
            get_all_users_count: HashSet::new(),
            guild_create_deadline: None,
            heartbeat_task: None,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            client: client.clone(),
        };
        let handle = ShardHandle { id, client, cmd_tx };
        (shard, handle)
    }

    /// Shard index.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Run the shard actor.
    ///
    /// Waits for a connect command, then drives the connection cycle
    /// (including reconnects) until a hard stop, after which it waits
    /// for the next connect. Spawn this once per shard; abort the
    /// task to dispose of an idle shard.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; the `Result` is part of the
    /// contract so fatal conditions can be promoted later without
    /// breaking callers.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                return Ok(());
            };
            match cmd {
                ShardCommand::Connect => {
                    if self.connection_cycle().await == CycleEnd::Shutdown {
                        return Ok(());
                    }
                }
                other => self.handle_idle_command(other),
            }
        }
    }

    // ── Reconnect cycle ──────────────────────────────────────

    /// Drive connections until the shard goes idle or shuts down.
    async fn connection_cycle(&mut self) -> CycleEnd {
        loop {
            let end = self.connect_once().await;
            match end {
                LoopEnd::Shutdown => return CycleEnd::Shutdown,
                LoopEnd::Stop => {
                    self.session.hard_reset();
                    return CycleEnd::Idle;
                }
                LoopEnd::Retry { resume } => {
                    let mut resume = resume;
                    let max_attempts = self.client.options().max_reconnect_attempts;
                    if resume && self.session.connect_attempts >= max_attempts {
                        debug!(
                            shard = self.id,
                            attempts = self.session.connect_attempts,
                            "resume attempts exhausted, invalidating session"
                        );
                        self.session.session_id = None;
                        self.session.resume_url = None;
                        resume = false;
                    }
                    if resume {
                        // Resumable sessions reconnect immediately.
                        continue;
                    }
                    let delay = self.session.next_reconnect_delay();
                    info!(
                        shard = self.id,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    match self.backoff_wait(delay).await {
                        WaitEnd::Proceed => {}
                        WaitEnd::Idle => return CycleEnd::Idle,
                        WaitEnd::Shutdown => return CycleEnd::Shutdown,
                    }
                }
            }
        }
    }

    /// Sleep out the reconnect backoff, still serving commands.
    async fn backoff_wait(&mut self, delay: Duration) -> WaitEnd {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return WaitEnd::Proceed,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return WaitEnd::Shutdown,
                    Some(ShardCommand::Connect) => return WaitEnd::Proceed,
                    Some(ShardCommand::Disconnect { reconnect: false }) => {
                        self.session.hard_reset();
                        return WaitEnd::Idle;
                    }
                    Some(ShardCommand::Disconnect { .. }) => {}
                    Some(other) => self.handle_idle_command(other),
                },
            }
        }
    }

    /// One connection attempt: open, handshake, auth, event loop,
    /// teardown.
    async fn connect_once(&mut self) -> LoopEnd {
        self.session.connect_attempts = self.session.connect_attempts.saturating_add(1);
        self.session.status = ShardStatus::Connecting;
        self.codec.reset();
        let url = self.connect_url();
        debug!(
            shard = self.id,
            url = %url,
            attempt = self.session.connect_attempts,
            "connecting to gateway"
        );

        let deadline = tokio::time::Instant::now() + self.client.options().connect_timeout;
        let stream = match tokio::time::timeout_at(deadline, connect_async(url.as_str())).await {
            Err(_) => {
                self.emit_error(GatewayError::ConnectTimeout);
                self.reset_shard();
                return self.retry_auto();
            }
            Ok(Err(error)) => {
                self.emit_error(error.into());
                self.reset_shard();
                return self.retry_auto();
            }
            Ok(Ok((stream, _response))) => stream,
        };

        self.session.status = ShardStatus::Handshaking;
        self.session.last_heartbeat_ack = true;
        self.client.emit(Event::Connect { shard: self.id });

        let (writer, mut reader) = stream.split();
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let writer_task = spawn_writer(writer, ws_rx);
        self.sender.attach(ws_tx.clone());

        let end = match self.wait_for_hello(&mut reader, deadline).await {
            Ok(interval_ms) => {
                let interval = Duration::from_millis(interval_ms);
                self.heartbeat_task =
                    Some(heartbeat::spawn_ticker(interval, self.cmd_tx.clone()));
                if self.session.can_resume() {
                    self.send_resume();
                } else {
                    self.send_identify();
                    // The first heartbeat goes out with identify.
                    let _ = self.heartbeat(false);
                }
                self.event_loop(&mut reader).await
            }
            Err(end) => end,
        };

        self.shutdown_connection(end, ws_tx, writer_task).await;
        end
    }

    /// Close the socket, stop the auxiliary tasks, and reset
    /// transient state. The session identity survives unless the
    /// caller hard-resets afterwards.
    async fn shutdown_connection(
        &mut self,
        end: LoopEnd,
        ws_tx: mpsc::UnboundedSender<Message>,
        writer_task: JoinHandle<()>,
    ) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.sender.detach();

        let (code, reason) = match end {
            LoopEnd::Retry { resume: true } => (RECONNECT_CLOSE_CODE, "Reconnect"),
            _ => (1000, ""),
        };
        let frame = CloseFrame {
            code: code.into(),
            reason: reason.into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame)));
        drop(ws_tx);

        // Give the writer a short grace period to flush.
        let mut writer_task = writer_task;
        tokio::select! {
            _ = &mut writer_task => {}
            () = tokio::time::sleep(Duration::from_secs(2)) => {
                writer_task.abort();
            }
        }

        self.reset_shard();
        self.client.emit(Event::Disconnect { shard: self.id });
    }

    /// Reset transient per-connection state. Outstanding member
    /// requests resolve with whatever they accumulated.
    fn reset_shard(&mut self) {
        self.members.drain();
        self.get_all_users_queue.clear();
        self.get_all_users_count.clear();
        self.guild_create_deadline = None;
        self.session.reset();
        self.session.status = ShardStatus::Disconnected;
    }

    /// Endpoint for the next connection: the stored resume URL when a
    /// session exists, the configured gateway URL otherwise.
    fn connect_url(&self) -> String {
        let options = self.client.options();
        let encoding = self.codec.encoding().as_str();
        if self.session.can_resume() {
            if let Some(resume_url) = &self.session.resume_url {
                let mut url = resume_url.clone();
                if options.compress {
                    url.push_str("&compress=zlib-stream");
                }
                return url;
            }
        }
        protocol::gateway_connect_url(&options.gateway_url, encoding, options.compress)
    }

    // ── Handshake ────────────────────────────────────────────

    /// Read frames until Hello; the connect timeout covers this too.
    async fn wait_for_hello(
        &mut self,
        reader: &mut WsReader,
        deadline: tokio::time::Instant,
    ) -> Result<u64, LoopEnd> {
        loop {
            let frame = match tokio::time::timeout_at(deadline, reader.next()).await {
                Err(_) => {
                    self.emit_error(GatewayError::ConnectTimeout);
                    return Err(self.retry_auto());
                }
                Ok(frame) => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => match self.codec.decode_text(&text) {
                    Ok(packet) => {
                        if let Some(interval) = self.accept_hello(packet) {
                            return Ok(interval);
                        }
                    }
                    Err(error) => self.emit_error(error),
                },
                Some(Ok(Message::Binary(data))) => match self.codec.decode_binary(&data) {
                    Ok(Some(packet)) => {
                        if let Some(interval) = self.accept_hello(packet) {
                            return Ok(interval);
                        }
                    }
                    Ok(None) => {}
                    Err(error) => self.emit_error(error),
                },
                Some(Ok(Message::Close(frame))) => return Err(self.handle_close(frame)),
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    self.emit_error(error.into());
                    return Err(self.retry_auto());
                }
                None => {
                    warn!(shard = self.id, "socket ended before hello");
                    return Err(self.retry_auto());
                }
            }
        }
    }

    /// Emit the raw packet and extract the heartbeat interval if this
    /// is Hello.
    fn accept_hello(&mut self, packet: Packet) -> Option<u64> {
        self.client.emit(Event::Packet {
            shard: self.id,
            packet: packet.clone(),
        });
        if packet.op != opcode::HELLO {
            debug!(shard = self.id, op = packet.op, "ignoring pre-hello packet");
            return None;
        }
        let data = packet.d?;
        match serde_json::from_value::<HelloData>(data) {
            Ok(hello) => Some(hello.heartbeat_interval),
            Err(error) => {
                self.emit_error(error.into());
                None
            }
        }
    }

    // ── Event loop ───────────────────────────────────────────

    async fn event_loop(&mut self, reader: &mut WsReader) -> LoopEnd {
        loop {
            let gc_deadline = self.guild_create_deadline;
            let end: Option<LoopEnd> = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    None => Some(LoopEnd::Shutdown),
                    Some(cmd) => self.handle_command(cmd),
                },
                () = maybe_sleep(gc_deadline) => {
                    self.guild_create_deadline = None;
                    self.check_ready();
                    None
                }
                frame = reader.next() => self.handle_frame(frame),
            };
            if let Some(end) = end {
                return end;
            }
        }
    }

    fn handle_frame(&mut self, frame: Option<Result<Message, WsError>>) -> Option<LoopEnd> {
        match frame {
            Some(Ok(Message::Text(text))) => match self.codec.decode_text(&text) {
                Ok(packet) => self.handle_packet(packet),
                Err(error) => {
                    self.emit_error(error);
                    None
                }
            },
            Some(Ok(Message::Binary(data))) => match self.codec.decode_binary(&data) {
                Ok(Some(packet)) => self.handle_packet(packet),
                Ok(None) => None,
                Err(error) => {
                    self.emit_error(error);
                    None
                }
            },
            Some(Ok(Message::Close(frame))) => Some(self.handle_close(frame)),
            Some(Ok(_)) => None,
            Some(Err(error)) => {
                self.emit_error(error.into());
                Some(self.retry_auto())
            }
            None => {
                warn!(shard = self.id, "gateway stream ended");
                Some(self.retry_auto())
            }
        }
    }

    /// Route one decoded packet by opcode.
    fn handle_packet(&mut self, packet: Packet) -> Option<LoopEnd> {
        self.client.emit(Event::Packet {
            shard: self.id,
            packet: packet.clone(),
        });

        if let Some(s) = packet.s {
            let resuming = self.session.status == ShardStatus::Resuming;
            if self.session.track_sequence(s) && !resuming {
                warn!(
                    shard = self.id,
                    seq = s,
                    "non-consecutive sequence number"
                );
            }
        }

        match packet.op {
            opcode::DISPATCH => {
                self.handle_dispatch(&packet);
                None
            }
            opcode::HEARTBEAT => self.heartbeat(false),
            opcode::HEARTBEAT_ACK => {
                self.session.last_heartbeat_ack = true;
                let now = Instant::now();
                self.session.last_heartbeat_received = Some(now);
                if let Some(sent) = self.session.last_heartbeat_sent {
                    self.session.latency = Some(now.duration_since(sent));
                }
                None
            }
            opcode::RECONNECT => {
                info!(shard = self.id, "server requested reconnect");
                Some(LoopEnd::Retry {
                    resume: self.session.can_resume(),
                })
            }
            opcode::INVALID_SESSION => {
                let resumable = packet
                    .d
                    .as_ref()
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if resumable {
                    info!(shard = self.id, "invalid session, resuming");
                    self.send_resume();
                } else {
                    info!(shard = self.id, "invalid session, re-identifying");
                    self.session.sequence = 0;
                    self.session.session_id = None;
                    self.send_identify();
                }
                None
            }
            opcode::HELLO => {
                warn!(shard = self.id, "unexpected hello mid-session");
                None
            }
            other => {
                debug!(shard = self.id, op = other, "unknown gateway opcode");
                None
            }
        }
    }

    /// Classify a close frame per the close-code policy.
    fn handle_close(&mut self, frame: Option<CloseFrame>) -> LoopEnd {
        let code = frame.as_ref().map_or(1000, |f| u16::from(f.code));
        let reason = frame
            .as_ref()
            .map(|f| f.reason.to_string())
            .unwrap_or_default();
        warn!(shard = self.id, code, reason = %reason, "gateway connection closed");

        if close_code::resets_sequence(code) {
            self.session.sequence = 0;
        }
        if close_code::clears_session(code) {
            self.session.session_id = None;
            self.session.resume_url = None;
        }
        if close_code::is_fatal(code) {
            self.emit_error(GatewayError::from_close_code(code));
            return LoopEnd::Stop;
        }
        if code != 1000 {
            self.emit_error(GatewayError::from_close_code(code));
        }
        self.retry_auto()
    }

    /// Reconnect decision for "default" conditions: follow the
    /// `autoreconnect` configuration.
    fn retry_auto(&self) -> LoopEnd {
        if self.client.options().autoreconnect {
            LoopEnd::Retry {
                resume: self.session.can_resume(),
            }
        } else {
            LoopEnd::Stop
        }
    }

    // ── Commands ─────────────────────────────────────────────

    fn handle_command(&mut self, cmd: ShardCommand) -> Option<LoopEnd> {
        match cmd {
            ShardCommand::Connect => {
                // Exactly one socket per shard.
                self.emit_error(GatewayError::AlreadyConnected);
                None
            }
            ShardCommand::Disconnect { reconnect } => {
                if reconnect {
                    Some(LoopEnd::Retry {
                        resume: self.session.can_resume(),
                    })
                } else {
                    Some(LoopEnd::Stop)
                }
            }
            ShardCommand::Send { op, data, priority } => {
                self.sender.send(op, data, priority);
                None
            }
            ShardCommand::EditStatus { presence } => {
                self.session.presence = presence.clone();
                self.sender
                    .send(opcode::PRESENCE_UPDATE, presence.to_payload(), false);
                None
            }
            ShardCommand::UpdateVoiceState {
                guild_id,
                channel_id,
                self_mute,
                self_deaf,
            } => {
                let payload = protocol::build_voice_state(
                    &guild_id,
                    channel_id.as_deref(),
                    self_mute,
                    self_deaf,
                );
                self.sender.send(opcode::VOICE_STATE_UPDATE, payload, false);
                None
            }
            ShardCommand::RequestMembers {
                guild_id,
                nonce,
                payload,
                timeout,
                reply,
            } => {
                let timeout = timeout.unwrap_or(self.client.options().request_timeout);
                self.install_member_request(nonce, guild_id, Some(reply), timeout);
                self.sender
                    .send(opcode::REQUEST_GUILD_MEMBERS, payload, false);
                None
            }
            ShardCommand::Inspect { reply } => {
                let _ = reply.send(self.session.clone());
                None
            }
            ShardCommand::HeartbeatTick => self.heartbeat(true),
            ShardCommand::MemberRequestTimeout { nonce } => {
                self.on_member_timeout(&nonce);
                None
            }
        }
    }

    fn handle_idle_command(&mut self, cmd: ShardCommand) {
        match cmd {
            ShardCommand::Connect | ShardCommand::Disconnect { .. } => {}
            ShardCommand::Send { op, .. } => {
                trace!(shard = self.id, op, "dropping send while disconnected");
            }
            ShardCommand::EditStatus { presence } => self.session.presence = presence,
            ShardCommand::UpdateVoiceState { .. } => {
                trace!(shard = self.id, "dropping voice state update while disconnected");
            }
            ShardCommand::RequestMembers { reply, .. } => {
                let _ = reply.send(Err(GatewayError::NotConnected));
            }
            ShardCommand::Inspect { reply } => {
                let _ = reply.send(self.session.clone());
            }
            ShardCommand::HeartbeatTick | ShardCommand::MemberRequestTimeout { .. } => {}
        }
    }

    // ── Heartbeat ────────────────────────────────────────────

    /// Send a heartbeat.
    ///
    /// Tick heartbeats check liveness first: an unacknowledged
    /// previous beat means the session is presumed dead. Requested
    /// sends (server `op=1`, the identify-path first beat) neither
    /// check nor clear the ack flag. Tick beats are suppressed while
    /// identifying or resuming.
    pub(crate) fn heartbeat(&mut self, tick: bool) -> Option<LoopEnd> {
        if tick {
            if matches!(
                self.session.status,
                ShardStatus::Resuming | ShardStatus::Identifying
            ) {
                return None;
            }
            if !self.session.last_heartbeat_ack {
                self.emit_error(GatewayError::HeartbeatExpired);
                return Some(LoopEnd::Retry {
                    resume: self.session.can_resume(),
                });
            }
            self.session.last_heartbeat_ack = false;
        }
        self.session.last_heartbeat_sent = Some(Instant::now());
        self.sender.send(
            opcode::HEARTBEAT,
            protocol::build_heartbeat(self.session.sequence),
            true,
        );
        None
    }

    // ── Auth ─────────────────────────────────────────────────

    fn send_resume(&mut self) {
        let Some(session_id) = self.session.session_id.clone() else {
            self.send_identify();
            return;
        };
        self.session.status = ShardStatus::Resuming;
        let payload =
            protocol::build_resume(self.client.token(), &session_id, self.session.sequence);
        self.sender.send(opcode::RESUME, payload, false);
    }

    fn send_identify(&mut self) {
        self.session.status = ShardStatus::Identifying;
        let options = self.client.options();
        let payload = protocol::build_identify(&IdentifyParams {
            token: self.client.token(),
            intents: options.intents,
            compress: options.compress,
            large_threshold: options.large_threshold,
            shard: (self.id, options.shard_count),
            presence: &self.session.presence,
            browser: &options.browser,
            device: &options.device,
        });
        self.sender.send(opcode::IDENTIFY, payload, false);
    }

    // ── Member requests & readiness ──────────────────────────

    pub(crate) fn install_member_request(
        &mut self,
        nonce: String,
        guild_id: String,
        reply: Option<MemberReply>,
        timeout: Duration,
    ) {
        let timer = {
            let cmd_tx = self.cmd_tx.clone();
            let nonce = nonce.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = cmd_tx
                    .send(ShardCommand::MemberRequestTimeout { nonce })
                    .await;
            })
        };
        self.members.insert(
            nonce,
            MemberRequest {
                guild_id,
                members: Vec::new(),
                reply,
                timer,
            },
        );
    }

    pub(crate) fn on_member_timeout(&mut self, nonce: &str) {
        if let Some((guild_id, internal)) = self.members.time_out(nonce) {
            debug!(
                shard = self.id,
                guild = %guild_id,
                "member request timed out, resolving with partial data"
            );
            if internal && self.get_all_users_count.remove(&guild_id) {
                self.check_ready();
            }
        }
    }

    /// Drain the startup chunking queue one guild at a time; once the
    /// queue and the in-flight set are both empty, the shard is ready.
    pub(crate) fn check_ready(&mut self) {
        if self.session.ready {
            return;
        }
        while let Some(guild_id) = self.get_all_users_queue.pop_front() {
            let options = RequestGuildMembersOptions::default();
            match members::build_request(&guild_id, &options, self.client.options().intents) {
                Ok((nonce, payload)) => {
                    self.get_all_users_count.insert(guild_id.clone());
                    let timeout = self.client.options().request_timeout;
                    self.install_member_request(nonce, guild_id, None, timeout);
                    self.sender
                        .send(opcode::REQUEST_GUILD_MEMBERS, payload, false);
                    return;
                }
                Err(error) => {
                    warn!(
                        shard = self.id,
                        guild = %guild_id,
                        error = %error,
                        "skipping startup member chunking"
                    );
                }
            }
        }
        if self.get_all_users_count.is_empty() {
            self.session.ready = true;
            self.client.emit(Event::ShardReady { shard: self.id });
        }
    }

    /// Arm or push back the quiet-period deadline that completes
    /// readiness once startup guilds stop arriving.
    pub(crate) fn restart_guild_create_timeout(&mut self) {
        if self.session.ready {
            return;
        }
        let timeout = self.client.options().guild_create_timeout;
        self.guild_create_deadline = Some(tokio::time::Instant::now() + timeout);
    }

    pub(crate) fn emit_error(&self, error: GatewayError) {
        self.client.emit(Event::Error {
            shard: self.id,
            error,
        });
    }
}

impl ShardHandle {
    /// Shard index this handle talks to.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The client this shard was built against.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Ask the shard to connect.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotConnected`] when the shard actor is gone.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.command(ShardCommand::Connect).await
    }

    /// Tear the connection down. With `reconnect`, the shard resumes
    /// or re-identifies per its session state; without, the session is
    /// hard-reset and the shard goes idle.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotConnected`] when the shard actor is gone.
    pub async fn disconnect(&self, reconnect: bool) -> Result<(), GatewayError> {
        self.command(ShardCommand::Disconnect { reconnect }).await
    }

    /// Queue a raw `{op, d}` send through the rate limiters.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotConnected`] when the shard actor is gone.
    pub async fn send(&self, op: u8, data: Value, priority: bool) -> Result<(), GatewayError> {
        self.command(ShardCommand::Send { op, data, priority }).await
    }

    /// Replace the requested presence.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotConnected`] when the shard actor is gone.
    pub async fn update_presence(&self, presence: Presence) -> Result<(), GatewayError> {
        self.command(ShardCommand::EditStatus { presence }).await
    }

    /// Edit the online status (and optionally activities).
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotConnected`] when the shard actor is gone.
    pub async fn edit_status(
        &self,
        status: PresenceStatus,
        activities: Vec<Value>,
    ) -> Result<(), GatewayError> {
        self.update_presence(Presence {
            status,
            afk: false,
            since: None,
            activities,
        })
        .await
    }

    /// Join, move within, or leave (`channel_id: None`) voice.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotConnected`] when the shard actor is gone.
    pub async fn update_voice_state(
        &self,
        guild_id: impl Into<String>,
        channel_id: Option<String>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), GatewayError> {
        self.command(ShardCommand::UpdateVoiceState {
            guild_id: guild_id.into(),
            channel_id,
            self_mute,
            self_deaf,
        })
        .await
    }

    /// Request guild members, resolving with every member delivered
    /// across the correlated chunk replies (partial on timeout).
    ///
    /// # Errors
    ///
    /// Invalid options fail synchronously before anything is sent;
    /// [`GatewayError::NotConnected`] when the shard has no
    /// connection.
    pub async fn request_guild_members(
        &self,
        guild_id: impl Into<String>,
        options: RequestGuildMembersOptions,
    ) -> Result<Vec<Member>, GatewayError> {
        let guild_id = guild_id.into();
        let (nonce, payload) =
            members::build_request(&guild_id, &options, self.client.options().intents)?;
        let (tx, rx) = oneshot::channel();
        self.command(ShardCommand::RequestMembers {
            guild_id,
            nonce,
            payload,
            timeout: options.timeout,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| GatewayError::NotConnected)?
    }

    /// Snapshot the shard's session state.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotConnected`] when the shard actor is gone.
    pub async fn session(&self) -> Result<SessionState, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.command(ShardCommand::Inspect { reply: tx }).await?;
        rx.await.map_err(|_| GatewayError::NotConnected)
    }

    async fn command(&self, cmd: ShardCommand) -> Result<(), GatewayError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| GatewayError::NotConnected)
    }
}

/// Writer task: owns the sink half and forwards queued frames.
fn spawn_writer(mut writer: WsWriter, mut rx: mpsc::UnboundedReceiver<Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(error) = writer.send(message).await {
                debug!(error = %error, "gateway writer send failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = writer.flush().await;
    })
}

/// Sleep until the deadline, or forever when there is none.
async fn maybe_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
