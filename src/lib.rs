//! corvus-gateway: a sharded Discord Gateway client runtime.
//!
//! Each [`Shard`] maintains a durable, authenticated WebSocket session
//! with the gateway: it demultiplexes server dispatch events into a
//! shared entity cache and a typed event stream, multiplexes outbound
//! commands through token-bucket rate limiters, and recovers from
//! transport and session failures by resuming or re-identifying.
//!
//! # Architecture
//!
//! ```text
//! Shard (actor task)
//! ├── FrameCodec          zlib-stream inflation + JSON/ETF decode
//! ├── SessionState        sequence, session id, status, backoff
//! ├── heartbeat ticker    liveness probe keyed by last sequence
//! ├── DispatchRouter      cache updates + typed event emission
//! ├── OutboundSender      global + presence token buckets → writer
//! └── MemberRequestTable  nonce-correlated member chunking
//! Client
//! ├── caches              guilds, users, routing maps
//! └── EventBus            broadcast of Arc<Event>
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use corvus_gateway::{Client, Event, Shard, ShardOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(std::env::var("BOT_TOKEN")?, ShardOptions::default());
//!     let mut events = client.subscribe();
//!
//!     let (shard, handle) = Shard::new(0, client);
//!     tokio::spawn(shard.run());
//!     handle.connect().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let Event::MessageCreate(message) = &*event {
//!             println!("{}", message.content);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod bucket;
pub mod client;
pub mod codec;
pub mod config;
mod dispatch;
pub mod error;
#[cfg(feature = "etf")]
mod etf;
pub mod events;
mod heartbeat;
pub mod members;
pub mod model;
pub mod protocol;
mod sender;
pub mod session;
pub mod shard;

pub use client::Client;
pub use codec::Encoding;
pub use config::ShardOptions;
pub use error::GatewayError;
pub use events::{Event, EventBus};
pub use members::RequestGuildMembersOptions;
pub use model::{
    Channel, Guild, HasId, MaybeCached, Member, Message, Reaction, User, VoiceState,
};
pub use protocol::{GATEWAY_VERSION, Packet, Presence, PresenceStatus, close_code, intents, opcode};
pub use session::{SessionState, ShardStatus};
pub use shard::{Shard, ShardHandle};
