//! Convenience re-exports for common usage.
//!
//! ```rust,ignore
//! use corvus_gateway::prelude::*;
//! ```

pub use crate::client::Client;
pub use crate::config::ShardOptions;
pub use crate::error::GatewayError;
pub use crate::events::{Event, EventBus};
pub use crate::members::RequestGuildMembersOptions;
pub use crate::model::{Channel, Guild, MaybeCached, Member, Message, User, VoiceState};
pub use crate::protocol::{Packet, Presence, PresenceStatus, intents, opcode};
pub use crate::session::{SessionState, ShardStatus};
pub use crate::shard::{Shard, ShardHandle};
