//! Guild member request correlation.
//!
//! Outbound `REQUEST_GUILD_MEMBERS` commands are correlated with their
//! chunked replies by a random 128-bit hex nonce. Each pending request
//! holds an accumulator, a completion channel, and a timeout timer;
//! timing out resolves with whatever members have accumulated, and a
//! shard reset resolves every outstanding request the same way.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::Member;
use crate::protocol::intents;

/// Options for a guild member request.
#[derive(Debug, Clone, Default)]
pub struct RequestGuildMembersOptions {
    /// Maximum members to return; 0 (the default) means no limit.
    pub limit: Option<u64>,
    /// Specific user IDs to fetch (at most 100).
    pub user_ids: Option<Vec<String>>,
    /// Username prefix filter; an empty string matches everyone.
    pub query: Option<String>,
    /// Also deliver presences (requires the `GUILD_PRESENCES` intent).
    pub presences: bool,
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
}

/// Completion channel for a member request.
pub(crate) type MemberReply = oneshot::Sender<Result<Vec<Member>, GatewayError>>;

/// Validate options and build the wire payload plus its nonce.
///
/// Fails synchronously, before anything is sent:
/// - requesting all members (no IDs, no query) needs `GUILD_MEMBERS`;
/// - `presences` needs `GUILD_PRESENCES`;
/// - more than 100 user IDs is rejected.
pub(crate) fn build_request(
    guild_id: &str,
    options: &RequestGuildMembersOptions,
    intent_bits: u32,
) -> Result<(String, Value), GatewayError> {
    if let Some(ids) = &options.user_ids {
        if ids.len() > 100 {
            return Err(GatewayError::TooManyUserIds);
        }
    }
    let requests_all = options.user_ids.is_none() && options.query.is_none();
    if requests_all && intent_bits & intents::GUILD_MEMBERS == 0 {
        return Err(GatewayError::MissingMembersIntent);
    }
    if options.presences && intent_bits & intents::GUILD_PRESENCES == 0 {
        return Err(GatewayError::MissingPresencesIntent);
    }

    let nonce = Uuid::new_v4().simple().to_string();
    let mut payload = json!({
        "guild_id": guild_id,
        "limit": options.limit.unwrap_or(0),
        "presences": options.presences,
        "nonce": nonce,
    });
    if let Some(ids) = &options.user_ids {
        payload["user_ids"] = json!(ids);
    }
    if let Some(query) = &options.query {
        payload["query"] = json!(query);
    } else if options.user_ids.is_none() {
        payload["query"] = json!("");
    }
    Ok((nonce, payload))
}

/// One in-flight member request.
pub(crate) struct MemberRequest {
    /// Guild the request targets.
    pub(crate) guild_id: String,
    /// Members accumulated across chunks.
    pub(crate) members: Vec<Member>,
    /// Completion channel; `None` for requests issued internally by
    /// the readiness drain.
    pub(crate) reply: Option<MemberReply>,
    /// Timeout timer task.
    pub(crate) timer: JoinHandle<()>,
}

/// Pending member requests keyed by nonce.
#[derive(Default)]
pub(crate) struct MemberRequestTable {
    entries: HashMap<String, MemberRequest>,
}

impl MemberRequestTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, nonce: String, request: MemberRequest) {
        self.entries.insert(nonce, request);
    }

    pub(crate) fn contains(&self, nonce: &str) -> bool {
        self.entries.contains_key(nonce)
    }

    /// Append one chunk's members to the accumulator.
    pub(crate) fn append(&mut self, nonce: &str, members: &[Member]) {
        if let Some(entry) = self.entries.get_mut(nonce) {
            entry.members.extend_from_slice(members);
        }
    }

    /// Resolve a request with its accumulated members after the final
    /// chunk. Returns the guild ID and whether the request was
    /// internal (no caller waiting).
    pub(crate) fn finish(&mut self, nonce: &str) -> Option<(String, bool)> {
        let entry = self.entries.remove(nonce)?;
        entry.timer.abort();
        let internal = entry.reply.is_none();
        if let Some(reply) = entry.reply {
            let _ = reply.send(Ok(entry.members));
        }
        Some((entry.guild_id, internal))
    }

    /// Resolve a timed-out request with partial data. Late chunks for
    /// the nonce are ignored from here on.
    pub(crate) fn time_out(&mut self, nonce: &str) -> Option<(String, bool)> {
        let entry = self.entries.remove(nonce)?;
        let internal = entry.reply.is_none();
        if let Some(reply) = entry.reply {
            let _ = reply.send(Ok(entry.members));
        }
        Some((entry.guild_id, internal))
    }

    /// Resolve every outstanding request with partial data (shard
    /// reset).
    pub(crate) fn drain(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
            if let Some(reply) = entry.reply {
                let _ = reply.send(Ok(entry.members));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const MEMBERS_AND_PRESENCES: u32 = intents::GUILD_MEMBERS | intents::GUILD_PRESENCES;

    fn member(id: &str) -> Member {
        Member::from_value(&json!({"user": {"id": id}})).unwrap()
    }

    #[test]
    fn defaults_request_everyone_with_empty_query() {
        let (nonce, payload) = build_request(
            "g1",
            &RequestGuildMembersOptions::default(),
            MEMBERS_AND_PRESENCES,
        )
        .unwrap();
        assert_eq!(nonce.len(), 32, "nonce is 128 bits of hex");
        assert_eq!(payload["guild_id"], "g1");
        assert_eq!(payload["limit"], 0);
        assert_eq!(payload["query"], "");
        assert_eq!(payload["nonce"], json!(nonce));
        assert!(payload.get("user_ids").is_none());
    }

    #[test]
    fn user_id_requests_skip_the_query_field() {
        let options = RequestGuildMembersOptions {
            user_ids: Some(vec!["u1".to_string(), "u2".to_string()]),
            ..Default::default()
        };
        let (_, payload) = build_request("g1", &options, 0).unwrap();
        assert_eq!(payload["user_ids"], json!(["u1", "u2"]));
        assert!(payload.get("query").is_none());
    }

    #[test]
    fn all_members_without_intent_is_rejected() {
        let err = build_request("g1", &RequestGuildMembersOptions::default(), 0).unwrap_err();
        assert!(matches!(err, GatewayError::MissingMembersIntent));
    }

    #[test]
    fn presences_without_intent_is_rejected() {
        let options = RequestGuildMembersOptions {
            query: Some(String::new()),
            presences: true,
            ..Default::default()
        };
        let err = build_request("g1", &options, intents::GUILD_MEMBERS).unwrap_err();
        assert!(matches!(err, GatewayError::MissingPresencesIntent));
    }

    #[test]
    fn more_than_100_user_ids_is_rejected() {
        let options = RequestGuildMembersOptions {
            user_ids: Some((0..150).map(|i| format!("u{i}")).collect()),
            ..Default::default()
        };
        let err = build_request("g1", &options, MEMBERS_AND_PRESENCES).unwrap_err();
        assert!(matches!(err, GatewayError::TooManyUserIds));
    }

    #[test]
    fn nonces_are_unique() {
        let options = RequestGuildMembersOptions {
            query: Some(String::new()),
            ..Default::default()
        };
        let (a, _) = build_request("g1", &options, 0).unwrap();
        let (b, _) = build_request("g1", &options, 0).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn finish_resolves_with_accumulated_members() {
        let mut table = MemberRequestTable::new();
        let (tx, rx) = oneshot::channel();
        table.insert(
            "n1".to_string(),
            MemberRequest {
                guild_id: "g1".to_string(),
                members: Vec::new(),
                reply: Some(tx),
                timer: tokio::spawn(async {}),
            },
        );

        table.append("n1", &[member("u1")]);
        table.append("n1", &[member("u2")]);
        let (guild_id, internal) = table.finish("n1").unwrap();

        assert_eq!(guild_id, "g1");
        assert!(!internal);
        let members = rx.await.unwrap().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn time_out_resolves_with_partial_data() {
        let mut table = MemberRequestTable::new();
        let (tx, rx) = oneshot::channel();
        table.insert(
            "n1".to_string(),
            MemberRequest {
                guild_id: "g1".to_string(),
                members: vec![member("u1")],
                reply: Some(tx),
                timer: tokio::spawn(async {}),
            },
        );

        table.time_out("n1").unwrap();
        let members = rx.await.unwrap().unwrap();
        assert_eq!(members.len(), 1);

        // Late chunks for the nonce are ignored.
        table.append("n1", &[member("u2")]);
        assert!(table.finish("n1").is_none());
    }

    #[tokio::test]
    async fn drain_resolves_everything() {
        let mut table = MemberRequestTable::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        for (nonce, tx) in [("a", tx_a), ("b", tx_b)] {
            table.insert(
                nonce.to_string(),
                MemberRequest {
                    guild_id: "g1".to_string(),
                    members: vec![member("u1")],
                    reply: Some(tx),
                    timer: tokio::spawn(async {}),
                },
            );
        }

        table.drain();
        assert_eq!(rx_a.await.unwrap().unwrap().len(), 1);
        assert_eq!(rx_b.await.unwrap().unwrap().len(), 1);
        assert_eq!(table.pending(), 0);
    }
}
