//! Error types for the gateway shard.

/// Errors produced by a gateway shard.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// `WebSocket` transport error.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON encode/decode error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Streaming inflater failure on a compressed frame.
    #[error("zlib stream error: {0}")]
    Inflate(String),

    /// External Term Format encode/decode error.
    #[error("etf error: {0}")]
    Etf(String),

    /// The gateway closed the connection with a close code.
    #[error("connection closed: {code} ({message})")]
    CloseCode {
        /// Numeric close code from the close frame.
        code: u16,
        /// Human-readable classification of the code.
        message: &'static str,
    },

    /// The socket did not open (or Hello did not arrive) in time.
    #[error("connection timeout")]
    ConnectTimeout,

    /// The previous heartbeat was never acknowledged.
    #[error("server didn't acknowledge previous heartbeat, possible lost connection")]
    HeartbeatExpired,

    /// `connect()` was invoked while a socket already exists.
    #[error("shard already has an active connection")]
    AlreadyConnected,

    /// The shard has no active connection (or its actor has stopped).
    #[error("shard is not connected")]
    NotConnected,

    /// Requesting all guild members requires the `GUILD_MEMBERS` intent.
    #[error("requesting all guild members requires the GUILD_MEMBERS intent")]
    MissingMembersIntent,

    /// Requesting presences requires the `GUILD_PRESENCES` intent.
    #[error("requesting presences requires the GUILD_PRESENCES intent")]
    MissingPresencesIntent,

    /// More than 100 user IDs in a single member request.
    #[error("cannot request more than 100 users by id")]
    TooManyUserIds,

    /// Protocol violation from the gateway.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl GatewayError {
    /// Build the typed error for a gateway close code.
    #[must_use]
    pub fn from_close_code(code: u16) -> Self {
        Self::CloseCode {
            code,
            message: crate::protocol::close_code::message(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_error_carries_code_and_message() {
        let err = GatewayError::from_close_code(4004);
        assert!(err.to_string().contains("4004"));
        assert!(err.to_string().contains("Invalid Token"));
    }

    #[test]
    fn validation_errors_are_descriptive() {
        assert!(
            GatewayError::TooManyUserIds
                .to_string()
                .contains("more than 100")
        );
        assert!(
            GatewayError::MissingMembersIntent
                .to_string()
                .contains("GUILD_MEMBERS")
        );
    }

    #[test]
    fn heartbeat_expired_message() {
        let err = GatewayError::HeartbeatExpired;
        assert!(err.to_string().contains("heartbeat"));
    }
}
