//! Wire protocol: closed, tagged message envelopes.
//!
//! Every message — client↔server over WebSocket and peer↔peer over the
//! cluster transport — is one variant of a closed enum, serialized as named
//! MsgPack with an adjacent `type` tag and a `payload` map. Dispatch is a
//! `match` on the decoded enum; there is no string-keyed registry to drift
//! out of sync with the handlers.

pub mod client;
pub mod peer;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use client::{
    AuthPayload, ChangeKind, ClientMessage, ClientOp, Consistency, EventKind, LwwDiffEntry,
    OpBody, OrDiffEntry, QueryHit, SearchHit, SearchQuery, ServerMessage,
};
pub use peer::{
    MapKind, MemberInfo, MembersView, PeerMessage, ReplicatedOp, SubSpec, SubscriptionRegistration,
};

/// Close / error codes surfaced to clients.
pub mod codes {
    /// Missing or invalid credentials.
    pub const UNAUTHORIZED: u16 = 401;
    /// Authenticated but not allowed.
    pub const FORBIDDEN: u16 = 403;
    /// Malformed message or operation.
    pub const BAD_REQUEST: u16 = 400;
    /// Connection refused before or during authentication.
    pub const CONNECTION_REJECTED: u16 = 4000;
    /// Evicted for missing heartbeats.
    pub const HEARTBEAT_TIMEOUT: u16 = 4002;
    /// Per-client operation budget exceeded.
    pub const RATE_LIMIT_EXCEEDED: u16 = 429;
    /// Client state predates the GC cutoff and must be discarded.
    pub const SYNC_RESET_REQUIRED: u16 = 449;
}

/// Failure to encode or decode a wire message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serializes a message to named MsgPack bytes.
///
/// # Errors
///
/// Returns [`WireError::Encode`] when the value cannot be represented,
/// which for these closed types indicates a bug rather than bad input.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Deserializes a message from MsgPack bytes.
///
/// # Errors
///
/// Returns [`WireError::Decode`] for truncated or mistyped input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::record::LwwRecord;
    use crate::value::Value;

    #[test]
    fn client_message_roundtrip() {
        let msg = ClientMessage::Ping { timestamp: 1_700_000_000_000 };
        let bytes = encode(&msg).unwrap();
        let back: ClientMessage = decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let msg = ClientMessage::Ping { timestamp: 42 };
        let bytes = encode(&msg).unwrap();
        let err = decode::<ClientMessage>(&bytes[..bytes.len() - 1]);
        assert!(err.is_err());
    }

    #[test]
    fn server_message_roundtrip_with_record() {
        let msg = ServerMessage::ServerEvent {
            map_name: "users".into(),
            key: "100".into(),
            event: EventKind::Set,
            record: Some(LwwRecord::live(
                Value::from("Iceman"),
                Timestamp::new(1, 0, "n1"),
                None,
            )),
        };
        let bytes = encode(&msg).unwrap();
        let back: ServerMessage = decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }
}
