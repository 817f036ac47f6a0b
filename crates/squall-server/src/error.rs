//! Server error kinds and their client-facing projection.
//!
//! One closed enum covers the failure classes the grid distinguishes. Peer
//! I/O problems never surface here directly — the replication pipeline
//! swallows them and reports partial failure through `failed_nodes` — and
//! client-visible failures are always delivered as a typed `ERROR` envelope.

use squall_core::protocol::codes;

/// A failure in the operation or subscription path.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// Invalid, expired, or missing credentials; the connection is closed.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Policy denies the action; the op is dropped, the connection survives.
    #[error("forbidden: {action} on {map_name}")]
    Permission { map_name: String, action: &'static str },

    /// Malformed message or operation.
    #[error("bad request: {0}")]
    Validation(String),

    /// Per-client operation budget exceeded.
    #[error("rate limit exceeded: {max_ops} ops per {window_ms}ms")]
    RateLimit { window_ms: u64, max_ops: u32 },

    /// An interceptor rejected the operation.
    #[error("operation rejected: {0}")]
    Rejected(String),

    /// A distributed wait (quorum write, subscription fan-out) hit its deadline.
    #[error("ack timeout after {timeout_ms}ms; missing {missing:?}")]
    AckTimeout { timeout_ms: u64, missing: Vec<String> },

    /// The client's sync state predates the GC cutoff.
    #[error("sync reset required for map {map_name}")]
    SyncResetRequired { map_name: String },

    /// Unrecoverable startup or runtime failure; the node withdraws.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GridError {
    /// The wire code delivered with the `ERROR` envelope.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            GridError::Auth(_) => codes::UNAUTHORIZED,
            GridError::Permission { .. } => codes::FORBIDDEN,
            GridError::Validation(_) | GridError::Rejected(_) => codes::BAD_REQUEST,
            GridError::RateLimit { .. } => codes::RATE_LIMIT_EXCEEDED,
            GridError::AckTimeout { .. } => codes::BAD_REQUEST,
            GridError::SyncResetRequired { .. } => codes::SYNC_RESET_REQUIRED,
            GridError::Fatal(_) => codes::CONNECTION_REJECTED,
        }
    }

    /// Whether the client connection should be closed after delivery.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, GridError::Auth(_) | GridError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_spec_values() {
        assert_eq!(GridError::Auth("x".into()).code(), 401);
        assert_eq!(
            GridError::Permission { map_name: "m".into(), action: "write" }.code(),
            403
        );
        assert_eq!(GridError::Validation("x".into()).code(), 400);
        assert_eq!(GridError::RateLimit { window_ms: 1000, max_ops: 5 }.code(), 429);
        assert_eq!(
            GridError::SyncResetRequired { map_name: "m".into() }.code(),
            449
        );
    }

    #[test]
    fn only_auth_and_fatal_are_terminal() {
        assert!(GridError::Auth("x".into()).is_terminal());
        assert!(GridError::Fatal("x".into()).is_terminal());
        assert!(!GridError::RateLimit { window_ms: 1, max_ops: 1 }.is_terminal());
        assert!(!GridError::Validation("x".into()).is_terminal());
    }
}
