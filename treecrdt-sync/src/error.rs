//! Error types for sync sessions.

use thiserror::Error;
use treecrdt_auth::AuthError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer (or our own auth layer) refused the op or filter.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The responder rejected our filter in its HelloAck.
    #[error("filter rejected ({reason}): {}", message.as_deref().unwrap_or("no detail"))]
    Rejected {
        reason: String,
        message: Option<String>,
    },

    /// Set reconciliation failed on the responder side.
    #[error("riblt: {0}")]
    Riblt(String),

    /// The encoder hit the codeword ceiling without a status from the peer.
    #[error("max codewords exceeded")]
    MaxCodewords,

    /// The session's futures were dropped (peer vanished or session replaced).
    #[error("session closed")]
    SessionClosed,

    /// A message violated the wire protocol.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Message bytes did not decode.
    #[error("codec: {0}")]
    Codec(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("backend: {0}")]
    Backend(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    /// The pending-reprocess loop kept making progress for 100 rounds; that
    /// means something is re-inserting rows and needs surfacing.
    #[error("pending reprocess did not converge")]
    ReprocessDiverged,
}

impl SyncError {
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
