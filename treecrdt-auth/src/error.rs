//! Error types for the authorization core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// CBOR/COSE structure did not parse or violated a size/shape invariant.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Ed25519 signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Token audience does not match the document.
    #[error("audience mismatch: token is for {actual}, expected {expected}")]
    AudienceMismatch { expected: String, actual: String },

    /// Token `exp` is in the past.
    #[error("capability token expired")]
    Expired,

    /// Token `nbf` is in the future.
    #[error("capability token not yet valid")]
    NotYetValid,

    /// No configured issuer verifies the envelope and no delegation proof is
    /// present.
    #[error("unknown issuer")]
    UnknownIssuer,

    /// A delegation chain rule was violated (missing proof, cycle, depth,
    /// scope or window widening).
    #[error("bad delegation: {0}")]
    BadDelegation(String),

    /// The token id is covered by a revocation record.
    #[error("capability token revoked")]
    TokenRevoked,

    /// The peer is not authorized for the requested op or filter.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Scope cannot be decided yet; the caller may park the op and retry once
    /// more tree context arrives.
    #[error("missing subtree context to authorize {0}")]
    MissingContext(String),

    /// An op arrived without usable auth and `allow_unsigned` is off.
    #[error("unsigned op rejected")]
    UnsignedOp,

    /// A relayed op has no cached or persisted auth entry.
    #[error("cannot forward unsigned op")]
    CannotForward,

    /// `require_proof_ref` is set and the op auth's proof_ref is absent or
    /// unknown.
    #[error("proof_ref mismatch: {0}")]
    ProofRefMismatch(String),

    /// Keystore sealing/opening failed.
    #[error("keystore: {0}")]
    Keystore(String),

    /// Underlying backend (tree context / op-auth store) failure.
    #[error("backend: {0}")]
    Backend(String),
}

impl AuthError {
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
