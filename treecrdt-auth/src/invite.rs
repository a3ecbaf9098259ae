//! Out-of-band invite and in-band auth-grant payloads.
//!
//! Invites travel as a `#invite=<b64>` URL fragment or clipboard text:
//! base64url over versioned JSON. Auth grants are broadcast in-band to hand a
//! newly issued token (and optionally the payload key) to a specific replica.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

const INVITE_VERSION: u32 = 1;
const INVITE_TYPE: &str = "invite";
const AUTH_GRANT_TYPE: &str = "auth_grant_v1";

/// Everything a recipient needs to join a document: the issuer to trust, a
/// subject keypair, and a token binding the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub v: u32,
    pub t: String,
    pub doc_id: String,
    pub issuer_pk_b64: String,
    pub subject_sk_b64: String,
    pub token_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_key_b64: Option<String>,
}

impl InvitePayload {
    pub fn new(
        doc_id: impl Into<String>,
        issuer_pk: &[u8; 32],
        subject_sk: &[u8; 32],
        token: &[u8],
        payload_key: Option<&[u8; 32]>,
    ) -> Self {
        Self {
            v: INVITE_VERSION,
            t: INVITE_TYPE.to_string(),
            doc_id: doc_id.into(),
            issuer_pk_b64: URL_SAFE_NO_PAD.encode(issuer_pk),
            subject_sk_b64: URL_SAFE_NO_PAD.encode(subject_sk),
            token_b64: URL_SAFE_NO_PAD.encode(token),
            payload_key_b64: payload_key.map(|k| URL_SAFE_NO_PAD.encode(k)),
        }
    }

    /// Encode for transport (URL fragment / clipboard).
    pub fn encode(&self) -> Result<String, AuthError> {
        let json = serde_json::to_vec(self).map_err(|e| AuthError::Malformed(format!("invite encode: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self, AuthError> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| AuthError::Malformed(format!("bad invite encoding: {e}")))?;
        let invite: Self =
            serde_json::from_slice(&json).map_err(|e| AuthError::Malformed(format!("invite decode: {e}")))?;
        if invite.v != INVITE_VERSION {
            return Err(AuthError::Malformed(format!("unsupported invite version {}", invite.v)));
        }
        if invite.t != INVITE_TYPE {
            return Err(AuthError::Malformed(format!("unexpected invite type {}", invite.t)));
        }
        if invite.doc_id.is_empty() {
            return Err(AuthError::Malformed("invite has empty doc_id".into()));
        }
        Ok(invite)
    }

    pub fn issuer_pk(&self) -> Result<[u8; 32], AuthError> {
        decode_fixed(&self.issuer_pk_b64, "issuer_pk")
    }

    pub fn subject_sk(&self) -> Result<[u8; 32], AuthError> {
        decode_fixed(&self.subject_sk_b64, "subject_sk")
    }

    pub fn token(&self) -> Result<Vec<u8>, AuthError> {
        URL_SAFE_NO_PAD
            .decode(&self.token_b64)
            .map_err(|e| AuthError::Malformed(format!("bad token encoding: {e}")))
    }

    pub fn payload_key(&self) -> Result<Option<[u8; 32]>, AuthError> {
        self.payload_key_b64
            .as_deref()
            .map(|k| decode_fixed(k, "payload_key"))
            .transpose()
    }
}

fn decode_fixed(encoded: &str, what: &str) -> Result<[u8; 32], AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| AuthError::Malformed(format!("bad {what} encoding: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| AuthError::Malformed(format!("{what} must be 32 bytes")))
}

/// In-band broadcast delivering a freshly issued token to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthGrantMessage {
    pub t: String,
    pub doc_id: String,
    pub to_replica_pk_hex: String,
    pub issuer_pk_b64: String,
    pub token_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes_token_ids_hex: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_key_b64: Option<String>,
    pub from_peer_id: String,
    pub ts: u64,
}

impl AuthGrantMessage {
    pub fn encode(&self) -> Result<String, AuthError> {
        serde_json::to_string(self).map_err(|e| AuthError::Malformed(format!("auth grant encode: {e}")))
    }

    pub fn decode(json: &str) -> Result<Self, AuthError> {
        let msg: Self =
            serde_json::from_str(json).map_err(|e| AuthError::Malformed(format!("auth grant decode: {e}")))?;
        if msg.t != AUTH_GRANT_TYPE {
            return Err(AuthError::Malformed(format!("unexpected auth grant type {}", msg.t)));
        }
        Ok(msg)
    }

    pub fn new_grant(
        doc_id: impl Into<String>,
        to_replica_pk_hex: impl Into<String>,
        issuer_pk: &[u8; 32],
        token: &[u8],
        from_peer_id: impl Into<String>,
        ts: u64,
    ) -> Self {
        Self {
            t: AUTH_GRANT_TYPE.to_string(),
            doc_id: doc_id.into(),
            to_replica_pk_hex: to_replica_pk_hex.into(),
            issuer_pk_b64: URL_SAFE_NO_PAD.encode(issuer_pk),
            token_b64: URL_SAFE_NO_PAD.encode(token),
            supersedes_token_ids_hex: None,
            payload_key_b64: None,
            from_peer_id: from_peer_id.into(),
            ts,
        }
    }
}
