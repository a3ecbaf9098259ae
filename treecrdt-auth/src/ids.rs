//! Identifier types shared across the auth and sync layers.
//!
//! - `DocId`: opaque non-empty document identifier
//! - `NodeId`: 16-byte tree node id (`ROOT_NODE_ID` = all zeroes)
//! - `ReplicaId`: 32-byte Ed25519 public key of a peer within a document
//! - `KeyId`: BLAKE3("treecrdt/keyid/v1" ‖ pub)[0..16]
//! - `TokenId`: BLAKE3("treecrdt/tokenid/v1" ‖ envelope)[0..16]
//! - `OpRef`: BLAKE3("treecrdt/opref/v0" ‖ doc_id ‖ replica ‖ counter)[0..16]
//!
//! 16 bytes is sufficient for collision resistance within a document context
//! while keeping refs compact for storage and wire transfer.

use std::fmt;

use crate::error::AuthError;

const KEY_ID_DOMAIN: &[u8] = b"treecrdt/keyid/v1";
const TOKEN_ID_DOMAIN: &[u8] = b"treecrdt/tokenid/v1";
const OP_REF_DOMAIN: &[u8] = b"treecrdt/opref/v0";

/// The fixed root node of every document tree.
pub const ROOT_NODE_ID: NodeId = NodeId([0u8; 16]);

fn derive16(domain: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    out
}

/// Opaque document identifier. Scopes all capability tokens and signatures.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Result<Self, AuthError> {
        let id = id.into();
        if id.is_empty() {
            return Err(AuthError::Malformed("empty doc id".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

/// 16-byte tree node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| AuthError::Malformed(format!("node id must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        *self == ROOT_NODE_ID
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(s).map_err(|e| AuthError::Malformed(format!("bad node id hex: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// The signing identity of a peer within a document: a raw Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(pub [u8; 32]);

impl ReplicaId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::Malformed(format!("replica id must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn key_id(&self) -> KeyId {
        KeyId::from_public_key(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({}…)", &self.to_hex()[..8])
    }
}

/// Stable 16-byte handle for a public key, used to index grants by author.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        Self(derive16(KEY_ID_DOMAIN, &[public]))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

/// Stable 16-byte handle for a capability token envelope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub [u8; 16]);

impl TokenId {
    pub fn from_envelope(envelope: &[u8]) -> Self {
        Self(derive16(TOKEN_ID_DOMAIN, &[envelope]))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| AuthError::Malformed(format!("token id must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(s).map_err(|e| AuthError::Malformed(format!("bad token id hex: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.to_hex())
    }
}

/// Deterministic 16-byte digest identifying an op within a document.
///
/// Two peers derive identical refs for the same op without exchanging the op
/// body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpRef(pub [u8; 16]);

impl OpRef {
    pub fn derive(doc_id: &DocId, replica: &ReplicaId, counter: u64) -> Self {
        Self(derive16(
            OP_REF_DOMAIN,
            &[doc_id.as_bytes(), replica.as_bytes(), &counter.to_be_bytes()],
        ))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| AuthError::Malformed(format!("op ref must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpRef({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_rejects_empty() {
        assert!(DocId::new("").is_err());
        assert!(DocId::new("doc-1").is_ok());
    }

    #[test]
    fn key_id_is_stable() {
        let pk = [7u8; 32];
        assert_eq!(KeyId::from_public_key(&pk), KeyId::from_public_key(&pk));
        assert_ne!(KeyId::from_public_key(&pk), KeyId::from_public_key(&[8u8; 32]));
    }

    #[test]
    fn op_ref_depends_on_all_inputs() {
        let doc = DocId::new("doc").unwrap();
        let other = DocId::new("doc2").unwrap();
        let replica = ReplicaId::from_bytes([1u8; 32]);
        let base = OpRef::derive(&doc, &replica, 1);
        assert_eq!(base, OpRef::derive(&doc, &replica, 1));
        assert_ne!(base, OpRef::derive(&other, &replica, 1));
        assert_ne!(base, OpRef::derive(&doc, &replica, 2));
        assert_ne!(base, OpRef::derive(&doc, &ReplicaId::from_bytes([2u8; 32]), 1));
    }

    #[test]
    fn node_id_hex_round_trip() {
        let node = NodeId::from_bytes([0xab; 16]);
        assert_eq!(NodeId::from_hex(&node.to_hex()).unwrap(), node);
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(ROOT_NODE_ID.is_root());
        assert!(!node.is_root());
    }
}
