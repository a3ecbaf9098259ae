//! Tree operations as seen by the auth layer.
//!
//! The CRDT semantics of an op are opaque here; auth only needs the canonical
//! fields (`meta.id`, `meta.lamport`, kind + node ids) to derive refs, build
//! the signing input, and evaluate scope. The stable CBOR encoding defined
//! here is what travels in `OpsBatch` messages and what the pending sidecar
//! persists.

use ciborium::value::Value;

use crate::cbor;
use crate::error::AuthError;
use crate::ids::{DocId, NodeId, OpRef, ReplicaId};

/// Domain prefix for the op signing input. The byte string built by
/// [`Operation::sign_input`] is the only data ever fed to Ed25519 for op
/// signatures.
const OP_SIG_DOMAIN: &[u8] = b"treecrdt/op-sig/v1";
const OP_SIG_VERSION: u8 = 0x00;

/// Unique id of an op: authoring replica plus per-replica counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpMeta {
    pub id: OpId,
    pub lamport: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Insert {
        parent: NodeId,
        node: NodeId,
        order_key: Vec<u8>,
        payload: Option<Vec<u8>>,
    },
    Move {
        node: NodeId,
        new_parent: NodeId,
        order_key: Vec<u8>,
    },
    Delete {
        node: NodeId,
    },
    Tombstone {
        node: NodeId,
    },
    Payload {
        node: NodeId,
        payload: Option<Vec<u8>>,
    },
}

impl OpKind {
    fn tag(&self) -> u8 {
        match self {
            OpKind::Insert { .. } => 1,
            OpKind::Move { .. } => 2,
            OpKind::Delete { .. } => 3,
            OpKind::Tombstone { .. } => 4,
            OpKind::Payload { .. } => 5,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            OpKind::Insert { .. } => "insert",
            OpKind::Move { .. } => "move",
            OpKind::Delete { .. } => "delete",
            OpKind::Tombstone { .. } => "tombstone",
            OpKind::Payload { .. } => "payload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub meta: OpMeta,
    pub kind: OpKind,
}

fn put_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_opt_payload(out: &mut Vec<u8>, payload: &Option<Vec<u8>>) {
    match payload {
        Some(p) => {
            out.push(1);
            put_len_prefixed(out, p);
        }
        None => out.push(0),
    }
}

impl Operation {
    pub fn replica(&self) -> ReplicaId {
        self.meta.id.replica
    }

    pub fn counter(&self) -> u64 {
        self.meta.id.counter
    }

    pub fn lamport(&self) -> u64 {
        self.meta.lamport
    }

    /// The node this op is primarily about.
    pub fn target_node(&self) -> NodeId {
        match &self.kind {
            OpKind::Insert { node, .. }
            | OpKind::Move { node, .. }
            | OpKind::Delete { node }
            | OpKind::Tombstone { node }
            | OpKind::Payload { node, .. } => *node,
        }
    }

    /// The parent node the op anchors under, when the op itself names one.
    pub fn anchor_parent(&self) -> Option<NodeId> {
        match &self.kind {
            OpKind::Insert { parent, .. } => Some(*parent),
            OpKind::Move { new_parent, .. } => Some(*new_parent),
            _ => None,
        }
    }

    pub fn op_ref(&self, doc_id: &DocId) -> OpRef {
        OpRef::derive(doc_id, &self.meta.id.replica, self.meta.id.counter)
    }

    /// Canonical `op-sig/v1` signing input; stable across peers.
    pub fn sign_input(&self, doc_id: &DocId) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(OP_SIG_DOMAIN);
        out.push(OP_SIG_VERSION);
        put_len_prefixed(&mut out, doc_id.as_bytes());
        put_len_prefixed(&mut out, self.meta.id.replica.as_bytes());
        out.extend_from_slice(&self.meta.id.counter.to_be_bytes());
        out.extend_from_slice(&self.meta.lamport.to_be_bytes());
        out.push(self.kind.tag());
        match &self.kind {
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            } => {
                out.extend_from_slice(parent.as_bytes());
                out.extend_from_slice(node.as_bytes());
                put_len_prefixed(&mut out, order_key);
                put_opt_payload(&mut out, payload);
            }
            OpKind::Move {
                node,
                new_parent,
                order_key,
            } => {
                out.extend_from_slice(node.as_bytes());
                out.extend_from_slice(new_parent.as_bytes());
                put_len_prefixed(&mut out, order_key);
            }
            OpKind::Delete { node } | OpKind::Tombstone { node } => {
                out.extend_from_slice(node.as_bytes());
            }
            OpKind::Payload { node, payload } => {
                out.extend_from_slice(node.as_bytes());
                put_opt_payload(&mut out, payload);
            }
        }
        out
    }

    /// Stable CBOR encoding used on the wire and in the pending sidecar.
    pub fn encode(&self) -> Result<Vec<u8>, AuthError> {
        let mut entries = vec![
            (cbor::text("replica"), cbor::bytes(self.meta.id.replica.as_bytes().to_vec())),
            (cbor::text("counter"), cbor::u64_value(self.meta.id.counter)),
            (cbor::text("lamport"), cbor::u64_value(self.meta.lamport)),
            (cbor::text("type"), cbor::text(self.kind.type_name())),
        ];
        match &self.kind {
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            } => {
                entries.push((cbor::text("parent"), cbor::bytes(parent.as_bytes().to_vec())));
                entries.push((cbor::text("node"), cbor::bytes(node.as_bytes().to_vec())));
                entries.push((cbor::text("order_key"), cbor::bytes(order_key.clone())));
                if let Some(p) = payload {
                    entries.push((cbor::text("payload"), cbor::bytes(p.clone())));
                }
            }
            OpKind::Move {
                node,
                new_parent,
                order_key,
            } => {
                entries.push((cbor::text("node"), cbor::bytes(node.as_bytes().to_vec())));
                entries.push((cbor::text("new_parent"), cbor::bytes(new_parent.as_bytes().to_vec())));
                entries.push((cbor::text("order_key"), cbor::bytes(order_key.clone())));
            }
            OpKind::Delete { node } | OpKind::Tombstone { node } => {
                entries.push((cbor::text("node"), cbor::bytes(node.as_bytes().to_vec())));
            }
            OpKind::Payload { node, payload } => {
                entries.push((cbor::text("node"), cbor::bytes(node.as_bytes().to_vec())));
                if let Some(p) = payload {
                    entries.push((cbor::text("payload"), cbor::bytes(p.clone())));
                }
            }
        }
        cbor::to_canonical_bytes(&Value::Map(entries))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AuthError> {
        let value = cbor::from_slice(bytes)?;
        let entries = cbor::as_map(&value).ok_or_else(|| AuthError::Malformed("op is not a map".into()))?;

        let replica = cbor::field(entries, "replica")
            .and_then(cbor::as_bytes)
            .ok_or_else(|| AuthError::Malformed("op missing replica".into()))?;
        let replica = ReplicaId::from_slice(replica)?;
        let counter = cbor::field(entries, "counter")
            .and_then(cbor::as_u64)
            .ok_or_else(|| AuthError::Malformed("op missing counter".into()))?;
        let lamport = cbor::field(entries, "lamport")
            .and_then(cbor::as_u64)
            .ok_or_else(|| AuthError::Malformed("op missing lamport".into()))?;
        let ty = cbor::field(entries, "type")
            .and_then(cbor::as_text)
            .ok_or_else(|| AuthError::Malformed("op missing type".into()))?;

        let node_field = |name: &str| -> Result<NodeId, AuthError> {
            let b = cbor::field(entries, name)
                .and_then(cbor::as_bytes)
                .ok_or_else(|| AuthError::Malformed(format!("op missing {name}")))?;
            NodeId::from_slice(b)
        };
        let order_key = || -> Result<Vec<u8>, AuthError> {
            cbor::field(entries, "order_key")
                .and_then(cbor::as_bytes)
                .map(|b| b.to_vec())
                .ok_or_else(|| AuthError::Malformed("op missing order_key".into()))
        };
        let payload = cbor::field(entries, "payload").and_then(cbor::as_bytes).map(|b| b.to_vec());

        let kind = match ty {
            "insert" => OpKind::Insert {
                parent: node_field("parent")?,
                node: node_field("node")?,
                order_key: order_key()?,
                payload,
            },
            "move" => OpKind::Move {
                node: node_field("node")?,
                new_parent: node_field("new_parent")?,
                order_key: order_key()?,
            },
            "delete" => OpKind::Delete { node: node_field("node")? },
            "tombstone" => OpKind::Tombstone { node: node_field("node")? },
            "payload" => OpKind::Payload {
                node: node_field("node")?,
                payload,
            },
            other => return Err(AuthError::Malformed(format!("unknown op type {other}"))),
        };

        Ok(Self {
            meta: OpMeta {
                id: OpId { replica, counter },
                lamport,
            },
            kind,
        })
    }
}

/// A slice of a document's op space, negotiated per sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Every op of the document.
    All,
    /// Ops anchored under a specific parent node.
    Children { parent: NodeId },
}

/// Signature and proof reference attached to an op on the wire and in the
/// op-auth sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpAuth {
    /// Ed25519 signature over the canonical op-sig input.
    pub sig: [u8; 64],
    /// Token id of the capability the signer chose as proof.
    pub proof_ref: Option<crate::ids::TokenId>,
}
