//! Signed revocation records and deterministic conflict resolution.
//!
//! An issuer revokes a capability token either entirely (`hard`) or from a
//! write position onward (`write_cutover`). Peers keep at most one record per
//! token id: the highest `rev_seq` wins, ties broken by lexicographic compare
//! of the envelope bytes so every peer converges on the same winner
//! regardless of delivery order.
//!
//! The parser is strict: unknown map keys are rejected. In particular
//! `effective_from_lamport` (seen in experimental producers) does not parse.

use std::collections::HashMap;

use ciborium::value::Value;
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::cbor;
use crate::cose::CoseSign1;
use crate::error::AuthError;
use crate::ids::{DocId, ReplicaId, TokenId};
use crate::op::Operation;

const RECORD_TYPE: &str = "treecrdt/revocation/v1";
const RECORD_VERSION: u64 = 1;

const KNOWN_KEYS: &[&str] = &[
    "v",
    "t",
    "doc_id",
    "token_id",
    "mode",
    "rev_seq",
    "iat",
    "effective_from_counter",
    "effective_from_replica",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationMode {
    /// Revokes every op signed under the token.
    Hard,
    /// Revokes ops at or beyond a `(replica?, counter)` cutover.
    WriteCutover,
}

impl RevocationMode {
    fn as_str(&self) -> &'static str {
        match self {
            RevocationMode::Hard => "hard",
            RevocationMode::WriteCutover => "write_cutover",
        }
    }

    fn parse(s: &str) -> Result<Self, AuthError> {
        match s {
            "hard" => Ok(RevocationMode::Hard),
            "write_cutover" => Ok(RevocationMode::WriteCutover),
            other => Err(AuthError::Malformed(format!("unknown revocation mode {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RevocationRecord {
    pub doc_id: DocId,
    pub token_id: TokenId,
    pub mode: RevocationMode,
    pub rev_seq: u32,
    pub iat: Option<u64>,
    pub effective_from_counter: Option<u64>,
    pub effective_from_replica: Option<ReplicaId>,
    /// The COSE envelope this record was parsed from; advertised to peers and
    /// used for deterministic tie-breaking.
    pub envelope: Vec<u8>,
}

impl RevocationRecord {
    /// Does this record revoke the given op?
    pub fn revokes_op(&self, op: &Operation) -> bool {
        match self.mode {
            RevocationMode::Hard => true,
            RevocationMode::WriteCutover => {
                let Some(counter) = self.effective_from_counter else {
                    // unreachable for parsed records; fail open to hard
                    return true;
                };
                match self.effective_from_replica {
                    Some(replica) => op.replica() == replica && op.counter() >= counter,
                    None => op.counter() >= counter,
                }
            }
        }
    }

    /// Conflict resolution: does `self` win over `other`?
    fn wins_over(&self, other: &RevocationRecord) -> bool {
        match self.rev_seq.cmp(&other.rev_seq) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.envelope > other.envelope,
        }
    }
}

/// Where a revocation query is being made from.
#[derive(Debug, Clone, Copy)]
pub enum RevocationStage<'a> {
    /// Token parse time: only the token id is known. Cutover records answer
    /// false here because the op is unknown.
    Parse,
    /// Per-op verification with full op context.
    Runtime { op: &'a Operation },
}

/// Pluggable revocation lookup, queried at token parse and per-op check.
pub trait RevocationQuery: Send + Sync {
    fn is_revoked(&self, token_id: &TokenId, stage: RevocationStage<'_>) -> bool;
}

/// Create a signed revocation record.
pub fn issue_revocation_record(
    issuer: &SigningKey,
    doc_id: &DocId,
    token_id: &TokenId,
    mode: RevocationMode,
    rev_seq: u32,
    iat: Option<u64>,
    effective_from_counter: Option<u64>,
    effective_from_replica: Option<ReplicaId>,
) -> Result<Vec<u8>, AuthError> {
    if mode == RevocationMode::WriteCutover && effective_from_counter.is_none() {
        return Err(AuthError::Malformed(
            "write_cutover requires effective_from_counter".into(),
        ));
    }
    if effective_from_replica.is_some() && effective_from_counter.is_none() {
        return Err(AuthError::Malformed(
            "effective_from_replica requires effective_from_counter".into(),
        ));
    }
    let mut entries = vec![
        (cbor::text("v"), cbor::u64_value(RECORD_VERSION)),
        (cbor::text("t"), cbor::text(RECORD_TYPE)),
        (cbor::text("doc_id"), cbor::text(doc_id.as_str())),
        (cbor::text("token_id"), cbor::bytes(token_id.as_bytes().to_vec())),
        (cbor::text("mode"), cbor::text(mode.as_str())),
        (cbor::text("rev_seq"), cbor::u64_value(rev_seq as u64)),
    ];
    if let Some(iat) = iat {
        entries.push((cbor::text("iat"), cbor::u64_value(iat)));
    }
    if let Some(counter) = effective_from_counter {
        entries.push((cbor::text("effective_from_counter"), cbor::u64_value(counter)));
    }
    if let Some(replica) = effective_from_replica {
        entries.push((
            cbor::text("effective_from_replica"),
            cbor::bytes(replica.as_bytes().to_vec()),
        ));
    }
    let payload = cbor::to_canonical_bytes(&Value::Map(entries))?;
    CoseSign1::sign(issuer, payload, Vec::new())?.to_bytes()
}

/// Parse a revocation record and verify it against the issuer set.
pub fn parse_and_verify_revocation(
    bytes: &[u8],
    issuers: &[VerifyingKey],
    doc_id: &DocId,
) -> Result<RevocationRecord, AuthError> {
    let envelope = CoseSign1::from_bytes(bytes)?;
    if !issuers.iter().any(|k| envelope.verify(k).is_ok()) {
        return Err(AuthError::UnknownIssuer);
    }

    let payload = cbor::from_slice(&envelope.payload)?;
    let entries = cbor::as_map(&payload)
        .ok_or_else(|| AuthError::Malformed("revocation record is not a map".into()))?;

    for (key, _) in entries {
        let name = cbor::as_text(key)
            .ok_or_else(|| AuthError::Malformed("revocation key is not a string".into()))?;
        if !KNOWN_KEYS.contains(&name) {
            return Err(AuthError::Malformed(format!("unknown revocation key {name}")));
        }
    }

    let version = cbor::field(entries, "v")
        .and_then(cbor::as_u64)
        .ok_or_else(|| AuthError::Malformed("revocation missing v".into()))?;
    if version != RECORD_VERSION {
        return Err(AuthError::Malformed(format!("unsupported revocation version {version}")));
    }
    let record_type = cbor::field(entries, "t")
        .and_then(cbor::as_text)
        .ok_or_else(|| AuthError::Malformed("revocation missing t".into()))?;
    if record_type != RECORD_TYPE {
        return Err(AuthError::Malformed(format!("unexpected revocation type {record_type}")));
    }
    let record_doc = cbor::field(entries, "doc_id")
        .and_then(cbor::as_text)
        .ok_or_else(|| AuthError::Malformed("revocation missing doc_id".into()))?;
    if record_doc != doc_id.as_str() {
        return Err(AuthError::AudienceMismatch {
            expected: doc_id.to_string(),
            actual: record_doc.to_string(),
        });
    }
    let token_id = cbor::field(entries, "token_id")
        .and_then(cbor::as_bytes)
        .ok_or_else(|| AuthError::Malformed("revocation missing token_id".into()))?;
    let token_id = TokenId::from_slice(token_id)?;
    let mode = cbor::field(entries, "mode")
        .and_then(cbor::as_text)
        .ok_or_else(|| AuthError::Malformed("revocation missing mode".into()))?;
    let mode = RevocationMode::parse(mode)?;
    let rev_seq = cbor::field(entries, "rev_seq")
        .and_then(cbor::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| AuthError::Malformed("revocation missing rev_seq".into()))?;
    let iat = cbor::field(entries, "iat").and_then(cbor::as_u64);
    let effective_from_counter = cbor::field(entries, "effective_from_counter").and_then(cbor::as_u64);
    let effective_from_replica = match cbor::field(entries, "effective_from_replica") {
        Some(v) => Some(ReplicaId::from_slice(
            cbor::as_bytes(v)
                .ok_or_else(|| AuthError::Malformed("effective_from_replica is not bytes".into()))?,
        )?),
        None => None,
    };

    if mode == RevocationMode::WriteCutover && effective_from_counter.is_none() {
        return Err(AuthError::Malformed(
            "write_cutover requires effective_from_counter".into(),
        ));
    }
    if effective_from_replica.is_some() && effective_from_counter.is_none() {
        return Err(AuthError::Malformed(
            "effective_from_replica requires effective_from_counter".into(),
        ));
    }

    Ok(RevocationRecord {
        doc_id: doc_id.clone(),
        token_id,
        mode,
        rev_seq,
        iat,
        effective_from_counter,
        effective_from_replica,
        envelope: bytes.to_vec(),
    })
}

/// One winning record per token id.
#[derive(Debug, Default)]
pub struct RevocationTable {
    records: HashMap<TokenId, RevocationRecord>,
}

impl RevocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, keeping the deterministic winner. Returns true when
    /// the table changed.
    pub fn insert(&mut self, record: RevocationRecord) -> bool {
        match self.records.get(&record.token_id) {
            Some(existing) if !record.wins_over(existing) => false,
            _ => {
                tracing::debug!(
                    token_id = %record.token_id.to_hex(),
                    rev_seq = record.rev_seq,
                    mode = ?record.mode,
                    "revocation record recorded"
                );
                self.records.insert(record.token_id, record);
                true
            }
        }
    }

    pub fn get(&self, token_id: &TokenId) -> Option<&RevocationRecord> {
        self.records.get(token_id)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RevocationRecord> {
        self.records.values()
    }
}

impl RevocationQuery for RevocationTable {
    fn is_revoked(&self, token_id: &TokenId, stage: RevocationStage<'_>) -> bool {
        let Some(record) = self.records.get(token_id) else {
            return false;
        };
        match stage {
            RevocationStage::Parse => record.mode == RevocationMode::Hard,
            RevocationStage::Runtime { op } => record.revokes_op(op),
        }
    }
}
