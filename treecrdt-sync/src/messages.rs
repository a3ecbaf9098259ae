//! Wire messages for sync sessions.
//!
//! Every message is framed as `{v: 0, doc_id, payload}` where the payload is
//! a tagged CBOR map (`type` plus the variant's fields). A message whose
//! `doc_id` does not match the receiving peer's document is dropped.
//!
//! Filters are strict tagged unions: exactly one case, unknown extra fields
//! are errors.

use ciborium::value::Value;

use treecrdt_auth::cbor;
use treecrdt_auth::engine::CapabilityEntry;
use treecrdt_auth::ids::{NodeId, OpRef, TokenId};
use treecrdt_auth::op::{Filter, OpAuth};

use crate::error::SyncError;

pub const PROTOCOL_VERSION: u8 = 0;

/// Error codes shared by `Error` messages and filter rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unspecified,
    Unauthorized,
    FilterNotSupported,
    TooManyFilters,
}

impl ErrorCode {
    pub fn as_u64(&self) -> u64 {
        match self {
            ErrorCode::Unspecified => 0,
            ErrorCode::Unauthorized => 1,
            ErrorCode::FilterNotSupported => 2,
            ErrorCode::TooManyFilters => 3,
        }
    }

    pub fn from_u64(code: u64) -> Self {
        match code {
            1 => ErrorCode::Unauthorized,
            2 => ErrorCode::FilterNotSupported,
            3 => ErrorCode::TooManyFilters,
            _ => ErrorCode::Unspecified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unspecified => "ERROR_CODE_UNSPECIFIED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::FilterNotSupported => "FILTER_NOT_SUPPORTED",
            ErrorCode::TooManyFilters => "TOO_MANY_FILTERS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub id: String,
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub capabilities: Vec<CapabilityEntry>,
    pub filters: Vec<FilterSpec>,
    pub max_lamport: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFilter {
    pub id: String,
    pub reason: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAck {
    pub capabilities: Vec<CapabilityEntry>,
    pub accepted_filters: Vec<String>,
    pub rejected_filters: Vec<RejectedFilter>,
    pub max_lamport: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RibltCodewords {
    pub filter_id: String,
    pub round: u32,
    pub start_index: u64,
    pub codewords: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RibltOutcome {
    Decoded {
        /// Ops the codeword sender does not have.
        sender_missing: Vec<OpRef>,
        /// Ops the receiver (status sender) does not have.
        receiver_missing: Vec<OpRef>,
        codewords_received: u64,
    },
    Failed {
        reason: String,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RibltStatus {
    pub filter_id: String,
    pub round: u32,
    pub outcome: RibltOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsBatch {
    pub filter_id: String,
    /// Stable op encodings.
    pub ops: Vec<Vec<u8>>,
    /// When present, must have the same length as `ops`.
    pub auth: Option<Vec<OpAuth>>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub subscription_id: String,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub subscription_id: String,
    pub current_lamport: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
    pub filter_id: Option<String>,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Hello(Hello),
    HelloAck(HelloAck),
    RibltCodewords(RibltCodewords),
    RibltStatus(RibltStatus),
    OpsBatch(OpsBatch),
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    Error(ErrorMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub doc_id: String,
    pub payload: Payload,
}

// ── Encoding ───────────────────────────────────────────────────────────────

fn text_entry(key: &str, value: impl Into<String>) -> (Value, Value) {
    (cbor::text(key), cbor::text(value))
}

fn filter_to_value(filter: &Filter) -> Value {
    match filter {
        Filter::All => Value::Map(vec![text_entry("type", "all")]),
        Filter::Children { parent } => Value::Map(vec![
            text_entry("type", "children"),
            (cbor::text("parent"), cbor::bytes(parent.as_bytes().to_vec())),
        ]),
    }
}

fn filter_from_value(value: &Value) -> Result<Filter, SyncError> {
    let entries = cbor::as_map(value).ok_or_else(|| SyncError::Codec("filter is not a map".into()))?;
    let ty = cbor::field(entries, "type")
        .and_then(cbor::as_text)
        .ok_or_else(|| SyncError::Codec("filter missing type".into()))?;
    match ty {
        "all" => {
            if entries.len() != 1 {
                return Err(SyncError::Codec("filter 'all' has extra fields".into()));
            }
            Ok(Filter::All)
        }
        "children" => {
            if entries.len() != 2 {
                return Err(SyncError::Codec("filter 'children' has extra fields".into()));
            }
            let parent = cbor::field(entries, "parent")
                .and_then(cbor::as_bytes)
                .ok_or_else(|| SyncError::Codec("filter 'children' missing parent".into()))?;
            Ok(Filter::Children {
                parent: NodeId::from_slice(parent)?,
            })
        }
        other => Err(SyncError::Codec(format!("unknown filter type {other}"))),
    }
}

fn capabilities_to_value(entries: &[CapabilityEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|e| {
                Value::Map(vec![
                    text_entry("name", e.name.clone()),
                    text_entry("value", e.value.clone()),
                ])
            })
            .collect(),
    )
}

fn capabilities_from_value(value: &Value) -> Result<Vec<CapabilityEntry>, SyncError> {
    cbor::as_array(value)
        .ok_or_else(|| SyncError::Codec("capabilities is not an array".into()))?
        .iter()
        .map(|item| {
            let entries =
                cbor::as_map(item).ok_or_else(|| SyncError::Codec("capability is not a map".into()))?;
            let name = cbor::field(entries, "name")
                .and_then(cbor::as_text)
                .ok_or_else(|| SyncError::Codec("capability missing name".into()))?;
            let value = cbor::field(entries, "value")
                .and_then(cbor::as_text)
                .ok_or_else(|| SyncError::Codec("capability missing value".into()))?;
            Ok(CapabilityEntry {
                name: name.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

fn refs_to_value(refs: &[OpRef]) -> Value {
    Value::Array(refs.iter().map(|r| cbor::bytes(r.as_bytes().to_vec())).collect())
}

fn refs_from_value(value: &Value) -> Result<Vec<OpRef>, SyncError> {
    cbor::as_array(value)
        .ok_or_else(|| SyncError::Codec("refs is not an array".into()))?
        .iter()
        .map(|r| {
            let bytes = cbor::as_bytes(r).ok_or_else(|| SyncError::Codec("ref is not bytes".into()))?;
            Ok(OpRef::from_slice(bytes)?)
        })
        .collect()
}

fn req_text(entries: &[(Value, Value)], key: &str) -> Result<String, SyncError> {
    cbor::field(entries, key)
        .and_then(cbor::as_text)
        .map(str::to_string)
        .ok_or_else(|| SyncError::Codec(format!("missing field {key}")))
}

fn req_u64(entries: &[(Value, Value)], key: &str) -> Result<u64, SyncError> {
    cbor::field(entries, key)
        .and_then(cbor::as_u64)
        .ok_or_else(|| SyncError::Codec(format!("missing field {key}")))
}

fn opt_text(entries: &[(Value, Value)], key: &str) -> Option<String> {
    cbor::field(entries, key).and_then(cbor::as_text).map(str::to_string)
}

fn payload_to_value(payload: &Payload) -> Value {
    match payload {
        Payload::Hello(hello) => Value::Map(vec![
            text_entry("type", "hello"),
            (cbor::text("capabilities"), capabilities_to_value(&hello.capabilities)),
            (
                cbor::text("filters"),
                Value::Array(
                    hello
                        .filters
                        .iter()
                        .map(|f| {
                            Value::Map(vec![
                                text_entry("id", f.id.clone()),
                                (cbor::text("filter"), filter_to_value(&f.filter)),
                            ])
                        })
                        .collect(),
                ),
            ),
            (cbor::text("max_lamport"), cbor::u64_value(hello.max_lamport)),
        ]),
        Payload::HelloAck(ack) => Value::Map(vec![
            text_entry("type", "hello_ack"),
            (cbor::text("capabilities"), capabilities_to_value(&ack.capabilities)),
            (
                cbor::text("accepted_filters"),
                Value::Array(ack.accepted_filters.iter().map(|id| cbor::text(id.clone())).collect()),
            ),
            (
                cbor::text("rejected_filters"),
                Value::Array(
                    ack.rejected_filters
                        .iter()
                        .map(|r| {
                            let mut entries = vec![
                                text_entry("id", r.id.clone()),
                                text_entry("reason", r.reason.clone()),
                            ];
                            if let Some(message) = &r.message {
                                entries.push(text_entry("message", message.clone()));
                            }
                            Value::Map(entries)
                        })
                        .collect(),
                ),
            ),
            (cbor::text("max_lamport"), cbor::u64_value(ack.max_lamport)),
        ]),
        Payload::RibltCodewords(cw) => Value::Map(vec![
            text_entry("type", "riblt_codewords"),
            text_entry("filter_id", cw.filter_id.clone()),
            (cbor::text("round"), cbor::u64_value(cw.round as u64)),
            (cbor::text("start_index"), cbor::u64_value(cw.start_index)),
            (
                cbor::text("codewords"),
                Value::Array(cw.codewords.iter().map(|c| cbor::bytes(c.clone())).collect()),
            ),
        ]),
        Payload::RibltStatus(status) => {
            let outcome = match &status.outcome {
                RibltOutcome::Decoded {
                    sender_missing,
                    receiver_missing,
                    codewords_received,
                } => Value::Map(vec![
                    text_entry("type", "decoded"),
                    (cbor::text("sender_missing"), refs_to_value(sender_missing)),
                    (cbor::text("receiver_missing"), refs_to_value(receiver_missing)),
                    (cbor::text("codewords_received"), cbor::u64_value(*codewords_received)),
                ]),
                RibltOutcome::Failed { reason, message } => {
                    let mut entries = vec![text_entry("type", "failed"), text_entry("reason", reason.clone())];
                    if let Some(message) = message {
                        entries.push(text_entry("message", message.clone()));
                    }
                    Value::Map(entries)
                }
            };
            Value::Map(vec![
                text_entry("type", "riblt_status"),
                text_entry("filter_id", status.filter_id.clone()),
                (cbor::text("round"), cbor::u64_value(status.round as u64)),
                (cbor::text("payload"), outcome),
            ])
        }
        Payload::OpsBatch(batch) => {
            let mut entries = vec![
                text_entry("type", "ops_batch"),
                text_entry("filter_id", batch.filter_id.clone()),
                (
                    cbor::text("ops"),
                    Value::Array(batch.ops.iter().map(|o| cbor::bytes(o.clone())).collect()),
                ),
                (cbor::text("done"), Value::Bool(batch.done)),
            ];
            if let Some(auth) = &batch.auth {
                entries.push((
                    cbor::text("auth"),
                    Value::Array(
                        auth.iter()
                            .map(|a| {
                                let mut fields =
                                    vec![(cbor::text("sig"), cbor::bytes(a.sig.to_vec()))];
                                if let Some(proof_ref) = &a.proof_ref {
                                    fields.push((
                                        cbor::text("proof_ref"),
                                        cbor::bytes(proof_ref.as_bytes().to_vec()),
                                    ));
                                }
                                Value::Map(fields)
                            })
                            .collect(),
                    ),
                ));
            }
            Value::Map(entries)
        }
        Payload::Subscribe(sub) => {
            let mut entries = vec![
                text_entry("type", "subscribe"),
                text_entry("subscription_id", sub.subscription_id.clone()),
            ];
            if let Some(filter) = &sub.filter {
                entries.push((cbor::text("filter"), filter_to_value(filter)));
            }
            Value::Map(entries)
        }
        Payload::SubscribeAck(ack) => Value::Map(vec![
            text_entry("type", "subscribe_ack"),
            text_entry("subscription_id", ack.subscription_id.clone()),
            (cbor::text("current_lamport"), cbor::u64_value(ack.current_lamport)),
        ]),
        Payload::Unsubscribe(unsub) => Value::Map(vec![
            text_entry("type", "unsubscribe"),
            text_entry("subscription_id", unsub.subscription_id.clone()),
        ]),
        Payload::Error(err) => {
            let mut entries = vec![
                text_entry("type", "error"),
                (cbor::text("code"), cbor::u64_value(err.code.as_u64())),
                text_entry("message", err.message.clone()),
            ];
            if let Some(filter_id) = &err.filter_id {
                entries.push(text_entry("filter_id", filter_id.clone()));
            }
            if let Some(subscription_id) = &err.subscription_id {
                entries.push(text_entry("subscription_id", subscription_id.clone()));
            }
            Value::Map(entries)
        }
    }
}

fn payload_from_value(value: &Value) -> Result<Payload, SyncError> {
    let entries = cbor::as_map(value).ok_or_else(|| SyncError::Codec("payload is not a map".into()))?;
    let ty = req_text(entries, "type")?;
    match ty.as_str() {
        "hello" => {
            let capabilities = capabilities_from_value(
                cbor::field(entries, "capabilities")
                    .ok_or_else(|| SyncError::Codec("hello missing capabilities".into()))?,
            )?;
            let filters = cbor::field(entries, "filters")
                .and_then(cbor::as_array)
                .ok_or_else(|| SyncError::Codec("hello missing filters".into()))?
                .iter()
                .map(|f| {
                    let fe = cbor::as_map(f)
                        .ok_or_else(|| SyncError::Codec("filter spec is not a map".into()))?;
                    Ok(FilterSpec {
                        id: req_text(fe, "id")?,
                        filter: filter_from_value(
                            cbor::field(fe, "filter")
                                .ok_or_else(|| SyncError::Codec("filter spec missing filter".into()))?,
                        )?,
                    })
                })
                .collect::<Result<Vec<_>, SyncError>>()?;
            Ok(Payload::Hello(Hello {
                capabilities,
                filters,
                max_lamport: req_u64(entries, "max_lamport")?,
            }))
        }
        "hello_ack" => {
            let capabilities = capabilities_from_value(
                cbor::field(entries, "capabilities")
                    .ok_or_else(|| SyncError::Codec("hello_ack missing capabilities".into()))?,
            )?;
            let accepted_filters = cbor::field(entries, "accepted_filters")
                .and_then(cbor::as_array)
                .ok_or_else(|| SyncError::Codec("hello_ack missing accepted_filters".into()))?
                .iter()
                .map(|id| {
                    cbor::as_text(id)
                        .map(str::to_string)
                        .ok_or_else(|| SyncError::Codec("filter id is not a string".into()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let rejected_filters = cbor::field(entries, "rejected_filters")
                .and_then(cbor::as_array)
                .ok_or_else(|| SyncError::Codec("hello_ack missing rejected_filters".into()))?
                .iter()
                .map(|r| {
                    let re = cbor::as_map(r)
                        .ok_or_else(|| SyncError::Codec("rejected filter is not a map".into()))?;
                    Ok(RejectedFilter {
                        id: req_text(re, "id")?,
                        reason: req_text(re, "reason")?,
                        message: opt_text(re, "message"),
                    })
                })
                .collect::<Result<Vec<_>, SyncError>>()?;
            Ok(Payload::HelloAck(HelloAck {
                capabilities,
                accepted_filters,
                rejected_filters,
                max_lamport: req_u64(entries, "max_lamport")?,
            }))
        }
        "riblt_codewords" => {
            let codewords = cbor::field(entries, "codewords")
                .and_then(cbor::as_array)
                .ok_or_else(|| SyncError::Codec("riblt_codewords missing codewords".into()))?
                .iter()
                .map(|c| {
                    cbor::as_bytes(c)
                        .map(|b| b.to_vec())
                        .ok_or_else(|| SyncError::Codec("codeword is not bytes".into()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Payload::RibltCodewords(RibltCodewords {
                filter_id: req_text(entries, "filter_id")?,
                round: req_u64(entries, "round")? as u32,
                start_index: req_u64(entries, "start_index")?,
                codewords,
            }))
        }
        "riblt_status" => {
            let outcome_value = cbor::field(entries, "payload")
                .ok_or_else(|| SyncError::Codec("riblt_status missing payload".into()))?;
            let oe = cbor::as_map(outcome_value)
                .ok_or_else(|| SyncError::Codec("riblt_status payload is not a map".into()))?;
            let outcome = match req_text(oe, "type")?.as_str() {
                "decoded" => RibltOutcome::Decoded {
                    sender_missing: refs_from_value(
                        cbor::field(oe, "sender_missing")
                            .ok_or_else(|| SyncError::Codec("decoded missing sender_missing".into()))?,
                    )?,
                    receiver_missing: refs_from_value(
                        cbor::field(oe, "receiver_missing")
                            .ok_or_else(|| SyncError::Codec("decoded missing receiver_missing".into()))?,
                    )?,
                    codewords_received: req_u64(oe, "codewords_received")?,
                },
                "failed" => RibltOutcome::Failed {
                    reason: req_text(oe, "reason")?,
                    message: opt_text(oe, "message"),
                },
                other => return Err(SyncError::Codec(format!("unknown riblt outcome {other}"))),
            };
            Ok(Payload::RibltStatus(RibltStatus {
                filter_id: req_text(entries, "filter_id")?,
                round: req_u64(entries, "round")? as u32,
                outcome,
            }))
        }
        "ops_batch" => {
            let ops = cbor::field(entries, "ops")
                .and_then(cbor::as_array)
                .ok_or_else(|| SyncError::Codec("ops_batch missing ops".into()))?
                .iter()
                .map(|o| {
                    cbor::as_bytes(o)
                        .map(|b| b.to_vec())
                        .ok_or_else(|| SyncError::Codec("op is not bytes".into()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let auth = match cbor::field(entries, "auth") {
                Some(value) => Some(
                    cbor::as_array(value)
                        .ok_or_else(|| SyncError::Codec("auth is not an array".into()))?
                        .iter()
                        .map(|a| {
                            let ae = cbor::as_map(a)
                                .ok_or_else(|| SyncError::Codec("op auth is not a map".into()))?;
                            let sig = cbor::field(ae, "sig")
                                .and_then(cbor::as_bytes)
                                .ok_or_else(|| SyncError::Codec("op auth missing sig".into()))?;
                            let sig: [u8; 64] = sig
                                .try_into()
                                .map_err(|_| SyncError::Codec("sig must be 64 bytes".into()))?;
                            let proof_ref = match cbor::field(ae, "proof_ref") {
                                Some(p) => Some(TokenId::from_slice(
                                    cbor::as_bytes(p)
                                        .ok_or_else(|| SyncError::Codec("proof_ref is not bytes".into()))?,
                                )?),
                                None => None,
                            };
                            Ok(OpAuth { sig, proof_ref })
                        })
                        .collect::<Result<Vec<_>, SyncError>>()?,
                ),
                None => None,
            };
            let done = cbor::field(entries, "done")
                .and_then(|v| v.as_bool())
                .ok_or_else(|| SyncError::Codec("ops_batch missing done".into()))?;
            if let Some(auth) = &auth {
                if auth.len() != ops.len() {
                    return Err(SyncError::Codec(format!(
                        "auth length {} does not match ops length {}",
                        auth.len(),
                        ops.len()
                    )));
                }
            }
            Ok(Payload::OpsBatch(OpsBatch {
                filter_id: req_text(entries, "filter_id")?,
                ops,
                auth,
                done,
            }))
        }
        "subscribe" => Ok(Payload::Subscribe(Subscribe {
            subscription_id: req_text(entries, "subscription_id")?,
            filter: cbor::field(entries, "filter").map(filter_from_value).transpose()?,
        })),
        "subscribe_ack" => Ok(Payload::SubscribeAck(SubscribeAck {
            subscription_id: req_text(entries, "subscription_id")?,
            current_lamport: req_u64(entries, "current_lamport")?,
        })),
        "unsubscribe" => Ok(Payload::Unsubscribe(Unsubscribe {
            subscription_id: req_text(entries, "subscription_id")?,
        })),
        "error" => Ok(Payload::Error(ErrorMessage {
            code: ErrorCode::from_u64(req_u64(entries, "code")?),
            message: req_text(entries, "message")?,
            filter_id: opt_text(entries, "filter_id"),
            subscription_id: opt_text(entries, "subscription_id"),
        })),
        other => Err(SyncError::Codec(format!("unknown payload type {other}"))),
    }
}

impl SyncMessage {
    pub fn new(doc_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            doc_id: doc_id.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let value = Value::Map(vec![
            (cbor::text("v"), cbor::u64_value(PROTOCOL_VERSION as u64)),
            (cbor::text("doc_id"), cbor::text(self.doc_id.clone())),
            (cbor::text("payload"), payload_to_value(&self.payload)),
        ]);
        Ok(cbor::to_canonical_bytes(&value)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let value = cbor::from_slice(bytes)?;
        let entries = cbor::as_map(&value).ok_or_else(|| SyncError::Codec("message is not a map".into()))?;
        let v = req_u64(entries, "v")?;
        if v != PROTOCOL_VERSION as u64 {
            return Err(SyncError::Codec(format!("unsupported protocol version {v}")));
        }
        let doc_id = req_text(entries, "doc_id")?;
        let payload = payload_from_value(
            cbor::field(entries, "payload").ok_or_else(|| SyncError::Codec("message missing payload".into()))?,
        )?;
        Ok(Self { doc_id, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treecrdt_auth::ids::ROOT_NODE_ID;

    fn round_trip(payload: Payload) {
        let msg = SyncMessage::new("doc-wire", payload);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn hello_round_trip() {
        round_trip(Payload::Hello(Hello {
            capabilities: vec![CapabilityEntry {
                name: "auth.capability".into(),
                value: "abc".into(),
            }],
            filters: vec![
                FilterSpec {
                    id: "f_01".into(),
                    filter: Filter::All,
                },
                FilterSpec {
                    id: "f_02".into(),
                    filter: Filter::Children {
                        parent: NodeId::from_bytes([4u8; 16]),
                    },
                },
            ],
            max_lamport: 17,
        }));
    }

    #[test]
    fn hello_ack_round_trip() {
        round_trip(Payload::HelloAck(HelloAck {
            capabilities: vec![],
            accepted_filters: vec!["f_01".into()],
            rejected_filters: vec![RejectedFilter {
                id: "f_02".into(),
                reason: "UNAUTHORIZED".into(),
                message: Some("capability does not allow filter".into()),
            }],
            max_lamport: 3,
        }));
    }

    #[test]
    fn riblt_round_trips() {
        round_trip(Payload::RibltCodewords(RibltCodewords {
            filter_id: "f_01".into(),
            round: 0,
            start_index: 512,
            codewords: vec![vec![0u8; 32], vec![1u8; 32]],
        }));
        round_trip(Payload::RibltStatus(RibltStatus {
            filter_id: "f_01".into(),
            round: 0,
            outcome: RibltOutcome::Decoded {
                sender_missing: vec![OpRef::from_bytes([1u8; 16])],
                receiver_missing: vec![],
                codewords_received: 640,
            },
        }));
        round_trip(Payload::RibltStatus(RibltStatus {
            filter_id: "f_01".into(),
            round: 0,
            outcome: RibltOutcome::Failed {
                reason: "OUT_OF_ORDER".into(),
                message: None,
            },
        }));
    }

    #[test]
    fn ops_batch_round_trip_and_length_check() {
        round_trip(Payload::OpsBatch(OpsBatch {
            filter_id: "f_01".into(),
            ops: vec![vec![1, 2, 3]],
            auth: Some(vec![OpAuth {
                sig: [7u8; 64],
                proof_ref: Some(TokenId::from_envelope(b"t")),
            }]),
            done: true,
        }));

        // mismatched auth length is a codec error
        let bad = SyncMessage::new(
            "doc-wire",
            Payload::OpsBatch(OpsBatch {
                filter_id: "f_01".into(),
                ops: vec![vec![1], vec![2]],
                auth: Some(vec![OpAuth {
                    sig: [0u8; 64],
                    proof_ref: None,
                }]),
                done: false,
            }),
        );
        assert!(SyncMessage::decode(&bad.encode().unwrap()).is_err());
    }

    #[test]
    fn subscription_and_error_round_trips() {
        round_trip(Payload::Subscribe(Subscribe {
            subscription_id: "s_01".into(),
            filter: Some(Filter::All),
        }));
        round_trip(Payload::Subscribe(Subscribe {
            subscription_id: "s_02".into(),
            filter: None,
        }));
        round_trip(Payload::SubscribeAck(SubscribeAck {
            subscription_id: "s_01".into(),
            current_lamport: 9,
        }));
        round_trip(Payload::Unsubscribe(Unsubscribe {
            subscription_id: "s_01".into(),
        }));
        round_trip(Payload::Error(ErrorMessage {
            code: ErrorCode::TooManyFilters,
            message: "too many filters".into(),
            filter_id: Some("f_09".into()),
            subscription_id: None,
        }));
    }

    #[test]
    fn strict_filter_unions() {
        // extra field on 'all'
        let value = Value::Map(vec![
            (cbor::text("type"), cbor::text("all")),
            (cbor::text("parent"), cbor::bytes(ROOT_NODE_ID.as_bytes().to_vec())),
        ]);
        assert!(filter_from_value(&value).is_err());

        let value = Value::Map(vec![(cbor::text("type"), cbor::text("children"))]);
        assert!(filter_from_value(&value).is_err());
    }

    #[test]
    fn doc_id_is_framed() {
        let msg = SyncMessage::new(
            "doc-a",
            Payload::Unsubscribe(Unsubscribe {
                subscription_id: "s".into(),
            }),
        );
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.doc_id, "doc-a");
    }
}
