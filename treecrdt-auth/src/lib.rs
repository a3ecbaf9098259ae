//! Capability-based authorization core for the treecrdt document platform.
//!
//! Decides, per document, who may read which subtree and who may write which
//! operation, and proves those decisions cryptographically: COSE_Sign1
//! capability tokens with delegation chains, signed revocation records,
//! per-op Ed25519 signatures over a canonical input, a tri-state scope
//! evaluator, and the AEAD keystore protecting local keys at rest.
//!
//! The sync layer (`treecrdt-sync`) drives the [`engine::SyncAuth`] hooks;
//! storage arrives through the capability-style traits defined here
//! ([`scope::TreeContext`], [`engine::OpAuthSidecar`],
//! [`keystore::SecretStore`]) and implemented by `treecrdt-store`.

pub mod cbor;
pub mod clock;
pub mod cose;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ids;
pub mod invite;
pub mod keystore;
pub mod op;
pub mod revocation;
pub mod scope;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    CAP_IDENTITY_CHAIN, CAP_REVOCATION, CAP_TOKEN, CapabilityEntry, OpAuthSidecar, OpDisposition,
    SyncAuth, SyncAuthConfig, VerifyOutcome,
};
pub use error::AuthError;
pub use ids::{DocId, KeyId, NodeId, OpRef, ROOT_NODE_ID, ReplicaId, TokenId};
pub use op::{Filter, OpAuth, OpId, OpKind, OpMeta, Operation};
pub use revocation::{
    RevocationMode, RevocationQuery, RevocationRecord, RevocationStage, RevocationTable,
    issue_revocation_record, parse_and_verify_revocation,
};
pub use scope::{ParentLink, ScopeDecision, TreeContext, caps_allows_node_access, caps_allows_op};
pub use token::{
    Action, Capability, CapabilityGrant, ResourceScope, VerifyCtx, describe_capability_token,
    issue_capability_token, issue_delegated_capability_token, parse_and_verify,
};
