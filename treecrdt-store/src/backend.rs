//! The storage interface the sync layer drives.
//!
//! `Backend` is a capability-style trait: the sync peer and auth engine only
//! ever see this surface (plus the `TreeContext` / `OpAuthSidecar` /
//! `SecretStore` traits it extends), never a concrete database. The SQLite
//! implementation lives in [`crate::sqlite`].

use async_trait::async_trait;

use treecrdt_auth::engine::OpAuthSidecar;
use treecrdt_auth::ids::{DocId, OpRef};
use treecrdt_auth::op::{Filter, OpAuth, Operation};
use treecrdt_auth::scope::TreeContext;

/// A parked op waiting for more tree context, as persisted in the pending
/// sidecar.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub op: Operation,
    pub auth: OpAuth,
    /// Why the op is parked; currently always `missing_context`.
    pub reason: String,
    pub message: Option<String>,
    pub created_at_ms: i64,
}

impl PendingOp {
    pub fn missing_context(op: Operation, auth: OpAuth, message: Option<String>, created_at_ms: i64) -> Self {
        Self {
            op,
            auth,
            reason: "missing_context".to_string(),
            message,
            created_at_ms,
        }
    }
}

#[async_trait]
pub trait Backend: TreeContext + OpAuthSidecar + Send + Sync {
    /// Highest lamport applied for the document (0 when empty).
    async fn max_lamport(&self, doc_id: &DocId) -> anyhow::Result<u64>;

    /// Refs of all applied ops matching `filter`, in a stable order.
    async fn list_op_refs(&self, doc_id: &DocId, filter: &Filter) -> anyhow::Result<Vec<OpRef>>;

    /// Fetch op bodies by ref. Unknown refs are skipped.
    async fn get_ops(&self, doc_id: &DocId, refs: &[OpRef]) -> anyhow::Result<Vec<Operation>>;

    /// Apply ops to the document (op log + tree index). Idempotent.
    async fn apply_ops(&self, doc_id: &DocId, ops: &[Operation]) -> anyhow::Result<()>;

    /// Park ops in the pending sidecar. Idempotent per op ref; the ref is
    /// derived from the decoded op, never taken from the wire.
    async fn store_pending_ops(&self, doc_id: &DocId, rows: &[PendingOp]) -> anyhow::Result<()>;

    /// Pending rows in insertion order.
    async fn list_pending_ops(&self, doc_id: &DocId) -> anyhow::Result<Vec<PendingOp>>;

    async fn list_pending_op_refs(&self, doc_id: &DocId) -> anyhow::Result<Vec<OpRef>>;

    async fn delete_pending_ops(&self, doc_id: &DocId, refs: &[OpRef]) -> anyhow::Result<()>;
}
