//! SQLite reference backend.
//!
//! One database holds the op log, the tree index used for scope walks, both
//! sidecars (pending ops, op auth), and the sealed-secret rows for the
//! keystore. WAL mode for concurrent reads; multi-row writes run in a
//! transaction.
//!
//! `children(parent)` filters are answered from a denormalized `scope_node`
//! column: the op's anchor parent (`insert.parent`, `move.new_parent`, or the
//! target's parent in the tree index at apply time).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use treecrdt_auth::engine::OpAuthSidecar;
use treecrdt_auth::ids::{DocId, NodeId, OpRef, TokenId};
use treecrdt_auth::keystore::SecretStore;
use treecrdt_auth::op::{Filter, OpAuth, OpKind, Operation};
use treecrdt_auth::scope::{ParentLink, TreeContext};

use crate::backend::{Backend, PendingOp};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("row decode error: {0}")]
    Decode(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn sig_from_row(sig: Vec<u8>) -> Result<[u8; 64], StoreError> {
    sig.try_into()
        .map_err(|_| StoreError::Decode("sig must be 64 bytes".into()))
}

fn proof_ref_from_row(proof_ref: Option<Vec<u8>>) -> Result<Option<TokenId>, StoreError> {
    proof_ref
        .map(|p| TokenId::from_slice(&p).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, StoreError> {
        let conn = Connection::open(path)?;
        let backend = Self { conn: Mutex::new(conn) };
        backend.init()?;
        Ok(Arc::new(backend))
    }

    /// In-memory database (for testing and ephemeral replicas).
    pub fn open_memory() -> Result<Arc<Self>, StoreError> {
        let conn = Connection::open_in_memory()?;
        let backend = Self { conn: Mutex::new(conn) };
        backend.init()?;
        Ok(Arc::new(backend))
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ops (
                doc_id        TEXT NOT NULL,
                op_ref        BLOB NOT NULL,
                replica       BLOB NOT NULL,
                counter       INTEGER NOT NULL,
                lamport       INTEGER NOT NULL,
                scope_node    BLOB,
                op_bytes      BLOB NOT NULL,
                applied_at_ms INTEGER NOT NULL,
                PRIMARY KEY (doc_id, op_ref)
            );

            CREATE INDEX IF NOT EXISTS idx_ops_doc_lamport ON ops(doc_id, lamport);
            CREATE INDEX IF NOT EXISTS idx_ops_doc_scope ON ops(doc_id, scope_node);

            CREATE TABLE IF NOT EXISTS nodes (
                doc_id     TEXT NOT NULL,
                node       BLOB NOT NULL,
                parent     BLOB,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (doc_id, node)
            );

            CREATE TABLE IF NOT EXISTS pending_ops (
                doc_id        TEXT NOT NULL,
                op_ref        BLOB NOT NULL,
                op_bytes      BLOB NOT NULL,
                sig           BLOB NOT NULL,
                proof_ref     BLOB,
                reason        TEXT NOT NULL,
                message       TEXT,
                created_at_ms INTEGER NOT NULL,
                PRIMARY KEY (doc_id, op_ref)
            );

            CREATE TABLE IF NOT EXISTS op_auth (
                doc_id        TEXT NOT NULL,
                op_ref        BLOB NOT NULL,
                sig           BLOB NOT NULL,
                proof_ref     BLOB,
                created_at_ms INTEGER NOT NULL,
                PRIMARY KEY (doc_id, op_ref)
            );

            CREATE TABLE IF NOT EXISTS secrets (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// The anchor parent an op files under for `children()` filters.
    fn scope_node(conn: &Connection, doc_id: &DocId, op: &Operation) -> Result<Option<Vec<u8>>, StoreError> {
        match &op.kind {
            OpKind::Insert { parent, .. } => Ok(Some(parent.as_bytes().to_vec())),
            OpKind::Move { new_parent, .. } => Ok(Some(new_parent.as_bytes().to_vec())),
            OpKind::Delete { node } | OpKind::Tombstone { node } | OpKind::Payload { node, .. } => {
                let parent: Option<Option<Vec<u8>>> = conn
                    .query_row(
                        "SELECT parent FROM nodes WHERE doc_id = ?1 AND node = ?2",
                        params![doc_id.as_str(), node.as_bytes().as_slice()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(parent.flatten())
            }
        }
    }

    fn apply_one(conn: &Connection, doc_id: &DocId, op: &Operation) -> Result<(), StoreError> {
        let op_ref = op.op_ref(doc_id);
        let scope_node = Self::scope_node(conn, doc_id, op)?;
        let op_bytes = op.encode().map_err(|e| StoreError::Decode(e.to_string()))?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO ops (doc_id, op_ref, replica, counter, lamport, scope_node, op_bytes, applied_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                doc_id.as_str(),
                op_ref.as_bytes().as_slice(),
                op.replica().as_bytes().as_slice(),
                op.counter() as i64,
                op.lamport() as i64,
                scope_node.as_deref(),
                op_bytes,
                now_ms(),
            ],
        )?;
        if inserted == 0 {
            // already applied
            return Ok(());
        }

        match &op.kind {
            OpKind::Insert { parent, node, .. } => {
                conn.execute(
                    "INSERT INTO nodes (doc_id, node, parent) VALUES (?1, ?2, ?3)
                     ON CONFLICT(doc_id, node) DO NOTHING",
                    params![
                        doc_id.as_str(),
                        node.as_bytes().as_slice(),
                        parent.as_bytes().as_slice()
                    ],
                )?;
            }
            OpKind::Move { node, new_parent, .. } => {
                conn.execute(
                    "INSERT INTO nodes (doc_id, node, parent) VALUES (?1, ?2, ?3)
                     ON CONFLICT(doc_id, node) DO UPDATE SET parent = excluded.parent",
                    params![
                        doc_id.as_str(),
                        node.as_bytes().as_slice(),
                        new_parent.as_bytes().as_slice()
                    ],
                )?;
            }
            OpKind::Delete { node } | OpKind::Tombstone { node } => {
                conn.execute(
                    "INSERT INTO nodes (doc_id, node, parent, tombstoned) VALUES (?1, ?2, NULL, 1)
                     ON CONFLICT(doc_id, node) DO UPDATE SET tombstoned = 1",
                    params![doc_id.as_str(), node.as_bytes().as_slice()],
                )?;
            }
            OpKind::Payload { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl TreeContext for SqliteBackend {
    async fn parent(&self, doc_id: &DocId, node: &NodeId) -> anyhow::Result<ParentLink> {
        if node.is_root() {
            return Ok(ParentLink::Root);
        }
        let conn = self.conn.lock();
        let row: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT parent FROM nodes WHERE doc_id = ?1 AND node = ?2",
                params![doc_id.as_str(), node.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(match row {
            Some(Some(parent)) => {
                ParentLink::Parent(NodeId::from_slice(&parent).map_err(|e| StoreError::Decode(e.to_string()))?)
            }
            Some(None) => ParentLink::Detached,
            None => ParentLink::Unknown,
        })
    }
}

#[async_trait]
impl OpAuthSidecar for SqliteBackend {
    async fn put_op_auth(&self, doc_id: &DocId, entries: &[(OpRef, OpAuth)]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        for (op_ref, auth) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO op_auth (doc_id, op_ref, sig, proof_ref, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    doc_id.as_str(),
                    op_ref.as_bytes().as_slice(),
                    auth.sig.as_slice(),
                    auth.proof_ref.as_ref().map(|p| p.as_bytes().as_slice()),
                    now_ms(),
                ],
            )
            .map_err(StoreError::from)?;
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    async fn get_op_auth(&self, doc_id: &DocId, op_ref: &OpRef) -> anyhow::Result<Option<OpAuth>> {
        let conn = self.conn.lock();
        let row: Option<(Vec<u8>, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT sig, proof_ref FROM op_auth WHERE doc_id = ?1 AND op_ref = ?2",
                params![doc_id.as_str(), op_ref.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(match row {
            Some((sig, proof_ref)) => Some(OpAuth {
                sig: sig_from_row(sig)?,
                proof_ref: proof_ref_from_row(proof_ref)?,
            }),
            None => None,
        })
    }
}

#[async_trait]
impl SecretStore for SqliteBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM secrets WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(StoreError::from)?)
    }

    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO secrets (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM secrets WHERE key = ?1", params![key])
            .map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn max_lamport(&self, doc_id: &DocId) -> anyhow::Result<u64> {
        let conn = self.conn.lock();
        let max: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(lamport), 0) FROM ops WHERE doc_id = ?1",
                params![doc_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        Ok(max as u64)
    }

    async fn list_op_refs(&self, doc_id: &DocId, filter: &Filter) -> anyhow::Result<Vec<OpRef>> {
        let conn = self.conn.lock();
        let raw: Vec<Vec<u8>> = match filter {
            Filter::All => {
                let mut stmt = conn
                    .prepare("SELECT op_ref FROM ops WHERE doc_id = ?1 ORDER BY lamport, op_ref")
                    .map_err(StoreError::from)?;
                let rows = stmt
                    .query_map(params![doc_id.as_str()], |row| row.get(0))
                    .map_err(StoreError::from)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from)?;
                rows
            }
            Filter::Children { parent } => {
                let mut stmt = conn
                    .prepare(
                        "SELECT op_ref FROM ops WHERE doc_id = ?1 AND scope_node = ?2
                         ORDER BY lamport, op_ref",
                    )
                    .map_err(StoreError::from)?;
                let rows = stmt
                    .query_map(
                        params![doc_id.as_str(), parent.as_bytes().as_slice()],
                        |row| row.get(0),
                    )
                    .map_err(StoreError::from)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from)?;
                rows
            }
        };
        let mut refs = Vec::with_capacity(raw.len());
        for r in raw {
            refs.push(OpRef::from_slice(&r).map_err(|e| StoreError::Decode(e.to_string()))?);
        }
        Ok(refs)
    }

    async fn get_ops(&self, doc_id: &DocId, refs: &[OpRef]) -> anyhow::Result<Vec<Operation>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT op_bytes FROM ops WHERE doc_id = ?1 AND op_ref = ?2")
            .map_err(StoreError::from)?;
        let mut ops = Vec::with_capacity(refs.len());
        for op_ref in refs {
            let bytes: Option<Vec<u8>> = stmt
                .query_row(params![doc_id.as_str(), op_ref.as_bytes().as_slice()], |row| row.get(0))
                .optional()
                .map_err(StoreError::from)?;
            match bytes {
                Some(bytes) => {
                    ops.push(Operation::decode(&bytes).map_err(|e| StoreError::Decode(e.to_string()))?)
                }
                None => tracing::warn!(op_ref = %op_ref.to_hex(), "requested op not in store"),
            }
        }
        Ok(ops)
    }

    async fn apply_ops(&self, doc_id: &DocId, ops: &[Operation]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        for op in ops {
            Self::apply_one(&tx, doc_id, op)?;
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    async fn store_pending_ops(&self, doc_id: &DocId, rows: &[PendingOp]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        for row in rows {
            // derive the ref from the decoded op so a poisoned wire ref
            // cannot collide with an unrelated op
            let op_ref = row.op.op_ref(doc_id);
            let op_bytes = row.op.encode().map_err(|e| StoreError::Decode(e.to_string()))?;
            tx.execute(
                "INSERT OR REPLACE INTO pending_ops
                 (doc_id, op_ref, op_bytes, sig, proof_ref, reason, message, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    doc_id.as_str(),
                    op_ref.as_bytes().as_slice(),
                    op_bytes,
                    row.auth.sig.as_slice(),
                    row.auth.proof_ref.as_ref().map(|p| p.as_bytes().as_slice()),
                    row.reason,
                    row.message,
                    row.created_at_ms,
                ],
            )
            .map_err(StoreError::from)?;
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    async fn list_pending_ops(&self, doc_id: &DocId) -> anyhow::Result<Vec<PendingOp>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT op_bytes, sig, proof_ref, reason, message, created_at_ms
                 FROM pending_ops WHERE doc_id = ?1 ORDER BY rowid",
            )
            .map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params![doc_id.as_str()], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;

        let mut pending = Vec::with_capacity(rows.len());
        for (op_bytes, sig, proof_ref, reason, message, created_at_ms) in rows {
            pending.push(PendingOp {
                op: Operation::decode(&op_bytes).map_err(|e| StoreError::Decode(e.to_string()))?,
                auth: OpAuth {
                    sig: sig_from_row(sig)?,
                    proof_ref: proof_ref_from_row(proof_ref)?,
                },
                reason,
                message,
                created_at_ms,
            });
        }
        Ok(pending)
    }

    async fn list_pending_op_refs(&self, doc_id: &DocId) -> anyhow::Result<Vec<OpRef>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT op_ref FROM pending_ops WHERE doc_id = ?1 ORDER BY rowid")
            .map_err(StoreError::from)?;
        let raw = stmt
            .query_map(params![doc_id.as_str()], |row| row.get::<_, Vec<u8>>(0))
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        let mut refs = Vec::with_capacity(raw.len());
        for r in raw {
            refs.push(OpRef::from_slice(&r).map_err(|e| StoreError::Decode(e.to_string()))?);
        }
        Ok(refs)
    }

    async fn delete_pending_ops(&self, doc_id: &DocId, refs: &[OpRef]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        for op_ref in refs {
            tx.execute(
                "DELETE FROM pending_ops WHERE doc_id = ?1 AND op_ref = ?2",
                params![doc_id.as_str(), op_ref.as_bytes().as_slice()],
            )
            .map_err(StoreError::from)?;
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treecrdt_auth::ids::{ROOT_NODE_ID, ReplicaId};
    use treecrdt_auth::op::{OpId, OpMeta};

    fn doc() -> DocId {
        DocId::new("doc-store").unwrap()
    }

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 16])
    }

    fn insert(counter: u64, parent: NodeId, target: NodeId) -> Operation {
        Operation {
            meta: OpMeta {
                id: OpId {
                    replica: ReplicaId::from_bytes([1u8; 32]),
                    counter,
                },
                lamport: counter,
            },
            kind: OpKind::Insert {
                parent,
                node: target,
                order_key: vec![counter as u8],
                payload: None,
            },
        }
    }

    #[tokio::test]
    async fn apply_and_list() {
        let backend = SqliteBackend::open_memory().unwrap();
        let d = doc();
        let op1 = insert(1, ROOT_NODE_ID, node(1));
        let op2 = insert(2, node(1), node(2));
        backend.apply_ops(&d, &[op1.clone(), op2.clone()]).await.unwrap();

        let refs = backend.list_op_refs(&d, &Filter::All).await.unwrap();
        assert_eq!(refs, vec![op1.op_ref(&d), op2.op_ref(&d)]);
        assert_eq!(backend.max_lamport(&d).await.unwrap(), 2);

        let ops = backend.get_ops(&d, &refs).await.unwrap();
        assert_eq!(ops, vec![op1.clone(), op2]);

        // idempotent re-apply
        backend.apply_ops(&d, &[op1]).await.unwrap();
        assert_eq!(backend.list_op_refs(&d, &Filter::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn children_filter_uses_anchor_parent() {
        let backend = SqliteBackend::open_memory().unwrap();
        let d = doc();
        let under_root = insert(1, ROOT_NODE_ID, node(1));
        let under_one = insert(2, node(1), node(2));
        backend.apply_ops(&d, &[under_root.clone(), under_one.clone()]).await.unwrap();

        // a delete files under the node's parent at apply time
        let del = Operation {
            meta: OpMeta {
                id: OpId {
                    replica: ReplicaId::from_bytes([1u8; 32]),
                    counter: 3,
                },
                lamport: 3,
            },
            kind: OpKind::Delete { node: node(2) },
        };
        backend.apply_ops(&d, std::slice::from_ref(&del)).await.unwrap();

        let refs = backend
            .list_op_refs(&d, &Filter::Children { parent: node(1) })
            .await
            .unwrap();
        assert_eq!(refs, vec![under_one.op_ref(&d), del.op_ref(&d)]);

        let root_refs = backend
            .list_op_refs(&d, &Filter::Children { parent: ROOT_NODE_ID })
            .await
            .unwrap();
        assert_eq!(root_refs, vec![under_root.op_ref(&d)]);
    }

    #[tokio::test]
    async fn tree_context_reflects_moves() {
        let backend = SqliteBackend::open_memory().unwrap();
        let d = doc();
        backend
            .apply_ops(&d, &[insert(1, ROOT_NODE_ID, node(1)), insert(2, node(1), node(2))])
            .await
            .unwrap();

        assert_eq!(backend.parent(&d, &node(2)).await.unwrap(), ParentLink::Parent(node(1)));
        assert_eq!(backend.parent(&d, &ROOT_NODE_ID).await.unwrap(), ParentLink::Root);
        assert_eq!(backend.parent(&d, &node(9)).await.unwrap(), ParentLink::Unknown);

        let mv = Operation {
            meta: OpMeta {
                id: OpId {
                    replica: ReplicaId::from_bytes([1u8; 32]),
                    counter: 3,
                },
                lamport: 3,
            },
            kind: OpKind::Move {
                node: node(2),
                new_parent: ROOT_NODE_ID,
                order_key: vec![9],
            },
        };
        backend.apply_ops(&d, &[mv]).await.unwrap();
        assert_eq!(backend.parent(&d, &node(2)).await.unwrap(), ParentLink::Parent(ROOT_NODE_ID));
    }

    #[tokio::test]
    async fn pending_sidecar_round_trip() {
        let backend = SqliteBackend::open_memory().unwrap();
        let d = doc();
        let op = insert(1, node(5), node(6));
        let row = PendingOp::missing_context(
            op.clone(),
            OpAuth {
                sig: [7u8; 64],
                proof_ref: Some(TokenId::from_envelope(b"tok")),
            },
            Some("missing subtree context to authorize op".into()),
            123,
        );
        backend.store_pending_ops(&d, std::slice::from_ref(&row)).await.unwrap();
        // idempotent
        backend.store_pending_ops(&d, std::slice::from_ref(&row)).await.unwrap();

        let listed = backend.list_pending_ops(&d).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].op, op);
        assert_eq!(listed[0].auth, row.auth);
        assert_eq!(listed[0].reason, "missing_context");

        assert_eq!(backend.list_pending_op_refs(&d).await.unwrap(), vec![op.op_ref(&d)]);

        backend.delete_pending_ops(&d, &[op.op_ref(&d)]).await.unwrap();
        assert!(backend.list_pending_ops(&d).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn op_auth_sidecar_round_trip() {
        let backend = SqliteBackend::open_memory().unwrap();
        let d = doc();
        let op_ref = OpRef::from_bytes([3u8; 16]);
        let auth = OpAuth {
            sig: [9u8; 64],
            proof_ref: None,
        };
        backend.put_op_auth(&d, &[(op_ref, auth.clone())]).await.unwrap();
        assert_eq!(backend.get_op_auth(&d, &op_ref).await.unwrap(), Some(auth));
        assert_eq!(backend.get_op_auth(&d, &OpRef::from_bytes([4u8; 16])).await.unwrap(), None);
    }

    #[tokio::test]
    async fn secrets_round_trip() {
        let backend = SqliteBackend::open_memory().unwrap();
        backend.put("k", b"v1").await.unwrap();
        backend.put("k", b"v2").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v2".to_vec()));
        backend.delete("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn docs_are_isolated() {
        let backend = SqliteBackend::open_memory().unwrap();
        let d1 = DocId::new("doc-a").unwrap();
        let d2 = DocId::new("doc-b").unwrap();
        backend.apply_ops(&d1, &[insert(1, ROOT_NODE_ID, node(1))]).await.unwrap();
        assert_eq!(backend.list_op_refs(&d2, &Filter::All).await.unwrap(), vec![]);
        assert_eq!(backend.max_lamport(&d2).await.unwrap(), 0);
    }
}
