//! Two in-process peers reconciling a document over the memory transport.
//!
//! Run with: `cargo run -p treecrdt-sync --example two_peers`

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use treecrdt_auth::engine::{SyncAuth, SyncAuthConfig};
use treecrdt_auth::ids::{DocId, NodeId, ROOT_NODE_ID};
use treecrdt_auth::op::{Filter, OpId, OpKind, OpMeta, Operation};
use treecrdt_auth::token::{Action, issue_capability_token};
use treecrdt_store::{Backend, SqliteBackend};
use treecrdt_sync::peer::{SyncOptions, SyncPeer};
use treecrdt_sync::transport::{memory_link, spawn_pump};

async fn peer(
    doc: &DocId,
    issuer: &SigningKey,
    key: SigningKey,
) -> (Arc<SqliteBackend>, Arc<SyncAuth>, Arc<SyncPeer>) {
    let token = issue_capability_token(
        issuer,
        &key.verifying_key(),
        doc,
        &[Action::WriteStructure, Action::WritePayload],
        None,
        None,
        &[],
        None,
        None,
    )
    .expect("token");
    let backend = SqliteBackend::open_memory().expect("backend");
    let mut cfg = SyncAuthConfig::new(doc.clone(), vec![issuer.verifying_key()], key);
    cfg.local_tokens = vec![token];
    cfg.tree = Some(backend.clone());
    cfg.op_auth_store = Some(backend.clone());
    let auth = SyncAuth::new(cfg).await;
    let sync = SyncPeer::new(doc.clone(), backend.clone(), Some(auth.clone()), SyncOptions::default());
    (backend, auth, sync)
}

async fn author(
    backend: &Arc<SqliteBackend>,
    auth: &Arc<SyncAuth>,
    doc: &DocId,
    counter: u64,
    node: NodeId,
    payload: &str,
) {
    let op = Operation {
        meta: OpMeta {
            id: OpId {
                replica: auth.replica_id(),
                counter,
            },
            lamport: counter,
        },
        kind: OpKind::Insert {
            parent: ROOT_NODE_ID,
            node,
            order_key: vec![counter as u8],
            payload: Some(payload.as_bytes().to_vec()),
        },
    };
    auth.sign_ops(std::slice::from_ref(&op)).await.expect("sign");
    backend.apply_ops(doc, std::slice::from_ref(&op)).await.expect("apply");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,treecrdt_sync=debug".into()),
        )
        .init();

    let doc = DocId::new("demo-doc").expect("doc id");
    let issuer = SigningKey::generate(&mut OsRng);

    let (backend_a, auth_a, peer_a) = peer(&doc, &issuer, SigningKey::generate(&mut OsRng)).await;
    let (backend_b, auth_b, peer_b) = peer(&doc, &issuer, SigningKey::generate(&mut OsRng)).await;

    author(&backend_a, &auth_a, &doc, 1, NodeId::from_bytes([1; 16]), "hello from a").await;
    author(&backend_b, &auth_b, &doc, 1, NodeId::from_bytes([2; 16]), "hello from b").await;
    author(&backend_b, &auth_b, &doc, 2, NodeId::from_bytes([3; 16]), "more from b").await;

    let ((a_to_b, a_out), (b_to_a, b_out)) = memory_link("a", "b");
    spawn_pump(a_out, peer_b.clone(), b_to_a.clone());
    spawn_pump(b_out, peer_a.clone(), a_to_b.clone());

    let transport: Arc<dyn treecrdt_sync::transport::Transport> = a_to_b;
    peer_a.sync_once(&transport, Filter::All).await.expect("sync");

    let refs_a = backend_a.list_op_refs(&doc, &Filter::All).await.expect("refs");
    let refs_b = backend_b.list_op_refs(&doc, &Filter::All).await.expect("refs");
    tracing::info!(ops_a = refs_a.len(), ops_b = refs_b.len(), "converged");
    assert_eq!(refs_a, refs_b);
}
