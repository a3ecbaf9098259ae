//! Responder protocol rules, driven message-by-message through a capturing
//! transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use treecrdt_auth::engine::{SyncAuth, SyncAuthConfig};
use treecrdt_auth::ids::DocId;
use treecrdt_auth::op::Filter;
use treecrdt_auth::token::{Action, issue_capability_token};
use treecrdt_store::SqliteBackend;
use treecrdt_sync::error::SyncError;
use treecrdt_sync::messages::{
    FilterSpec, Hello, Payload, RibltCodewords, RibltOutcome, SyncMessage,
};
use treecrdt_sync::peer::{RIBLT_OUT_OF_ORDER, SyncOptions, SyncPeer};
use treecrdt_sync::riblt::CODEWORD_SIZE;
use treecrdt_sync::transport::Transport;

/// Records every outgoing message instead of delivering it.
struct CaptureTransport {
    peer: String,
    sent: Mutex<Vec<SyncMessage>>,
}

impl CaptureTransport {
    fn new(peer: &str) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn messages(&self) -> Vec<SyncMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for CaptureTransport {
    fn peer_id(&self) -> &str {
        &self.peer
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), SyncError> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

struct Responder {
    doc: DocId,
    peer: Arc<SyncPeer>,
    remote_auth: Arc<SyncAuth>,
    transport: Arc<CaptureTransport>,
}

impl Responder {
    async fn deliver(&self, payload: Payload) {
        let transport: Arc<dyn Transport> = self.transport.clone();
        self.peer
            .handle_message(&transport, SyncMessage::new(self.doc.as_str(), payload))
            .await
            .unwrap();
    }
}

/// A responder with a full auth stack, plus an auth engine standing in for
/// the remote peer (to produce its capability advertisements).
async fn responder() -> Responder {
    let doc = DocId::new("doc-protocol").unwrap();
    let issuer = SigningKey::generate(&mut OsRng);

    let remote_key = SigningKey::generate(&mut OsRng);
    let token = issue_capability_token(
        &issuer,
        &remote_key.verifying_key(),
        &doc,
        &[Action::WriteStructure],
        None,
        None,
        &[],
        None,
        None,
    )
    .unwrap();
    let mut remote_cfg = SyncAuthConfig::new(doc.clone(), vec![issuer.verifying_key()], remote_key);
    remote_cfg.local_tokens = vec![token];
    let remote_auth = SyncAuth::new(remote_cfg).await;

    let backend = SqliteBackend::open_memory().unwrap();
    let local_key = SigningKey::generate(&mut OsRng);
    let mut cfg = SyncAuthConfig::new(doc.clone(), vec![issuer.verifying_key()], local_key);
    cfg.tree = Some(backend.clone());
    cfg.op_auth_store = Some(backend.clone());
    let auth = SyncAuth::new(cfg).await;
    let peer = SyncPeer::new(doc.clone(), backend, Some(auth), SyncOptions::default());

    Responder {
        doc,
        peer,
        remote_auth,
        transport: CaptureTransport::new("remote"),
    }
}

fn filters(n: usize) -> Vec<FilterSpec> {
    (0..n)
        .map(|i| FilterSpec {
            id: format!("f_{i:02}"),
            filter: Filter::All,
        })
        .collect()
}

#[tokio::test]
async fn hello_without_capability_entry_rejects_every_filter() {
    let r = responder().await;
    r.deliver(Payload::Hello(Hello {
        capabilities: Vec::new(),
        filters: filters(2),
        max_lamport: 0,
    }))
    .await;

    let messages = r.transport.messages();
    assert_eq!(messages.len(), 1);
    let Payload::HelloAck(ack) = &messages[0].payload else {
        panic!("expected hello ack");
    };
    assert!(ack.accepted_filters.is_empty());
    assert_eq!(ack.rejected_filters.len(), 2);
    for rejected in &ack.rejected_filters {
        assert_eq!(rejected.reason, "UNAUTHORIZED");
    }
}

#[tokio::test]
async fn filters_beyond_the_cap_are_rejected() {
    let r = responder().await;
    r.deliver(Payload::Hello(Hello {
        capabilities: r.remote_auth.hello_capabilities().await,
        filters: filters(9),
        max_lamport: 0,
    }))
    .await;

    let messages = r.transport.messages();
    let Payload::HelloAck(ack) = &messages[0].payload else {
        panic!("expected hello ack");
    };
    assert_eq!(ack.accepted_filters.len(), 8);
    assert_eq!(ack.rejected_filters.len(), 1);
    assert_eq!(ack.rejected_filters[0].id, "f_08");
    assert_eq!(ack.rejected_filters[0].reason, "TOO_MANY_FILTERS");
}

#[tokio::test]
async fn out_of_order_codewords_drop_the_session() {
    let r = responder().await;
    r.deliver(Payload::Hello(Hello {
        capabilities: r.remote_auth.hello_capabilities().await,
        filters: filters(1),
        max_lamport: 0,
    }))
    .await;

    // a gap in the codeword stream
    r.deliver(Payload::RibltCodewords(RibltCodewords {
        filter_id: "f_00".into(),
        round: 0,
        start_index: 7,
        codewords: vec![vec![0u8; CODEWORD_SIZE]],
    }))
    .await;

    let messages = r.transport.messages();
    assert_eq!(messages.len(), 2);
    let Payload::RibltStatus(status) = &messages[1].payload else {
        panic!("expected riblt status");
    };
    match &status.outcome {
        RibltOutcome::Failed { reason, .. } => assert_eq!(reason, RIBLT_OUT_OF_ORDER),
        other => panic!("expected failure, got {other:?}"),
    }

    // the session is gone: a correctly ordered chunk is ignored now
    r.deliver(Payload::RibltCodewords(RibltCodewords {
        filter_id: "f_00".into(),
        round: 0,
        start_index: 0,
        codewords: vec![vec![0u8; CODEWORD_SIZE]],
    }))
    .await;
    assert_eq!(r.transport.messages().len(), 2);
}

#[tokio::test]
async fn empty_reconciliation_sends_closing_batch() {
    let r = responder().await;
    r.deliver(Payload::Hello(Hello {
        capabilities: r.remote_auth.hello_capabilities().await,
        filters: filters(1),
        max_lamport: 0,
    }))
    .await;

    // both sides empty: the very first (all-zero) codeword decodes
    r.deliver(Payload::RibltCodewords(RibltCodewords {
        filter_id: "f_00".into(),
        round: 0,
        start_index: 0,
        codewords: vec![vec![0u8; CODEWORD_SIZE]],
    }))
    .await;

    let messages = r.transport.messages();
    assert_eq!(messages.len(), 3);
    let Payload::RibltStatus(status) = &messages[1].payload else {
        panic!("expected riblt status");
    };
    match &status.outcome {
        RibltOutcome::Decoded {
            sender_missing,
            receiver_missing,
            ..
        } => {
            assert!(sender_missing.is_empty());
            assert!(receiver_missing.is_empty());
        }
        other => panic!("expected decode, got {other:?}"),
    }
    let Payload::OpsBatch(batch) = &messages[2].payload else {
        panic!("expected closing batch");
    };
    assert!(batch.ops.is_empty());
    assert!(batch.done);
}

#[tokio::test]
async fn messages_for_another_document_are_ignored() {
    let r = responder().await;
    let transport: Arc<dyn Transport> = r.transport.clone();
    r.peer
        .handle_message(
            &transport,
            SyncMessage::new(
                "someone-elses-doc",
                Payload::Hello(Hello {
                    capabilities: r.remote_auth.hello_capabilities().await,
                    filters: filters(1),
                    max_lamport: 0,
                }),
            ),
        )
        .await
        .unwrap();
    assert!(r.transport.messages().is_empty());
}
