//! The sync peer: session protocol, subscriptions, and pending reprocessing.
//!
//! A `SyncPeer` acts as initiator and responder concurrently over any number
//! of transports. Initiator sessions stream RIBLT codewords until the
//! responder decodes the set difference, then both sides exchange signed op
//! batches. Subscriptions push fresh ops to interested peers from a
//! single-writer push loop woken by `notify_local_update`.
//!
//! Per-session futures (hello ack, riblt status, batch completion) are
//! oneshot channels resolved by the message handlers; `Error` messages
//! reject them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::task::JoinHandle;

use treecrdt_auth::engine::{CAP_TOKEN, OpDisposition, SyncAuth};
use treecrdt_auth::error::AuthError;
use treecrdt_auth::ids::{DocId, OpRef};
use treecrdt_auth::op::{Filter, OpAuth, Operation};
use treecrdt_store::{Backend, PendingOp};

use crate::error::SyncError;
use crate::messages::{
    ErrorCode, ErrorMessage, FilterSpec, Hello, HelloAck, OpsBatch, Payload, RejectedFilter,
    RibltCodewords, RibltOutcome, RibltStatus, Subscribe, SubscribeAck, SyncMessage, Unsubscribe,
};
use crate::riblt::{CodedSymbol, Decoder, Encoder};
use crate::transport::Transport;

const REPROCESS_MAX_ROUNDS: usize = 100;

/// Failure reason strings carried in `RibltStatus.failed`.
pub const RIBLT_OUT_OF_ORDER: &str = "OUT_OF_ORDER";
pub const RIBLT_MAX_CODEWORDS: &str = "MAX_CODEWORDS";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub codewords_per_message: usize,
    pub max_codewords: u64,
    pub max_ops_per_batch: usize,
    pub max_hello_filters: usize,
    /// How long to wait for a trailing status after the codeword limit.
    pub status_grace: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            codewords_per_message: 512,
            max_codewords: 50_000,
            max_ops_per_batch: 5_000,
            max_hello_filters: 8,
            status_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub filter: Filter,
    /// Run a `sync_once` right after the subscription is acknowledged.
    pub immediate_sync: bool,
    /// When > 0, keep running `sync_once` on this interval.
    pub interval_ms: u64,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            immediate_sync: true,
            interval_ms: 0,
        }
    }
}

struct InitiatorSession {
    ack_tx: Option<oneshot::Sender<Result<HelloAck, SyncError>>>,
    status_tx: Option<oneshot::Sender<Result<RibltOutcome, SyncError>>>,
    done_tx: Option<oneshot::Sender<Result<(), SyncError>>>,
}

impl InitiatorSession {
    fn fail(mut self, make: impl Fn() -> SyncError) {
        if let Some(tx) = self.ack_tx.take() {
            let _ = tx.send(Err(make()));
        }
        if let Some(tx) = self.status_tx.take() {
            let _ = tx.send(Err(make()));
        }
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(Err(make()));
        }
    }
}

struct ResponderSession {
    decoder: Decoder,
    expected_index: u64,
    round: u32,
}

struct InboundSubscription {
    filter: Filter,
    /// Refs already forwarded (or deliberately filtered) for this
    /// subscription; seeded with the ref set at subscribe time.
    sent: HashSet<OpRef>,
}

#[derive(Default)]
struct PeerState {
    transports: HashMap<String, Arc<dyn Transport>>,
    /// Peers whose hello carried verified capability tokens.
    peer_has_auth: HashSet<String>,
    initiator: HashMap<String, InitiatorSession>,
    responder: HashMap<(String, String), ResponderSession>,
    subs_in: HashMap<(String, String), InboundSubscription>,
    sub_acks: HashMap<String, oneshot::Sender<Result<u64, SyncError>>>,
}

pub struct SyncPeer {
    doc_id: DocId,
    backend: Arc<dyn Backend>,
    auth: Option<Arc<SyncAuth>>,
    opts: SyncOptions,
    state: Mutex<PeerState>,
    push_notify: Arc<Notify>,
    reprocess_lock: Mutex<()>,
    /// Dropped with the peer; stops the push loop.
    _push_shutdown: watch::Sender<bool>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn random_id(prefix: &str) -> String {
    format!("{prefix}_{}", hex::encode(rand::random::<[u8; 4]>()))
}

/// Strip the error-type prefix for user-facing rejection messages.
fn reject_message(err: &AuthError) -> String {
    match err {
        AuthError::Unauthorized(message) => message.clone(),
        other => other.to_string(),
    }
}

impl SyncPeer {
    pub fn new(
        doc_id: DocId,
        backend: Arc<dyn Backend>,
        auth: Option<Arc<SyncAuth>>,
        opts: SyncOptions,
    ) -> Arc<Self> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let peer = Arc::new(Self {
            doc_id,
            backend,
            auth,
            opts,
            state: Mutex::new(PeerState::default()),
            push_notify: Arc::new(Notify::new()),
            reprocess_lock: Mutex::new(()),
            _push_shutdown: shutdown_tx,
        });

        // single-writer push loop; at most one pass runs at a time, a wake
        // during a pass schedules exactly one more
        let weak = Arc::downgrade(&peer);
        let notify = peer.push_notify.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {
                        let Some(peer) = weak.upgrade() else { break };
                        peer.push_pass().await;
                    }
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        peer
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// Wake the push loop: a local update may need forwarding to subscribers.
    pub fn notify_local_update(&self) {
        self.push_notify.notify_one();
    }

    async fn send(&self, transport: &Arc<dyn Transport>, payload: Payload) -> Result<(), SyncError> {
        transport
            .send(SyncMessage::new(self.doc_id.as_str(), payload))
            .await
    }

    // ── Initiator ──────────────────────────────────────────────────────────

    /// Reconcile one filter with the peer on `transport`: exchange hellos,
    /// stream codewords until the responder decodes, then swap op batches.
    /// Completes when the responder's closing batch has been applied.
    pub async fn sync_once(&self, transport: &Arc<dyn Transport>, filter: Filter) -> Result<(), SyncError> {
        let peer = transport.peer_id().to_string();
        let filter_id = random_id("f");
        let (ack_tx, ack_rx) = oneshot::channel();
        let (status_tx, status_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.transports.insert(peer.clone(), transport.clone());
            state.initiator.insert(
                filter_id.clone(),
                InitiatorSession {
                    ack_tx: Some(ack_tx),
                    status_tx: Some(status_tx),
                    done_tx: Some(done_tx),
                },
            );
        }

        let result = self
            .run_initiator(transport, &peer, &filter_id, filter, ack_rx, status_rx, done_rx)
            .await;
        self.state.lock().await.initiator.remove(&filter_id);
        if let Err(err) = &result {
            tracing::debug!(filter_id = %filter_id, error = %err, "sync session failed");
        }
        result
    }

    async fn run_initiator(
        &self,
        transport: &Arc<dyn Transport>,
        peer: &str,
        filter_id: &str,
        filter: Filter,
        ack_rx: oneshot::Receiver<Result<HelloAck, SyncError>>,
        mut status_rx: oneshot::Receiver<Result<RibltOutcome, SyncError>>,
        done_rx: oneshot::Receiver<Result<(), SyncError>>,
    ) -> Result<(), SyncError> {
        let capabilities = match &self.auth {
            Some(auth) => auth.hello_capabilities().await,
            None => Vec::new(),
        };
        let max_lamport = self
            .backend
            .max_lamport(&self.doc_id)
            .await
            .map_err(SyncError::backend)?;
        self.send(
            transport,
            Payload::Hello(Hello {
                capabilities,
                filters: vec![FilterSpec {
                    id: filter_id.to_string(),
                    filter,
                }],
                max_lamport,
            }),
        )
        .await?;

        let ack = ack_rx.await.map_err(|_| SyncError::SessionClosed)??;
        if let Some(rejected) = ack.rejected_filters.iter().find(|r| r.id == filter_id) {
            return Err(match rejected.reason.as_str() {
                "UNAUTHORIZED" => SyncError::Unauthorized(
                    rejected.message.clone().unwrap_or_else(|| rejected.reason.clone()),
                ),
                _ => SyncError::Rejected {
                    reason: rejected.reason.clone(),
                    message: rejected.message.clone(),
                },
            });
        }
        if !ack.accepted_filters.iter().any(|id| id == filter_id) {
            return Err(SyncError::Protocol("filter not acknowledged".into()));
        }

        // local set, reduced to what the peer may see
        let refs = self
            .backend
            .list_op_refs(&self.doc_id, &filter)
            .await
            .map_err(SyncError::backend)?;
        let refs = self.outgoing_filter_refs(peer, refs).await?;
        let mut encoder = Encoder::new();
        for op_ref in &refs {
            encoder.add_symbol(*op_ref.as_bytes());
        }

        let mut start_index: u64 = 0;
        let mut outcome: Option<RibltOutcome> = None;
        while start_index < self.opts.max_codewords {
            match status_rx.try_recv() {
                Ok(status) => {
                    outcome = Some(status?);
                    break;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => return Err(SyncError::SessionClosed),
            }
            let n = self
                .opts
                .codewords_per_message
                .min((self.opts.max_codewords - start_index) as usize);
            let codewords: Vec<Vec<u8>> = (0..n)
                .map(|_| encoder.next_codeword().encode().to_vec())
                .collect();
            self.send(
                transport,
                Payload::RibltCodewords(RibltCodewords {
                    filter_id: filter_id.to_string(),
                    round: 0,
                    start_index,
                    codewords,
                }),
            )
            .await?;
            start_index += n as u64;
            tokio::task::yield_now().await;
        }

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => match tokio::time::timeout(self.opts.status_grace, status_rx).await {
                Ok(Ok(status)) => status?,
                Ok(Err(_)) => return Err(SyncError::SessionClosed),
                Err(_) => return Err(SyncError::MaxCodewords),
            },
        };

        match outcome {
            RibltOutcome::Failed { reason, message } => Err(SyncError::Riblt(match message {
                Some(message) => format!("{reason}: {message}"),
                None => reason,
            })),
            RibltOutcome::Decoded {
                receiver_missing,
                codewords_received,
                ..
            } => {
                tracing::debug!(
                    filter_id,
                    codewords_received,
                    missing = receiver_missing.len(),
                    "reconciliation decoded"
                );
                self.send_ops_batches(transport, filter_id, &receiver_missing).await?;
                done_rx.await.map_err(|_| SyncError::SessionClosed)?
            }
        }
    }

    /// Reduce a ref set to the ops this peer is allowed to see.
    async fn outgoing_filter_refs(&self, peer: &str, refs: Vec<OpRef>) -> Result<Vec<OpRef>, SyncError> {
        let Some(auth) = &self.auth else {
            return Ok(refs);
        };
        if !auth.peer_has_capabilities(peer).await {
            return Ok(refs);
        }
        let ops = self
            .backend
            .get_ops(&self.doc_id, &refs)
            .await
            .map_err(SyncError::backend)?;
        let mask = auth.filter_outgoing_ops(peer, &ops).await?;
        Ok(ops
            .iter()
            .zip(mask)
            .filter(|(_, keep)| *keep)
            .map(|(op, _)| op.op_ref(&self.doc_id))
            .collect())
    }

    /// Ship ops for `refs` in batches, marking the last one `done`.
    async fn send_ops_batches(
        &self,
        transport: &Arc<dyn Transport>,
        filter_id: &str,
        refs: &[OpRef],
    ) -> Result<(), SyncError> {
        if refs.is_empty() {
            return self
                .send(
                    transport,
                    Payload::OpsBatch(OpsBatch {
                        filter_id: filter_id.to_string(),
                        ops: Vec::new(),
                        auth: None,
                        done: true,
                    }),
                )
                .await;
        }
        let chunks: Vec<&[OpRef]> = refs.chunks(self.opts.max_ops_per_batch).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let ops = self
                .backend
                .get_ops(&self.doc_id, chunk)
                .await
                .map_err(SyncError::backend)?;
            let auth = match &self.auth {
                Some(auth) => Some(auth.sign_ops(&ops).await?),
                None => None,
            };
            let encoded = ops
                .iter()
                .map(|op| op.encode())
                .collect::<Result<Vec<_>, _>>()?;
            self.send(
                transport,
                Payload::OpsBatch(OpsBatch {
                    filter_id: filter_id.to_string(),
                    ops: encoded,
                    auth,
                    done: i == last,
                }),
            )
            .await?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    // ── Message dispatch ───────────────────────────────────────────────────

    /// Handle one incoming message from `from`. Messages for other documents
    /// are dropped.
    pub async fn handle_message(&self, from: &Arc<dyn Transport>, msg: SyncMessage) -> Result<(), SyncError> {
        if msg.doc_id != self.doc_id.as_str() {
            tracing::trace!(doc_id = %msg.doc_id, "dropping message for other document");
            return Ok(());
        }
        match msg.payload {
            Payload::Hello(hello) => self.on_hello(from, hello).await,
            Payload::HelloAck(ack) => self.on_hello_ack(from, ack).await,
            Payload::RibltCodewords(cw) => self.on_codewords(from, cw).await,
            Payload::RibltStatus(status) => self.on_status(status).await,
            Payload::OpsBatch(batch) => self.on_ops_batch(from, batch).await,
            Payload::Subscribe(sub) => self.on_subscribe(from, sub).await,
            Payload::SubscribeAck(ack) => self.on_subscribe_ack(ack).await,
            Payload::Unsubscribe(unsub) => self.on_unsubscribe(from, unsub).await,
            Payload::Error(err) => self.on_error(err).await,
        }
    }

    // ── Responder ──────────────────────────────────────────────────────────

    async fn on_hello(&self, from: &Arc<dyn Transport>, hello: Hello) -> Result<(), SyncError> {
        let peer = from.peer_id().to_string();
        self.state
            .lock()
            .await
            .transports
            .insert(peer.clone(), from.clone());

        let ack_capabilities = match &self.auth {
            Some(auth) => auth.hello_capabilities().await,
            None => Vec::new(),
        };

        // capability recording happens before filter authorization so
        // concurrent messages on this transport see the peer's grants
        let mut auth_failure: Option<String> = None;
        if let Some(auth) = &self.auth {
            if !hello.capabilities.iter().any(|e| e.name == CAP_TOKEN) {
                auth_failure = Some("peer advertised no capability".to_string());
            } else {
                match auth.on_peer_capabilities(&peer, &hello.capabilities).await {
                    Ok(()) => {
                        self.state.lock().await.peer_has_auth.insert(peer.clone());
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer, error = %err, "hello capabilities rejected");
                        auth_failure = Some(reject_message(&err));
                    }
                }
            }
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        if let Some(message) = auth_failure {
            for spec in &hello.filters {
                rejected.push(RejectedFilter {
                    id: spec.id.clone(),
                    reason: ErrorCode::Unauthorized.as_str().to_string(),
                    message: Some(message.clone()),
                });
            }
        } else {
            for (i, spec) in hello.filters.iter().enumerate() {
                if i >= self.opts.max_hello_filters {
                    rejected.push(RejectedFilter {
                        id: spec.id.clone(),
                        reason: ErrorCode::TooManyFilters.as_str().to_string(),
                        message: None,
                    });
                    continue;
                }
                let authorized = match &self.auth {
                    Some(auth) => auth.authorize_filter(&peer, &spec.filter).await,
                    None => Ok(()),
                };
                match authorized {
                    Ok(()) => {
                        let refs = self
                            .backend
                            .list_op_refs(&self.doc_id, &spec.filter)
                            .await
                            .map_err(SyncError::backend)?;
                        let refs = if matches!(spec.filter, Filter::Children { .. }) {
                            self.outgoing_filter_refs(&peer, refs).await?
                        } else {
                            refs
                        };
                        let mut decoder = Decoder::new();
                        for op_ref in &refs {
                            decoder.add_symbol(*op_ref.as_bytes());
                        }
                        self.state.lock().await.responder.insert(
                            (peer.clone(), spec.id.clone()),
                            ResponderSession {
                                decoder,
                                expected_index: 0,
                                round: 0,
                            },
                        );
                        accepted.push(spec.id.clone());
                    }
                    Err(err) => {
                        rejected.push(RejectedFilter {
                            id: spec.id.clone(),
                            reason: ErrorCode::Unauthorized.as_str().to_string(),
                            message: Some(reject_message(&err)),
                        });
                    }
                }
            }
        }

        let max_lamport = self
            .backend
            .max_lamport(&self.doc_id)
            .await
            .map_err(SyncError::backend)?;
        self.send(
            from,
            Payload::HelloAck(HelloAck {
                capabilities: ack_capabilities,
                accepted_filters: accepted,
                rejected_filters: rejected,
                max_lamport,
            }),
        )
        .await
    }

    async fn on_hello_ack(&self, from: &Arc<dyn Transport>, ack: HelloAck) -> Result<(), SyncError> {
        let peer = from.peer_id().to_string();
        let mut failure: Option<String> = None;
        if let Some(auth) = &self.auth {
            match auth.on_peer_capabilities(&peer, &ack.capabilities).await {
                Ok(()) => {
                    self.state.lock().await.peer_has_auth.insert(peer.clone());
                }
                Err(err) => failure = Some(reject_message(&err)),
            }
        }

        let session_ids: Vec<String> = ack
            .accepted_filters
            .iter()
            .cloned()
            .chain(ack.rejected_filters.iter().map(|r| r.id.clone()))
            .collect();
        let mut state = self.state.lock().await;
        for id in session_ids {
            let Some(session) = state.initiator.get_mut(&id) else {
                continue;
            };
            let Some(tx) = session.ack_tx.take() else {
                continue;
            };
            match &failure {
                // errors during ack processing cascade to every filter
                Some(message) => {
                    let _ = tx.send(Err(SyncError::Unauthorized(message.clone())));
                }
                None => {
                    let _ = tx.send(Ok(ack.clone()));
                }
            }
        }
        Ok(())
    }

    async fn on_codewords(&self, from: &Arc<dyn Transport>, cw: RibltCodewords) -> Result<(), SyncError> {
        let peer = from.peer_id().to_string();
        let key = (peer, cw.filter_id.clone());

        let mut state = self.state.lock().await;
        let Some(session) = state.responder.get_mut(&key) else {
            tracing::trace!(filter_id = %cw.filter_id, "codewords for unknown session");
            return Ok(());
        };

        if cw.start_index != session.expected_index {
            let round = session.round;
            state.responder.remove(&key);
            drop(state);
            return self
                .send(
                    from,
                    Payload::RibltStatus(RibltStatus {
                        filter_id: cw.filter_id,
                        round,
                        outcome: RibltOutcome::Failed {
                            reason: RIBLT_OUT_OF_ORDER.to_string(),
                            message: Some("codeword gap".to_string()),
                        },
                    }),
                )
                .await;
        }
        if session.expected_index + cw.codewords.len() as u64 > self.opts.max_codewords {
            let round = session.round;
            state.responder.remove(&key);
            drop(state);
            return self
                .send(
                    from,
                    Payload::RibltStatus(RibltStatus {
                        filter_id: cw.filter_id,
                        round,
                        outcome: RibltOutcome::Failed {
                            reason: RIBLT_MAX_CODEWORDS.to_string(),
                            message: None,
                        },
                    }),
                )
                .await;
        }

        for codeword in &cw.codewords {
            session.decoder.add_codeword(CodedSymbol::decode(codeword)?);
        }
        session.expected_index += cw.codewords.len() as u64;

        let decoded = session.decoder.try_decode();
        let round = session.round;
        if !decoded {
            return Ok(());
        }
        let Some(session) = state.responder.remove(&key) else {
            return Ok(());
        };
        drop(state);

        let sender_missing: Vec<OpRef> = session
            .decoder
            .remote_missing()
            .iter()
            .map(|s| OpRef::from_bytes(*s))
            .collect();
        let receiver_missing: Vec<OpRef> = session
            .decoder
            .local_missing()
            .iter()
            .map(|s| OpRef::from_bytes(*s))
            .collect();
        tracing::debug!(
            filter_id = cw.filter_id,
            codewords = session.decoder.codewords_received(),
            sender_missing = sender_missing.len(),
            receiver_missing = receiver_missing.len(),
            "riblt decoded"
        );
        self.send(
            from,
            Payload::RibltStatus(RibltStatus {
                filter_id: cw.filter_id.clone(),
                round,
                outcome: RibltOutcome::Decoded {
                    sender_missing: sender_missing.clone(),
                    receiver_missing,
                    codewords_received: session.decoder.codewords_received(),
                },
            }),
        )
        .await?;

        self.send_ops_batches(from, &cw.filter_id, &sender_missing).await
    }

    async fn on_status(&self, status: RibltStatus) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.initiator.get_mut(&status.filter_id) {
            if let Some(tx) = session.status_tx.take() {
                let _ = tx.send(Ok(status.outcome));
            }
        }
        Ok(())
    }

    async fn on_ops_batch(&self, from: &Arc<dyn Transport>, batch: OpsBatch) -> Result<(), SyncError> {
        let mut ops = Vec::with_capacity(batch.ops.len());
        for bytes in &batch.ops {
            match Operation::decode(bytes) {
                Ok(op) => ops.push(op),
                Err(err) => {
                    self.fail_batch(from, &batch.filter_id, &err.to_string()).await?;
                    return Ok(());
                }
            }
        }

        match self.ingest_ops(&ops, batch.auth.as_deref()).await {
            Ok(applied_any) => {
                if applied_any {
                    self.notify_local_update();
                }
                if let Err(err) = self.reprocess_pending_ops().await {
                    tracing::warn!(error = %err, "pending reprocess failed");
                }
            }
            Err(err) => {
                self.fail_batch(from, &batch.filter_id, &err.to_string()).await?;
                return Ok(());
            }
        }

        if batch.done {
            let mut state = self.state.lock().await;
            if let Some(mut session) = state.initiator.remove(&batch.filter_id) {
                if let Some(tx) = session.done_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
        }
        Ok(())
    }

    /// Report a bad batch to the peer and fail any local session for it.
    async fn fail_batch(
        &self,
        from: &Arc<dyn Transport>,
        filter_id: &str,
        message: &str,
    ) -> Result<(), SyncError> {
        tracing::warn!(filter_id, message, "rejecting ops batch");
        self.send(
            from,
            Payload::Error(ErrorMessage {
                code: ErrorCode::Unauthorized,
                message: message.to_string(),
                filter_id: Some(filter_id.to_string()),
                subscription_id: None,
            }),
        )
        .await?;
        let mut state = self.state.lock().await;
        if let Some(session) = state.initiator.remove(filter_id) {
            let message = message.to_string();
            session.fail(move || SyncError::Unauthorized(message.clone()));
        }
        Ok(())
    }

    /// Verify and route a batch of ops: allowed ops to the backend, pending
    /// ops to the sidecar. Returns whether anything was applied.
    async fn ingest_ops(&self, ops: &[Operation], auths: Option<&[OpAuth]>) -> Result<bool, SyncError> {
        if ops.is_empty() {
            return Ok(false);
        }
        let Some(auth) = &self.auth else {
            self.backend
                .apply_ops(&self.doc_id, ops)
                .await
                .map_err(SyncError::backend)?;
            return Ok(true);
        };

        let outcome = auth.verify_ops(ops, auths).await?;
        let mut allowed = Vec::new();
        let mut pending = Vec::new();
        for (i, disposition) in outcome.dispositions.iter().enumerate() {
            match disposition {
                OpDisposition::Allow => allowed.push(ops[i].clone()),
                OpDisposition::PendingContext { message } => {
                    let Some(auths) = auths else { continue };
                    pending.push(PendingOp::missing_context(
                        ops[i].clone(),
                        auths[i].clone(),
                        message.clone(),
                        now_ms(),
                    ));
                }
            }
        }
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "parking ops pending context");
            self.backend
                .store_pending_ops(&self.doc_id, &pending)
                .await
                .map_err(SyncError::backend)?;
        }
        let applied = !allowed.is_empty();
        if applied {
            self.backend
                .apply_ops(&self.doc_id, &allowed)
                .await
                .map_err(SyncError::backend)?;
        }
        Ok(applied)
    }

    // ── Pending reprocess ──────────────────────────────────────────────────

    /// Re-verify parked ops until no further progress. Ops whose verification
    /// now fails outright are dropped (context proved them illegitimate);
    /// newly allowed ops are applied exactly once.
    pub async fn reprocess_pending_ops(&self) -> Result<(), SyncError> {
        let _guard = self.reprocess_lock.lock().await;
        let Some(auth) = &self.auth else {
            return Ok(());
        };

        let mut applied_any = false;
        let mut rounds = 0;
        loop {
            rounds += 1;
            if rounds > REPROCESS_MAX_ROUNDS {
                return Err(SyncError::ReprocessDiverged);
            }
            let pending = self
                .backend
                .list_pending_ops(&self.doc_id)
                .await
                .map_err(SyncError::backend)?;
            if pending.is_empty() {
                break;
            }
            let mut progressed = false;
            for row in pending {
                let op_ref = row.op.op_ref(&self.doc_id);
                match auth
                    .verify_ops(std::slice::from_ref(&row.op), Some(std::slice::from_ref(&row.auth)))
                    .await
                {
                    Err(err) => {
                        tracing::debug!(op_ref = %op_ref.to_hex(), error = %err, "dropping now-invalid pending op");
                        self.backend
                            .delete_pending_ops(&self.doc_id, &[op_ref])
                            .await
                            .map_err(SyncError::backend)?;
                        progressed = true;
                    }
                    Ok(outcome) => match outcome.dispositions.first() {
                        Some(OpDisposition::Allow) => {
                            self.backend
                                .apply_ops(&self.doc_id, std::slice::from_ref(&row.op))
                                .await
                                .map_err(SyncError::backend)?;
                            self.backend
                                .delete_pending_ops(&self.doc_id, &[op_ref])
                                .await
                                .map_err(SyncError::backend)?;
                            progressed = true;
                            applied_any = true;
                        }
                        _ => {}
                    },
                }
            }
            if !progressed {
                break;
            }
        }
        if applied_any {
            self.notify_local_update();
        }
        Ok(())
    }

    // ── Subscriptions ──────────────────────────────────────────────────────

    async fn on_subscribe(&self, from: &Arc<dyn Transport>, sub: Subscribe) -> Result<(), SyncError> {
        let peer = from.peer_id().to_string();
        self.state
            .lock()
            .await
            .transports
            .insert(peer.clone(), from.clone());
        let filter = sub.filter.unwrap_or(Filter::All);

        if let Some(auth) = &self.auth {
            let has_auth = self.state.lock().await.peer_has_auth.contains(&peer);
            let authorized = if has_auth {
                auth.authorize_filter(&peer, &filter).await
            } else {
                Err(AuthError::Unauthorized("peer advertised no capability".into()))
            };
            if let Err(err) = authorized {
                return self
                    .send(
                        from,
                        Payload::Error(ErrorMessage {
                            code: ErrorCode::Unauthorized,
                            message: reject_message(&err),
                            filter_id: None,
                            subscription_id: Some(sub.subscription_id),
                        }),
                    )
                    .await;
            }
        }

        // history is the subscriber's sync_once's job; push only forwards
        // ops that arrive after this point
        let refs = self
            .backend
            .list_op_refs(&self.doc_id, &filter)
            .await
            .map_err(SyncError::backend)?;
        let current_lamport = self
            .backend
            .max_lamport(&self.doc_id)
            .await
            .map_err(SyncError::backend)?;
        self.state.lock().await.subs_in.insert(
            (peer.clone(), sub.subscription_id.clone()),
            InboundSubscription {
                filter,
                sent: refs.into_iter().collect(),
            },
        );
        tracing::debug!(peer = %peer, subscription_id = %sub.subscription_id, "subscription registered");
        self.send(
            from,
            Payload::SubscribeAck(SubscribeAck {
                subscription_id: sub.subscription_id,
                current_lamport,
            }),
        )
        .await
    }

    async fn on_subscribe_ack(&self, ack: SubscribeAck) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.sub_acks.remove(&ack.subscription_id) {
            let _ = tx.send(Ok(ack.current_lamport));
        }
        Ok(())
    }

    async fn on_unsubscribe(&self, from: &Arc<dyn Transport>, unsub: Unsubscribe) -> Result<(), SyncError> {
        let peer = from.peer_id().to_string();
        self.state
            .lock()
            .await
            .subs_in
            .remove(&(peer, unsub.subscription_id));
        Ok(())
    }

    async fn on_error(&self, err: ErrorMessage) -> Result<(), SyncError> {
        tracing::debug!(code = err.code.as_str(), message = %err.message, "peer error");
        let make = || match err.code {
            ErrorCode::Unauthorized => SyncError::Unauthorized(err.message.clone()),
            code => SyncError::Rejected {
                reason: code.as_str().to_string(),
                message: Some(err.message.clone()),
            },
        };
        let mut state = self.state.lock().await;
        if let Some(filter_id) = &err.filter_id {
            if let Some(session) = state.initiator.remove(filter_id) {
                session.fail(make);
            }
        } else if let Some(subscription_id) = &err.subscription_id {
            if let Some(tx) = state.sub_acks.remove(subscription_id) {
                let _ = tx.send(Err(make()));
            }
        } else {
            // no target: reject every outstanding initiator session
            for (_, session) in state.initiator.drain() {
                session.fail(&make);
            }
            for (_, tx) in state.sub_acks.drain() {
                let _ = tx.send(Err(make()));
            }
        }
        Ok(())
    }

    /// Subscribe to pushed updates from the peer on `transport`.
    ///
    /// Sends an initial Hello (no filters) so the responder records our
    /// capabilities, then Subscribe; optionally runs an immediate sync and a
    /// polling loop. The returned handle stops the loop and sends a
    /// best-effort Unsubscribe.
    pub async fn subscribe(
        self: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle, SyncError> {
        let peer = transport.peer_id().to_string();
        let subscription_id = random_id("s");
        self.state
            .lock()
            .await
            .transports
            .insert(peer.clone(), transport.clone());

        let capabilities = match &self.auth {
            Some(auth) => auth.hello_capabilities().await,
            None => Vec::new(),
        };
        let max_lamport = self
            .backend
            .max_lamport(&self.doc_id)
            .await
            .map_err(SyncError::backend)?;
        self.send(
            transport,
            Payload::Hello(Hello {
                capabilities,
                filters: Vec::new(),
                max_lamport,
            }),
        )
        .await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .sub_acks
            .insert(subscription_id.clone(), ack_tx);
        self.send(
            transport,
            Payload::Subscribe(Subscribe {
                subscription_id: subscription_id.clone(),
                filter: Some(opts.filter),
            }),
        )
        .await?;
        let current_lamport = ack_rx.await.map_err(|_| SyncError::SessionClosed)??;
        tracing::debug!(subscription_id = %subscription_id, current_lamport, "subscription live");

        if opts.immediate_sync {
            self.sync_once(transport, opts.filter).await?;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = if opts.interval_ms > 0 {
            let peer_arc = self.clone();
            let transport = transport.clone();
            let filter = opts.filter;
            let interval_ms = opts.interval_ms;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await; // immediate first tick already covered
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(err) = peer_arc.sync_once(&transport, filter).await {
                                tracing::warn!(error = %err, "interval sync failed");
                            }
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
            })
        } else {
            tokio::spawn(async move {
                let _ = stop_rx.changed().await;
            })
        };

        Ok(SubscriptionHandle {
            subscription_id,
            doc_id: self.doc_id.clone(),
            transport: transport.clone(),
            stop_tx,
            task: Some(task),
        })
    }

    // ── Push loop ──────────────────────────────────────────────────────────

    /// One pass over every inbound subscription: forward fresh ops, record
    /// both forwarded and filtered refs so filtered ops are not retried.
    async fn push_pass(&self) {
        let subscriptions: Vec<(String, String, Filter)> = {
            let state = self.state.lock().await;
            state
                .subs_in
                .iter()
                .map(|((peer, id), sub)| (peer.clone(), id.clone(), sub.filter))
                .collect()
        };

        for (peer, subscription_id, filter) in subscriptions {
            let transport = {
                let state = self.state.lock().await;
                state.transports.get(&peer).cloned()
            };
            let Some(transport) = transport else { continue };

            let refs = match self.backend.list_op_refs(&self.doc_id, &filter).await {
                Ok(refs) => refs,
                Err(err) => {
                    tracing::warn!(error = %err, "push pass: listing refs failed");
                    continue;
                }
            };
            let fresh: Vec<OpRef> = {
                let state = self.state.lock().await;
                let Some(sub) = state.subs_in.get(&(peer.clone(), subscription_id.clone())) else {
                    continue;
                };
                refs.into_iter().filter(|r| !sub.sent.contains(r)).collect()
            };
            if fresh.is_empty() {
                continue;
            }

            for chunk in fresh.chunks(self.opts.max_ops_per_batch) {
                let ops = match self.backend.get_ops(&self.doc_id, chunk).await {
                    Ok(ops) => ops,
                    Err(err) => {
                        tracing::warn!(error = %err, "push pass: fetching ops failed");
                        break;
                    }
                };
                let mask = match &self.auth {
                    Some(auth) if auth.peer_has_capabilities(&peer).await => {
                        match auth.filter_outgoing_ops(&peer, &ops).await {
                            Ok(mask) => mask,
                            Err(err) => {
                                tracing::warn!(error = %err, "push pass: outgoing filter failed");
                                break;
                            }
                        }
                    }
                    _ => vec![true; ops.len()],
                };
                let allowed: Vec<Operation> = ops
                    .iter()
                    .zip(&mask)
                    .filter(|(_, keep)| **keep)
                    .map(|(op, _)| op.clone())
                    .collect();

                if !allowed.is_empty() {
                    let auth_entries = match &self.auth {
                        Some(auth) => match auth.sign_ops(&allowed).await {
                            Ok(entries) => Some(entries),
                            Err(err) => {
                                tracing::warn!(error = %err, "push pass: signing failed");
                                break;
                            }
                        },
                        None => None,
                    };
                    let encoded = match allowed.iter().map(|op| op.encode()).collect::<Result<Vec<_>, _>>() {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            tracing::warn!(error = %err, "push pass: encoding failed");
                            break;
                        }
                    };
                    let batch = Payload::OpsBatch(OpsBatch {
                        filter_id: subscription_id.clone(),
                        ops: encoded,
                        auth: auth_entries,
                        done: false,
                    });
                    if let Err(err) = self.send(&transport, batch).await {
                        tracing::warn!(error = %err, "push pass: send failed");
                        break;
                    }
                }

                {
                    let mut state = self.state.lock().await;
                    if let Some(sub) = state.subs_in.get_mut(&(peer.clone(), subscription_id.clone())) {
                        sub.sent.extend(chunk.iter().copied());
                    }
                }
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Handle to an outbound subscription; stopping aborts the poll loop and
/// sends a best-effort Unsubscribe.
pub struct SubscriptionHandle {
    pub subscription_id: String,
    doc_id: DocId,
    transport: Arc<dyn Transport>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let _ = self
            .transport
            .send(SyncMessage::new(
                self.doc_id.as_str(),
                Payload::Unsubscribe(Unsubscribe {
                    subscription_id: self.subscription_id.clone(),
                }),
            ))
            .await;
    }
}
