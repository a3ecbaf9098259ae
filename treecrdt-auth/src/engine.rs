//! The stateful per-document auth engine behind a sync session.
//!
//! `SyncAuth` owns everything the sync layer needs to answer authorization
//! questions: the issuer set, the local replica keypair and its tokens, the
//! grants learned from peer hellos, the revocation table, and the in-memory
//! op-auth cache backed by the persistent sidecar.
//!
//! Hooks are async and may run concurrently per session; all state lives
//! behind one `tokio::sync::Mutex` and mutations are recorded before control
//! returns to the session (single-writer per document).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::AuthError;
use crate::identity::IdentityChain;
use crate::ids::{DocId, KeyId, OpRef, ReplicaId, TokenId};
use crate::op::{Filter, OpAuth, Operation};
use crate::revocation::{
    RevocationQuery, RevocationRecord, RevocationStage, RevocationTable, parse_and_verify_revocation,
};
use crate::scope::{ScopeDecision, TreeContext, caps_allows_node_access, caps_allows_op};
use crate::token::{Action, Capability, CapabilityGrant, VerifyCtx, parse_and_verify};

/// Capability advertisement entry names.
pub const CAP_TOKEN: &str = "auth.capability";
pub const CAP_REVOCATION: &str = "auth.revocation";
pub const CAP_IDENTITY_CHAIN: &str = "auth.identity_chain.v1";

/// A named capability advertisement carried in Hello/HelloAck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityEntry {
    pub name: String,
    pub value: String,
}

/// Persistent per-op auth rows, keyed by `(doc_id, op_ref)`.
#[async_trait]
pub trait OpAuthSidecar: Send + Sync {
    async fn put_op_auth(&self, doc_id: &DocId, entries: &[(OpRef, OpAuth)]) -> anyhow::Result<()>;
    async fn get_op_auth(&self, doc_id: &DocId, op_ref: &OpRef) -> anyhow::Result<Option<OpAuth>>;
}

/// Per-op outcome of `verify_ops`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpDisposition {
    Allow,
    /// Scope could not be decided with current tree context; the op should be
    /// parked in the pending sidecar and retried later.
    PendingContext { message: Option<String> },
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub dispositions: Vec<OpDisposition>,
}

impl VerifyOutcome {
    pub fn any_pending(&self) -> bool {
        self.dispositions
            .iter()
            .any(|d| matches!(d, OpDisposition::PendingContext { .. }))
    }
}

pub struct SyncAuthConfig {
    pub doc_id: DocId,
    pub issuers: Vec<VerifyingKey>,
    pub replica_key: SigningKey,
    /// Token envelopes this replica holds (from invites or auth grants).
    pub local_tokens: Vec<Vec<u8>>,
    /// Require every incoming op auth to name a known token id.
    pub require_proof_ref: bool,
    /// Accept batches without auth entries (trusted transports only).
    pub allow_unsigned: bool,
    pub tree: Option<Arc<dyn TreeContext>>,
    pub op_auth_store: Option<Arc<dyn OpAuthSidecar>>,
    /// Extra revocation source consulted alongside the in-memory table.
    pub revocation_hook: Option<Arc<dyn RevocationQuery>>,
    pub identity_chain: Option<IdentityChain>,
    pub clock: Arc<dyn Clock>,
}

impl SyncAuthConfig {
    pub fn new(doc_id: DocId, issuers: Vec<VerifyingKey>, replica_key: SigningKey) -> Self {
        Self {
            doc_id,
            issuers,
            replica_key,
            local_tokens: Vec::new(),
            require_proof_ref: false,
            allow_unsigned: false,
            tree: None,
            op_auth_store: None,
            revocation_hook: None,
            identity_chain: None,
            clock: Arc::new(SystemClock),
        }
    }
}

struct AuthState {
    /// All grants learned so far, indexed by the author key they confer on.
    grants: HashMap<KeyId, BTreeMap<TokenId, CapabilityGrant>>,
    /// Token ids advertised by each peer, in advertisement order.
    peer_tokens: HashMap<String, Vec<TokenId>>,
    /// Verified identity chains per peer.
    peer_identities: HashMap<String, ReplicaId>,
    /// In-memory op-auth cache (backed by the sidecar when configured).
    op_auth: HashMap<OpRef, OpAuth>,
    revocations: RevocationTable,
    /// Parsed grants for our own tokens, in configured order.
    local_grants: Vec<CapabilityGrant>,
}

struct ComposedRevocation<'a> {
    table: &'a RevocationTable,
    hook: Option<&'a dyn RevocationQuery>,
}

impl RevocationQuery for ComposedRevocation<'_> {
    fn is_revoked(&self, token_id: &TokenId, stage: RevocationStage<'_>) -> bool {
        self.table.is_revoked(token_id, stage)
            || self.hook.is_some_and(|h| h.is_revoked(token_id, stage))
    }
}

pub struct SyncAuth {
    doc_id: DocId,
    issuers: Vec<VerifyingKey>,
    replica_key: SigningKey,
    replica_id: ReplicaId,
    require_proof_ref: bool,
    allow_unsigned: bool,
    tree: Option<Arc<dyn TreeContext>>,
    op_auth_store: Option<Arc<dyn OpAuthSidecar>>,
    revocation_hook: Option<Arc<dyn RevocationQuery>>,
    identity_chain: Option<IdentityChain>,
    clock: Arc<dyn Clock>,
    local_token_bytes: Vec<Vec<u8>>,
    state: Mutex<AuthState>,
}

impl SyncAuth {
    /// Build the engine, parsing the configured local tokens. Tokens that do
    /// not verify are skipped with a warning — they may become valid later
    /// (nbf) or be superseded by an auth grant.
    pub async fn new(config: SyncAuthConfig) -> Arc<Self> {
        let replica_id = ReplicaId::from_bytes(config.replica_key.verifying_key().to_bytes());
        let auth = Self {
            doc_id: config.doc_id,
            issuers: config.issuers,
            replica_key: config.replica_key,
            replica_id,
            require_proof_ref: config.require_proof_ref,
            allow_unsigned: config.allow_unsigned,
            tree: config.tree,
            op_auth_store: config.op_auth_store,
            revocation_hook: config.revocation_hook,
            identity_chain: config.identity_chain,
            clock: config.clock,
            local_token_bytes: config.local_tokens.clone(),
            state: Mutex::new(AuthState {
                grants: HashMap::new(),
                peer_tokens: HashMap::new(),
                peer_identities: HashMap::new(),
                op_auth: HashMap::new(),
                revocations: RevocationTable::new(),
                local_grants: Vec::new(),
            }),
        };
        for token in &config.local_tokens {
            if let Err(err) = auth.register_local_token(token).await {
                tracing::warn!(error = %err, "skipping unusable local token");
            }
        }
        Arc::new(auth)
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn allow_unsigned(&self) -> bool {
        self.allow_unsigned
    }

    async fn register_local_token(&self, token: &[u8]) -> Result<TokenId, AuthError> {
        let mut state = self.state.lock().await;
        let grant = {
            let revocation = ComposedRevocation {
                table: &state.revocations,
                hook: self.revocation_hook.as_deref(),
            };
            let ctx = VerifyCtx {
                issuers: &self.issuers,
                doc_id: &self.doc_id,
                now: self.clock.now_secs(),
                tree: self.tree.as_deref(),
                revocation: Some(&revocation),
            };
            parse_and_verify(token, &ctx).await?
        };
        let token_id = grant.token_id;
        state
            .grants
            .entry(grant.key_id)
            .or_default()
            .insert(token_id, grant.clone());
        state.local_grants.retain(|g| g.token_id != token_id);
        state.local_grants.push(grant);
        Ok(token_id)
    }

    /// Add a token received after startup (auth grant / invite import).
    pub async fn add_local_token(&self, token: Vec<u8>) -> Result<TokenId, AuthError> {
        self.register_local_token(&token).await
    }

    /// Record a revocation received out of band.
    pub async fn insert_revocation(&self, record: RevocationRecord) -> bool {
        self.state.lock().await.revocations.insert(record)
    }

    // ── Hello handling ─────────────────────────────────────────────────────

    /// Capability entries to advertise in a Hello or HelloAck.
    pub async fn hello_capabilities(&self) -> Vec<CapabilityEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<CapabilityEntry> = self
            .local_token_bytes
            .iter()
            .map(|t| CapabilityEntry {
                name: CAP_TOKEN.to_string(),
                value: URL_SAFE_NO_PAD.encode(t),
            })
            .collect();
        for record in state.revocations.iter() {
            entries.push(CapabilityEntry {
                name: CAP_REVOCATION.to_string(),
                value: URL_SAFE_NO_PAD.encode(&record.envelope),
            });
        }
        if let Some(chain) = &self.identity_chain {
            if let Ok(value) = chain.encode() {
                entries.push(CapabilityEntry {
                    name: CAP_IDENTITY_CHAIN.to_string(),
                    value,
                });
            }
        }
        entries
    }

    /// Record the capabilities a peer advertised in its Hello or HelloAck.
    ///
    /// Revocation entries are applied first so a hello that advertises both a
    /// token and its revocation rejects the token. A revoked token fails the
    /// whole hello; the session surface reports `UNAUTHORIZED`.
    pub async fn on_peer_capabilities(
        &self,
        peer: &str,
        entries: &[CapabilityEntry],
    ) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;

        for entry in entries.iter().filter(|e| e.name == CAP_REVOCATION) {
            let bytes = match URL_SAFE_NO_PAD.decode(&entry.value) {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(peer, error = %err, "undecodable revocation advertisement");
                    continue;
                }
            };
            match parse_and_verify_revocation(&bytes, &self.issuers, &self.doc_id) {
                Ok(record) => {
                    state.revocations.insert(record);
                }
                Err(err) => {
                    tracing::warn!(peer, error = %err, "invalid revocation advertisement");
                }
            }
        }

        for entry in entries.iter().filter(|e| e.name == CAP_TOKEN) {
            let bytes = URL_SAFE_NO_PAD
                .decode(&entry.value)
                .map_err(|e| AuthError::Malformed(format!("bad capability encoding: {e}")))?;
            let grant = {
                let revocation = ComposedRevocation {
                    table: &state.revocations,
                    hook: self.revocation_hook.as_deref(),
                };
                let ctx = VerifyCtx {
                    issuers: &self.issuers,
                    doc_id: &self.doc_id,
                    now: self.clock.now_secs(),
                    tree: self.tree.as_deref(),
                    revocation: Some(&revocation),
                };
                match parse_and_verify(&bytes, &ctx).await {
                    Ok(grant) => grant,
                    Err(AuthError::TokenRevoked) => return Err(AuthError::TokenRevoked),
                    Err(err) => {
                        tracing::warn!(peer, error = %err, "skipping invalid advertised token");
                        continue;
                    }
                }
            };
            tracing::debug!(
                peer,
                token_id = %grant.token_id.to_hex(),
                key_id = %grant.key_id.to_hex(),
                "recorded peer capability"
            );
            let token_id = grant.token_id;
            state.grants.entry(grant.key_id).or_default().insert(token_id, grant);
            let advertised = state.peer_tokens.entry(peer.to_string()).or_default();
            if !advertised.contains(&token_id) {
                advertised.push(token_id);
            }
        }

        for entry in entries.iter().filter(|e| e.name == CAP_IDENTITY_CHAIN) {
            match IdentityChain::decode(&entry.value).and_then(|c| c.verify()) {
                Ok(replica) => {
                    state.peer_identities.insert(peer.to_string(), replica);
                }
                Err(err) => {
                    tracing::warn!(peer, error = %err, "invalid identity chain advertisement");
                }
            }
        }

        Ok(())
    }

    /// Did this peer advertise any capability token?
    pub async fn peer_has_capabilities(&self, peer: &str) -> bool {
        let state = self.state.lock().await;
        state.peer_tokens.get(peer).is_some_and(|t| !t.is_empty())
    }

    /// The replica identity a peer proved via its identity chain, if any.
    pub async fn peer_identity(&self, peer: &str) -> Option<ReplicaId> {
        self.state.lock().await.peer_identities.get(peer).copied()
    }

    fn peer_caps<'a>(&self, state: &'a AuthState, peer: &str, now: u64) -> Vec<&'a Capability> {
        let mut caps = Vec::new();
        if let Some(token_ids) = state.peer_tokens.get(peer) {
            for token_id in token_ids {
                for grants in state.grants.values() {
                    if let Some(grant) = grants.get(token_id) {
                        if grant.check_window(now).is_ok() {
                            caps.extend(grant.caps.iter());
                        }
                    }
                }
            }
        }
        caps
    }

    // ── Filter authorization ───────────────────────────────────────────────

    /// May this peer read the op slice selected by `filter`?
    pub async fn authorize_filter(&self, peer: &str, filter: &Filter) -> Result<(), AuthError> {
        let now = self.clock.now_secs();
        let state = self.state.lock().await;
        let caps = self.peer_caps(&state, peer, now);
        match filter {
            Filter::All => {
                let doc_wide = caps.iter().any(|cap| {
                    cap.res.is_doc_wide()
                        && cap.actions.iter().any(|a| a.covers(Action::ReadStructure))
                });
                if doc_wide {
                    Ok(())
                } else {
                    Err(AuthError::Unauthorized("capability does not allow filter".into()))
                }
            }
            Filter::Children { parent } => {
                match caps_allows_node_access(
                    self.tree.as_deref(),
                    &self.doc_id,
                    &caps,
                    parent,
                    &[Action::ReadStructure],
                )
                .await?
                {
                    ScopeDecision::Allow => Ok(()),
                    ScopeDecision::Deny => {
                        Err(AuthError::Unauthorized("capability does not allow filter".into()))
                    }
                    ScopeDecision::Unknown => Err(AuthError::MissingContext("filter".into())),
                }
            }
        }
    }

    /// Which of `ops` is this peer allowed to see? Fail-closed: unknown scope
    /// means the op is withheld.
    pub async fn filter_outgoing_ops(
        &self,
        peer: &str,
        ops: &[Operation],
    ) -> Result<Vec<bool>, AuthError> {
        let now = self.clock.now_secs();
        let state = self.state.lock().await;
        let caps = self.peer_caps(&state, peer, now);
        let doc_wide = caps.iter().any(|cap| {
            cap.res.is_doc_wide() && cap.actions.iter().any(|a| a.covers(Action::ReadStructure))
        });
        if doc_wide {
            return Ok(vec![true; ops.len()]);
        }
        let mut mask = Vec::with_capacity(ops.len());
        for op in ops {
            let decision = caps_allows_node_access(
                self.tree.as_deref(),
                &self.doc_id,
                &caps,
                &op.target_node(),
                &[Action::ReadStructure],
            )
            .await?;
            mask.push(decision == ScopeDecision::Allow);
        }
        Ok(mask)
    }

    // ── Signing ────────────────────────────────────────────────────────────

    /// Produce auth entries for a batch of ops, in order.
    ///
    /// Ops authored by this replica are signed fresh, choosing the best-fit
    /// local token as proof (`allow` beats `unknown`; `deny` is skipped).
    /// Relayed ops reuse their original auth from the cache or the sidecar.
    pub async fn sign_ops(&self, ops: &[Operation]) -> Result<Vec<OpAuth>, AuthError> {
        let mut out = Vec::with_capacity(ops.len());
        let mut persisted: Vec<(OpRef, OpAuth)> = Vec::new();
        let mut state = self.state.lock().await;

        for op in ops {
            let op_ref = op.op_ref(&self.doc_id);
            if op.replica() != self.replica_id {
                if let Some(auth) = state.op_auth.get(&op_ref) {
                    out.push(auth.clone());
                    continue;
                }
                let stored = match &self.op_auth_store {
                    Some(store) => store
                        .get_op_auth(&self.doc_id, &op_ref)
                        .await
                        .map_err(AuthError::backend)?,
                    None => None,
                };
                match stored {
                    Some(auth) => {
                        state.op_auth.insert(op_ref, auth.clone());
                        out.push(auth);
                    }
                    None => return Err(AuthError::CannotForward),
                }
                continue;
            }

            let proof_ref = {
                let now = self.clock.now_secs();
                let mut chosen: Option<TokenId> = None;
                let mut fallback: Option<TokenId> = None;
                for grant in &state.local_grants {
                    if grant.check_window(now).is_err() {
                        continue;
                    }
                    let caps: Vec<&Capability> = grant.caps.iter().collect();
                    match caps_allows_op(self.tree.as_deref(), &self.doc_id, &caps, op).await? {
                        ScopeDecision::Allow => {
                            chosen = Some(grant.token_id);
                            break;
                        }
                        ScopeDecision::Unknown => {
                            if fallback.is_none() {
                                fallback = Some(grant.token_id);
                            }
                        }
                        ScopeDecision::Deny => {}
                    }
                }
                match chosen.or(fallback) {
                    Some(token_id) => Some(token_id),
                    None if state.local_grants.is_empty() && self.allow_unsigned => None,
                    None => {
                        return Err(AuthError::Unauthorized(
                            "no local capability allows op".into(),
                        ));
                    }
                }
            };

            let sig = self.replica_key.sign(&op.sign_input(&self.doc_id)).to_bytes();
            let auth = OpAuth { sig, proof_ref };
            state.op_auth.insert(op_ref, auth.clone());
            persisted.push((op_ref, auth.clone()));
            out.push(auth);
        }
        drop(state);

        if let Some(store) = &self.op_auth_store {
            if !persisted.is_empty() {
                store
                    .put_op_auth(&self.doc_id, &persisted)
                    .await
                    .map_err(AuthError::backend)?;
            }
        }
        Ok(out)
    }

    // ── Verification ───────────────────────────────────────────────────────

    /// Verify a batch of incoming ops against the recorded grants.
    ///
    /// Fatal problems (bad signature, unknown author, revoked/denied
    /// capability) fail the whole batch. Scope that cannot be decided yet
    /// yields a `pending_context` disposition instead.
    pub async fn verify_ops(
        &self,
        ops: &[Operation],
        auths: Option<&[OpAuth]>,
    ) -> Result<VerifyOutcome, AuthError> {
        let Some(auths) = auths else {
            if self.allow_unsigned {
                return Ok(VerifyOutcome {
                    dispositions: vec![OpDisposition::Allow; ops.len()],
                });
            }
            return Err(AuthError::UnsignedOp);
        };
        if auths.len() != ops.len() {
            return Err(AuthError::Malformed(format!(
                "auth length {} does not match ops length {}",
                auths.len(),
                ops.len()
            )));
        }

        let now = self.clock.now_secs();
        let mut outcome = VerifyOutcome::default();
        let mut persisted: Vec<(OpRef, OpAuth)> = Vec::new();
        let mut state = self.state.lock().await;

        for (op, auth) in ops.iter().zip(auths) {
            let key_id = op.replica().key_id();
            let candidates: Vec<CapabilityGrant> = state
                .grants
                .get(&key_id)
                .map(|g| g.values().cloned().collect())
                .unwrap_or_default();
            if candidates.is_empty() {
                return Err(AuthError::Unauthorized("unknown author key".into()));
            }

            // An explicit proof_ref that matches a known token is exclusive:
            // the op stands or falls with that token.
            let (ordered, exclusive) = match auth.proof_ref {
                Some(proof_ref) => match candidates.iter().find(|g| g.token_id == proof_ref) {
                    Some(grant) => (vec![grant.clone()], true),
                    None if self.require_proof_ref => {
                        return Err(AuthError::ProofRefMismatch(
                            "proof_ref does not match a known token".into(),
                        ));
                    }
                    None => (candidates, false),
                },
                None if self.require_proof_ref => {
                    return Err(AuthError::ProofRefMismatch("op auth missing proof_ref".into()));
                }
                None => (candidates, false),
            };

            let mut pending = false;
            let mut allowed = false;
            let mut last_err: Option<AuthError> = None;
            for grant in &ordered {
                let revoked = {
                    let revocation = ComposedRevocation {
                        table: &state.revocations,
                        hook: self.revocation_hook.as_deref(),
                    };
                    revocation.is_revoked(&grant.token_id, RevocationStage::Runtime { op })
                };
                if revoked {
                    if exclusive {
                        return Err(AuthError::TokenRevoked);
                    }
                    last_err = Some(AuthError::TokenRevoked);
                    continue;
                }
                if let Err(err) = grant.check_window(now) {
                    if exclusive {
                        return Err(err);
                    }
                    last_err = Some(err);
                    continue;
                }
                if grant.public_key != op.replica() {
                    let err = AuthError::Unauthorized("grant subject does not match author".into());
                    if exclusive {
                        return Err(err);
                    }
                    last_err = Some(err);
                    continue;
                }
                let caps: Vec<&Capability> = grant.caps.iter().collect();
                match caps_allows_op(self.tree.as_deref(), &self.doc_id, &caps, op).await? {
                    ScopeDecision::Allow => {
                        allowed = true;
                        break;
                    }
                    ScopeDecision::Unknown => pending = true,
                    ScopeDecision::Deny => {
                        let err = AuthError::Unauthorized("capability does not allow op".into());
                        if exclusive {
                            return Err(err);
                        }
                        last_err = Some(err);
                    }
                }
            }

            if !allowed && !pending {
                return Err(last_err
                    .unwrap_or_else(|| AuthError::Unauthorized("capability does not allow op".into())));
            }

            let author = VerifyingKey::from_bytes(op.replica().as_bytes())
                .map_err(|_| AuthError::Malformed("author key is not a valid Ed25519 point".into()))?;
            author
                .verify(&op.sign_input(&self.doc_id), &Signature::from_bytes(&auth.sig))
                .map_err(|_| AuthError::InvalidSignature)?;

            let op_ref = op.op_ref(&self.doc_id);
            state.op_auth.insert(op_ref, auth.clone());
            persisted.push((op_ref, auth.clone()));

            outcome.dispositions.push(if allowed {
                OpDisposition::Allow
            } else {
                tracing::debug!(op_ref = %op_ref.to_hex(), "op pending: missing subtree context");
                OpDisposition::PendingContext {
                    message: Some("missing subtree context to authorize op".into()),
                }
            });
        }
        drop(state);

        if let Some(store) = &self.op_auth_store {
            if !persisted.is_empty() {
                store
                    .put_op_auth(&self.doc_id, &persisted)
                    .await
                    .map_err(AuthError::backend)?;
            }
        }
        Ok(outcome)
    }

    /// Cached auth for an op, if any (memory first, then sidecar).
    pub async fn op_auth(&self, op_ref: &OpRef) -> Result<Option<OpAuth>, AuthError> {
        if let Some(auth) = self.state.lock().await.op_auth.get(op_ref) {
            return Ok(Some(auth.clone()));
        }
        match &self.op_auth_store {
            Some(store) => store
                .get_op_auth(&self.doc_id, op_ref)
                .await
                .map_err(AuthError::backend),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::{NodeId, ROOT_NODE_ID};
    use crate::op::{OpId, OpKind, OpMeta};
    use crate::revocation::{RevocationMode, issue_revocation_record};
    use crate::scope::ParentLink;
    use crate::token::issue_capability_token;
    use rand::rngs::OsRng;
    use std::collections::HashMap as StdHashMap;

    struct MapTree(StdHashMap<NodeId, NodeId>);

    #[async_trait]
    impl TreeContext for MapTree {
        async fn parent(&self, _doc: &DocId, node: &NodeId) -> anyhow::Result<ParentLink> {
            if node.is_root() {
                return Ok(ParentLink::Root);
            }
            Ok(match self.0.get(node) {
                Some(p) => ParentLink::Parent(*p),
                None => ParentLink::Unknown,
            })
        }
    }

    fn doc() -> DocId {
        DocId::new("doc-engine").unwrap()
    }

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 16])
    }

    fn insert_op(replica: &SigningKey, counter: u64, parent: NodeId, target: u8) -> Operation {
        Operation {
            meta: OpMeta {
                id: OpId {
                    replica: ReplicaId::from_bytes(replica.verifying_key().to_bytes()),
                    counter,
                },
                lamport: counter,
            },
            kind: OpKind::Insert {
                parent,
                node: node(target),
                order_key: vec![0, counter as u8],
                payload: None,
            },
        }
    }

    fn delete_op(replica: &SigningKey, counter: u64, target: u8) -> Operation {
        Operation {
            meta: OpMeta {
                id: OpId {
                    replica: ReplicaId::from_bytes(replica.verifying_key().to_bytes()),
                    counter,
                },
                lamport: counter,
            },
            kind: OpKind::Delete { node: node(target) },
        }
    }

    async fn engine_pair(
        issuer: &SigningKey,
        writer_actions: &[Action],
    ) -> (Arc<SyncAuth>, Arc<SyncAuth>, SigningKey) {
        let writer = SigningKey::generate(&mut OsRng);
        let verifier_key = SigningKey::generate(&mut OsRng);
        let token = issue_capability_token(
            issuer,
            &writer.verifying_key(),
            &doc(),
            writer_actions,
            None,
            None,
            &[],
            None,
            None,
        )
        .unwrap();

        let mut writer_cfg = SyncAuthConfig::new(
            doc(),
            vec![issuer.verifying_key()],
            writer.clone(),
        );
        writer_cfg.local_tokens = vec![token];
        writer_cfg.clock = ManualClock::at(100);
        let writer_auth = SyncAuth::new(writer_cfg).await;

        let mut verifier_cfg =
            SyncAuthConfig::new(doc(), vec![issuer.verifying_key()], verifier_key);
        verifier_cfg.clock = ManualClock::at(100);
        let verifier_auth = SyncAuth::new(verifier_cfg).await;

        // hello: writer advertises, verifier records
        let entries = writer_auth.hello_capabilities().await;
        verifier_auth.on_peer_capabilities("writer", &entries).await.unwrap();

        (writer_auth, verifier_auth, writer)
    }

    #[tokio::test]
    async fn sign_then_verify_allows() {
        let issuer = SigningKey::generate(&mut OsRng);
        let (writer_auth, verifier_auth, writer) =
            engine_pair(&issuer, &[Action::WriteStructure]).await;

        let op = insert_op(&writer, 1, ROOT_NODE_ID, 1);
        let auths = writer_auth.sign_ops(std::slice::from_ref(&op)).await.unwrap();
        assert!(auths[0].proof_ref.is_some());

        let outcome = verifier_auth
            .verify_ops(std::slice::from_ref(&op), Some(&auths))
            .await
            .unwrap();
        assert_eq!(outcome.dispositions, vec![OpDisposition::Allow]);
        assert!(!outcome.any_pending());
    }

    #[tokio::test]
    async fn multi_token_selection_and_proof_ref_swap() {
        let issuer = SigningKey::generate(&mut OsRng);
        let writer = SigningKey::generate(&mut OsRng);
        let d = doc();

        let token_s = issue_capability_token(
            &issuer,
            &writer.verifying_key(),
            &d,
            &[Action::WriteStructure],
            None,
            None,
            &[],
            None,
            None,
        )
        .unwrap();
        let token_d = issue_capability_token(
            &issuer,
            &writer.verifying_key(),
            &d,
            &[Action::Delete],
            None,
            None,
            &[],
            None,
            None,
        )
        .unwrap();
        let id_s = TokenId::from_envelope(&token_s);
        let id_d = TokenId::from_envelope(&token_d);

        let mut cfg = SyncAuthConfig::new(d.clone(), vec![issuer.verifying_key()], writer.clone());
        cfg.local_tokens = vec![token_s.clone(), token_d.clone()];
        cfg.clock = ManualClock::at(0);
        let writer_auth = SyncAuth::new(cfg).await;

        let mut vcfg = SyncAuthConfig::new(d, vec![issuer.verifying_key()], SigningKey::generate(&mut OsRng));
        vcfg.clock = ManualClock::at(0);
        let verifier = SyncAuth::new(vcfg).await;
        verifier
            .on_peer_capabilities("writer", &writer_auth.hello_capabilities().await)
            .await
            .unwrap();

        let ins = insert_op(&writer, 1, ROOT_NODE_ID, 1);
        let del = delete_op(&writer, 2, 1);
        let auths = writer_auth.sign_ops(&[ins.clone(), del.clone()]).await.unwrap();
        assert_eq!(auths[0].proof_ref, Some(id_s));
        assert_eq!(auths[1].proof_ref, Some(id_d));

        verifier.verify_ops(&[ins.clone(), del], Some(&auths)).await.unwrap();

        // swapping the insert's proof to the delete-only token must fail hard
        let swapped = OpAuth {
            sig: auths[0].sig,
            proof_ref: Some(id_d),
        };
        let err = verifier
            .verify_ops(std::slice::from_ref(&ins), Some(std::slice::from_ref(&swapped)))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized(msg) if msg.contains("does not allow op")));
    }

    #[tokio::test]
    async fn unknown_author_fails() {
        let issuer = SigningKey::generate(&mut OsRng);
        let (_, verifier_auth, _) = engine_pair(&issuer, &[Action::WriteStructure]).await;

        let stranger = SigningKey::generate(&mut OsRng);
        let op = insert_op(&stranger, 1, ROOT_NODE_ID, 1);
        let auth = OpAuth {
            sig: stranger.sign(&op.sign_input(&doc())).to_bytes(),
            proof_ref: None,
        };
        assert!(matches!(
            verifier_auth.verify_ops(&[op], Some(&[auth])).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn bad_signature_fails() {
        let issuer = SigningKey::generate(&mut OsRng);
        let (writer_auth, verifier_auth, writer) =
            engine_pair(&issuer, &[Action::WriteStructure]).await;

        let op = insert_op(&writer, 1, ROOT_NODE_ID, 1);
        let mut auths = writer_auth.sign_ops(std::slice::from_ref(&op)).await.unwrap();
        auths[0].sig[0] ^= 1;
        assert!(matches!(
            verifier_auth.verify_ops(&[op], Some(&auths)).await,
            Err(AuthError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn write_cutover_splits_history() {
        let issuer = SigningKey::generate(&mut OsRng);
        let (writer_auth, verifier_auth, writer) =
            engine_pair(&issuer, &[Action::WriteStructure]).await;

        let op1 = insert_op(&writer, 1, ROOT_NODE_ID, 1);
        let op2 = insert_op(&writer, 2, ROOT_NODE_ID, 2);
        let auths = writer_auth.sign_ops(&[op1.clone(), op2.clone()]).await.unwrap();
        let token_id = auths[0].proof_ref.unwrap();

        let record_bytes = issue_revocation_record(
            &issuer,
            &doc(),
            &token_id,
            RevocationMode::WriteCutover,
            1,
            None,
            Some(2),
            Some(ReplicaId::from_bytes(writer.verifying_key().to_bytes())),
        )
        .unwrap();
        let record =
            parse_and_verify_revocation(&record_bytes, &[issuer.verifying_key()], &doc()).unwrap();
        verifier_auth.insert_revocation(record).await;

        // counter=1 stays valid
        verifier_auth
            .verify_ops(std::slice::from_ref(&op1), Some(&auths[..1]))
            .await
            .unwrap();
        // counter=2 is cut over
        assert!(matches!(
            verifier_auth
                .verify_ops(std::slice::from_ref(&op2), Some(&auths[1..]))
                .await,
            Err(AuthError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn pending_context_when_tree_is_incomplete() {
        let issuer = SigningKey::generate(&mut OsRng);
        let writer = SigningKey::generate(&mut OsRng);
        let d = doc();
        // scoped to a subtree the verifier has no context for yet
        let token = issue_capability_token(
            &issuer,
            &writer.verifying_key(),
            &d,
            &[Action::WriteStructure],
            Some(node(1)),
            None,
            &[],
            None,
            None,
        )
        .unwrap();

        let mut wcfg = SyncAuthConfig::new(d.clone(), vec![issuer.verifying_key()], writer.clone());
        wcfg.local_tokens = vec![token];
        wcfg.clock = ManualClock::at(0);
        let writer_auth = SyncAuth::new(wcfg).await;

        let mut vcfg = SyncAuthConfig::new(d, vec![issuer.verifying_key()], SigningKey::generate(&mut OsRng));
        vcfg.clock = ManualClock::at(0);
        vcfg.tree = Some(Arc::new(MapTree(StdHashMap::new())));
        let verifier = SyncAuth::new(vcfg).await;
        verifier
            .on_peer_capabilities("writer", &writer_auth.hello_capabilities().await)
            .await
            .unwrap();

        let op = insert_op(&writer, 1, node(2), 3);
        let auths = writer_auth.sign_ops(std::slice::from_ref(&op)).await.unwrap();
        let outcome = verifier.verify_ops(&[op], Some(&auths)).await.unwrap();
        assert!(outcome.any_pending());
    }

    #[tokio::test]
    async fn unsigned_batches_honor_allow_unsigned() {
        let issuer = SigningKey::generate(&mut OsRng);
        let writer = SigningKey::generate(&mut OsRng);
        let op = insert_op(&writer, 1, ROOT_NODE_ID, 1);

        let mut strict = SyncAuthConfig::new(doc(), vec![issuer.verifying_key()], SigningKey::generate(&mut OsRng));
        strict.clock = ManualClock::at(0);
        let strict = SyncAuth::new(strict).await;
        assert!(matches!(
            strict.verify_ops(std::slice::from_ref(&op), None).await,
            Err(AuthError::UnsignedOp)
        ));

        let mut lax = SyncAuthConfig::new(doc(), vec![issuer.verifying_key()], SigningKey::generate(&mut OsRng));
        lax.allow_unsigned = true;
        lax.clock = ManualClock::at(0);
        let lax = SyncAuth::new(lax).await;
        let outcome = lax.verify_ops(&[op], None).await.unwrap();
        assert_eq!(outcome.dispositions, vec![OpDisposition::Allow]);
    }

    #[tokio::test]
    async fn cannot_forward_without_recorded_auth() {
        let issuer = SigningKey::generate(&mut OsRng);
        let (writer_auth, _, _) = engine_pair(&issuer, &[Action::WriteStructure]).await;

        let other = SigningKey::generate(&mut OsRng);
        let foreign = insert_op(&other, 1, ROOT_NODE_ID, 1);
        assert!(matches!(
            writer_auth.sign_ops(&[foreign]).await,
            Err(AuthError::CannotForward)
        ));
    }

    #[tokio::test]
    async fn authorize_filter_scope() {
        let issuer = SigningKey::generate(&mut OsRng);
        let writer = SigningKey::generate(&mut OsRng);
        let d = doc();
        let scoped = issue_capability_token(
            &issuer,
            &writer.verifying_key(),
            &d,
            &[Action::ReadStructure],
            Some(node(1)),
            None,
            &[],
            None,
            None,
        )
        .unwrap();

        let mut wcfg = SyncAuthConfig::new(d.clone(), vec![issuer.verifying_key()], writer);
        wcfg.local_tokens = vec![scoped];
        wcfg.clock = ManualClock::at(0);
        let writer_auth = SyncAuth::new(wcfg).await;

        let mut vcfg = SyncAuthConfig::new(d, vec![issuer.verifying_key()], SigningKey::generate(&mut OsRng));
        vcfg.clock = ManualClock::at(0);
        let mut parents = StdHashMap::new();
        parents.insert(node(1), ROOT_NODE_ID);
        vcfg.tree = Some(Arc::new(MapTree(parents)));
        let verifier = SyncAuth::new(vcfg).await;
        verifier
            .on_peer_capabilities("peer", &writer_auth.hello_capabilities().await)
            .await
            .unwrap();

        // doc-wide filter is not covered by a subtree token
        assert!(matches!(
            verifier.authorize_filter("peer", &Filter::All).await,
            Err(AuthError::Unauthorized(_))
        ));
        // the scoped subtree is
        verifier
            .authorize_filter("peer", &Filter::Children { parent: node(1) })
            .await
            .unwrap();
    }
}
