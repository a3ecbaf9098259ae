//! Capability tokens: issuance, delegation, parsing, verification.
//!
//! A capability token is a COSE_Sign1 envelope over a CBOR claim set:
//!
//! - `aud` (3): the document id
//! - `exp`/`nbf` (4/5): optional validity window, seconds since epoch
//! - `cnf` (8): `{pub, kid}` — the subject public key and its derived key id
//! - `caps` (−1): non-empty array of `{res, actions}`
//!
//! Tokens are signed by an issuer key, or delegated: signed by the subject of
//! a proof token carried in the unprotected header. A delegated token must be
//! strictly no broader than its proof in actions, scope, and time window, and
//! the proof must hold the `grant` action. Chains root at an issuer, are
//! bounded at depth 8, and must not cycle.

use std::future::Future;
use std::pin::Pin;

use ciborium::value::Value;
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::cbor;
use crate::cose::{CoseSign1, DELEGATION_PROOF_HEADER};
use crate::error::AuthError;
use crate::ids::{DocId, KeyId, NodeId, ReplicaId, ROOT_NODE_ID, TokenId};
use crate::revocation::{RevocationQuery, RevocationStage};
use crate::scope::{ScopeDecision, TreeContext, evaluate_node};

const CLAIM_AUD: i64 = 3;
const CLAIM_EXP: i64 = 4;
const CLAIM_NBF: i64 = 5;
const CLAIM_CNF: i64 = 8;
const CLAIM_CAPS: i64 = -1;

/// Maximum number of tokens in a delegation chain, proof included.
pub const MAX_DELEGATION_DEPTH: usize = 8;

/// Actions a capability can grant on a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    ReadStructure,
    ReadPayload,
    WriteStructure,
    WritePayload,
    Delete,
    Tombstone,
    Grant,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ReadStructure => "read_structure",
            Action::ReadPayload => "read_payload",
            Action::WriteStructure => "write_structure",
            Action::WritePayload => "write_payload",
            Action::Delete => "delete",
            Action::Tombstone => "tombstone",
            Action::Grant => "grant",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AuthError> {
        Ok(match s {
            "read_structure" => Action::ReadStructure,
            "read_payload" => Action::ReadPayload,
            "write_structure" => Action::WriteStructure,
            "write_payload" => Action::WritePayload,
            "delete" => Action::Delete,
            "tombstone" => Action::Tombstone,
            "grant" => Action::Grant,
            other => return Err(AuthError::Malformed(format!("unknown action {other}"))),
        })
    }

    /// Does holding `self` satisfy a requirement for `required`?
    ///
    /// Any write-class action implies `read_structure`; `write_payload`
    /// additionally implies `read_payload`.
    pub fn covers(self, required: Action) -> bool {
        if self == required {
            return true;
        }
        match required {
            Action::ReadStructure => matches!(
                self,
                Action::WriteStructure | Action::WritePayload | Action::Delete | Action::Tombstone
            ),
            Action::ReadPayload => self == Action::WritePayload,
            _ => false,
        }
    }
}

/// Does any action in `held` cover `required`?
pub fn actions_cover(held: &[Action], required: Action) -> bool {
    held.iter().any(|a| a.covers(required))
}

/// The subtree a capability applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceScope {
    pub doc_id: DocId,
    pub root: NodeId,
    pub max_depth: Option<u32>,
    pub exclude: Vec<NodeId>,
}

impl ResourceScope {
    pub fn doc_wide(doc_id: DocId) -> Self {
        Self {
            doc_id,
            root: ROOT_NODE_ID,
            max_depth: None,
            exclude: Vec::new(),
        }
    }

    /// A scope covering the whole document with no carve-outs.
    pub fn is_doc_wide(&self) -> bool {
        self.root.is_root() && self.max_depth.is_none() && self.exclude.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub res: ResourceScope,
    pub actions: Vec<Action>,
}

/// Runtime view of a verified token.
#[derive(Debug, Clone)]
pub struct CapabilityGrant {
    pub token_id: TokenId,
    pub key_id: KeyId,
    pub public_key: ReplicaId,
    pub caps: Vec<Capability>,
    pub exp: Option<u64>,
    pub nbf: Option<u64>,
}

impl CapabilityGrant {
    pub fn verifying_key(&self) -> Result<VerifyingKey, AuthError> {
        VerifyingKey::from_bytes(self.public_key.as_bytes())
            .map_err(|_| AuthError::Malformed("subject key is not a valid Ed25519 point".into()))
    }

    /// Check the validity window against an injected `now`.
    pub fn check_window(&self, now: u64) -> Result<(), AuthError> {
        if let Some(nbf) = self.nbf {
            if now < nbf {
                return Err(AuthError::NotYetValid);
            }
        }
        if let Some(exp) = self.exp {
            if now >= exp {
                return Err(AuthError::Expired);
            }
        }
        Ok(())
    }
}

/// Everything `parse_and_verify` needs besides the token bytes.
pub struct VerifyCtx<'a> {
    pub issuers: &'a [VerifyingKey],
    pub doc_id: &'a DocId,
    pub now: u64,
    /// Needed to prove containment when a delegated scope uses a different
    /// root than its proof. Delegation checks are fail-closed without it.
    pub tree: Option<&'a dyn TreeContext>,
    pub revocation: Option<&'a dyn RevocationQuery>,
}

// ── Claim construction ─────────────────────────────────────────────────────

fn cap_to_value(cap: &Capability) -> Value {
    let mut res = vec![
        (cbor::text("doc_id"), cbor::text(cap.res.doc_id.as_str())),
        (cbor::text("root"), cbor::bytes(cap.res.root.as_bytes().to_vec())),
    ];
    if let Some(d) = cap.res.max_depth {
        res.push((cbor::text("max_depth"), cbor::u64_value(d as u64)));
    }
    if !cap.res.exclude.is_empty() {
        res.push((
            cbor::text("exclude"),
            Value::Array(
                cap.res
                    .exclude
                    .iter()
                    .map(|n| cbor::bytes(n.as_bytes().to_vec()))
                    .collect(),
            ),
        ));
    }
    Value::Map(vec![
        (cbor::text("res"), Value::Map(res)),
        (
            cbor::text("actions"),
            Value::Array(cap.actions.iter().map(|a| cbor::text(a.as_str())).collect()),
        ),
    ])
}

fn value_to_cap(value: &Value, aud: &DocId) -> Result<Capability, AuthError> {
    let entries = cbor::as_map(value).ok_or_else(|| AuthError::Malformed("cap is not a map".into()))?;
    let res = cbor::field(entries, "res")
        .and_then(cbor::as_map)
        .ok_or_else(|| AuthError::Malformed("cap missing res".into()))?;
    let actions = cbor::field(entries, "actions")
        .and_then(cbor::as_array)
        .ok_or_else(|| AuthError::Malformed("cap missing actions".into()))?;
    if actions.is_empty() {
        return Err(AuthError::Malformed("cap has no actions".into()));
    }
    let actions = actions
        .iter()
        .map(|a| {
            cbor::as_text(a)
                .ok_or_else(|| AuthError::Malformed("action is not a string".into()))
                .and_then(Action::parse)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let doc_id = cbor::field(res, "doc_id")
        .and_then(cbor::as_text)
        .ok_or_else(|| AuthError::Malformed("res missing doc_id".into()))?;
    if doc_id != aud.as_str() {
        return Err(AuthError::Malformed("cap doc_id does not match aud".into()));
    }
    let root = cbor::field(res, "root")
        .and_then(cbor::as_bytes)
        .ok_or_else(|| AuthError::Malformed("res missing root".into()))?;
    let root = NodeId::from_slice(root)?;
    let max_depth = match cbor::field(res, "max_depth") {
        Some(v) => Some(
            cbor::as_u64(v)
                .and_then(|d| u32::try_from(d).ok())
                .ok_or_else(|| AuthError::Malformed("bad max_depth".into()))?,
        ),
        None => None,
    };
    let exclude = match cbor::field(res, "exclude") {
        Some(v) => cbor::as_array(v)
            .ok_or_else(|| AuthError::Malformed("exclude is not an array".into()))?
            .iter()
            .map(|e| {
                cbor::as_bytes(e)
                    .ok_or_else(|| AuthError::Malformed("exclude entry is not bytes".into()))
                    .and_then(NodeId::from_slice)
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(Capability {
        res: ResourceScope {
            doc_id: aud.clone(),
            root,
            max_depth,
            exclude,
        },
        actions,
    })
}

fn build_claims(
    subject: &VerifyingKey,
    doc_id: &DocId,
    caps: &[Capability],
    exp: Option<u64>,
    nbf: Option<u64>,
) -> Result<Vec<u8>, AuthError> {
    let subject_bytes = subject.to_bytes();
    let kid = KeyId::from_public_key(&subject_bytes);
    let mut entries = vec![
        (cbor::i64_value(CLAIM_AUD), cbor::text(doc_id.as_str())),
        (
            cbor::i64_value(CLAIM_CNF),
            Value::Map(vec![
                (cbor::text("pub"), cbor::bytes(subject_bytes.to_vec())),
                (cbor::text("kid"), cbor::bytes(kid.as_bytes().to_vec())),
            ]),
        ),
        (
            cbor::i64_value(CLAIM_CAPS),
            Value::Array(caps.iter().map(cap_to_value).collect()),
        ),
    ];
    if let Some(exp) = exp {
        entries.push((cbor::i64_value(CLAIM_EXP), cbor::u64_value(exp)));
    }
    if let Some(nbf) = nbf {
        entries.push((cbor::i64_value(CLAIM_NBF), cbor::u64_value(nbf)));
    }
    cbor::to_canonical_bytes(&Value::Map(entries))
}

fn validate_issue_inputs(actions: &[Action], exp: Option<u64>, nbf: Option<u64>) -> Result<(), AuthError> {
    if actions.is_empty() {
        return Err(AuthError::Malformed("token must grant at least one action".into()));
    }
    if let (Some(nbf), Some(exp)) = (nbf, exp) {
        if nbf >= exp {
            return Err(AuthError::Malformed("nbf must be before exp".into()));
        }
    }
    Ok(())
}

/// Issue a capability token signed by an issuer key.
///
/// `root` defaults to the document root when unspecified.
pub fn issue_capability_token(
    issuer: &SigningKey,
    subject: &VerifyingKey,
    doc_id: &DocId,
    actions: &[Action],
    root: Option<NodeId>,
    max_depth: Option<u32>,
    exclude: &[NodeId],
    exp: Option<u64>,
    nbf: Option<u64>,
) -> Result<Vec<u8>, AuthError> {
    validate_issue_inputs(actions, exp, nbf)?;
    let cap = Capability {
        res: ResourceScope {
            doc_id: doc_id.clone(),
            root: root.unwrap_or(ROOT_NODE_ID),
            max_depth,
            exclude: exclude.to_vec(),
        },
        actions: actions.to_vec(),
    };
    let claims = build_claims(subject, doc_id, std::slice::from_ref(&cap), exp, nbf)?;
    CoseSign1::sign(issuer, claims, Vec::new())?.to_bytes()
}

/// Issue a delegated token: signed by the subject of `proof_token`, which is
/// embedded in the unprotected header for the verifier to chase.
pub fn issue_delegated_capability_token(
    delegator: &SigningKey,
    proof_token: &[u8],
    subject: &VerifyingKey,
    doc_id: &DocId,
    actions: &[Action],
    root: Option<NodeId>,
    max_depth: Option<u32>,
    exclude: &[NodeId],
    exp: Option<u64>,
    nbf: Option<u64>,
) -> Result<Vec<u8>, AuthError> {
    validate_issue_inputs(actions, exp, nbf)?;
    let cap = Capability {
        res: ResourceScope {
            doc_id: doc_id.clone(),
            root: root.unwrap_or(ROOT_NODE_ID),
            max_depth,
            exclude: exclude.to_vec(),
        },
        actions: actions.to_vec(),
    };
    let claims = build_claims(subject, doc_id, std::slice::from_ref(&cap), exp, nbf)?;
    let header = vec![(
        cbor::text(DELEGATION_PROOF_HEADER),
        Value::Array(vec![cbor::bytes(proof_token.to_vec())]),
    )];
    CoseSign1::sign(delegator, claims, header)?.to_bytes()
}

// ── Verification ───────────────────────────────────────────────────────────

fn decode_claims(token_id: TokenId, envelope: &CoseSign1, ctx: &VerifyCtx<'_>) -> Result<CapabilityGrant, AuthError> {
    let claims = cbor::from_slice(&envelope.payload)?;
    let entries = cbor::as_map(&claims).ok_or_else(|| AuthError::Malformed("claims are not a map".into()))?;

    let aud = cbor::claim(entries, CLAIM_AUD, "aud")
        .and_then(cbor::as_text)
        .ok_or_else(|| AuthError::Malformed("missing aud claim".into()))?;
    if aud != ctx.doc_id.as_str() {
        return Err(AuthError::AudienceMismatch {
            expected: ctx.doc_id.to_string(),
            actual: aud.to_string(),
        });
    }

    let exp = cbor::claim(entries, CLAIM_EXP, "exp").map(|v| {
        cbor::as_u64(v).ok_or_else(|| AuthError::Malformed("bad exp claim".into()))
    });
    let exp = exp.transpose()?;
    let nbf = cbor::claim(entries, CLAIM_NBF, "nbf").map(|v| {
        cbor::as_u64(v).ok_or_else(|| AuthError::Malformed("bad nbf claim".into()))
    });
    let nbf = nbf.transpose()?;

    let cnf = cbor::claim(entries, CLAIM_CNF, "cnf")
        .and_then(cbor::as_map)
        .ok_or_else(|| AuthError::Malformed("missing cnf claim".into()))?;
    let subject = cbor::field(cnf, "pub")
        .and_then(cbor::as_bytes)
        .ok_or_else(|| AuthError::Malformed("cnf missing pub".into()))?;
    let subject = ReplicaId::from_slice(subject)?;
    let kid = cbor::field(cnf, "kid")
        .and_then(cbor::as_bytes)
        .ok_or_else(|| AuthError::Malformed("cnf missing kid".into()))?;
    let key_id = subject.key_id();
    if kid != key_id.as_bytes() {
        return Err(AuthError::Malformed("cnf kid does not match pub".into()));
    }

    let caps = cbor::claim(entries, CLAIM_CAPS, "caps")
        .and_then(cbor::as_array)
        .ok_or_else(|| AuthError::Malformed("missing caps claim".into()))?;
    if caps.is_empty() {
        return Err(AuthError::Malformed("caps claim is empty".into()));
    }
    let caps = caps
        .iter()
        .map(|c| value_to_cap(c, ctx.doc_id))
        .collect::<Result<Vec<_>, _>>()?;

    let grant = CapabilityGrant {
        token_id,
        key_id,
        public_key: subject,
        caps,
        exp,
        nbf,
    };
    grant.check_window(ctx.now)?;
    Ok(grant)
}

async fn delegated_scope_within(
    delegated: &ResourceScope,
    proof: &ResourceScope,
    ctx: &VerifyCtx<'_>,
) -> Result<bool, AuthError> {
    if let Some(p) = proof.max_depth {
        match delegated.max_depth {
            Some(d) if d <= p => {}
            _ => return Ok(false),
        }
    }
    if !proof.exclude.iter().all(|e| delegated.exclude.contains(e)) {
        return Ok(false);
    }
    if delegated.root == proof.root {
        return Ok(true);
    }
    let Some(tree) = ctx.tree else {
        return Ok(false);
    };
    let decision = evaluate_node(tree, &delegated.doc_id, &delegated.root, proof).await?;
    Ok(decision == ScopeDecision::Allow)
}

async fn check_delegation_coverage(
    delegated: &CapabilityGrant,
    proof: &CapabilityGrant,
    ctx: &VerifyCtx<'_>,
) -> Result<(), AuthError> {
    if let Some(pe) = proof.exp {
        match delegated.exp {
            Some(de) if de <= pe => {}
            _ => return Err(AuthError::BadDelegation("time window widened beyond proof".into())),
        }
    }
    if let Some(pn) = proof.nbf {
        match delegated.nbf {
            Some(dn) if dn >= pn => {}
            _ => return Err(AuthError::BadDelegation("time window widened beyond proof".into())),
        }
    }
    for cap in &delegated.caps {
        let mut covered = false;
        for proof_cap in &proof.caps {
            if proof_cap.res.doc_id != cap.res.doc_id {
                continue;
            }
            if !proof_cap.actions.contains(&Action::Grant) {
                continue;
            }
            if !cap.actions.iter().all(|a| actions_cover(&proof_cap.actions, *a)) {
                continue;
            }
            if delegated_scope_within(&cap.res, &proof_cap.res, ctx).await? {
                covered = true;
                break;
            }
        }
        if !covered {
            return Err(AuthError::BadDelegation("cap not covered by proof".into()));
        }
    }
    Ok(())
}

fn verify_chain<'a>(
    token: &'a [u8],
    ctx: &'a VerifyCtx<'a>,
    seen: &'a mut Vec<TokenId>,
) -> Pin<Box<dyn Future<Output = Result<CapabilityGrant, AuthError>> + Send + 'a>> {
    Box::pin(async move {
        let token_id = TokenId::from_envelope(token);
        if seen.contains(&token_id) {
            return Err(AuthError::BadDelegation("delegation cycle".into()));
        }
        seen.push(token_id);
        if seen.len() > MAX_DELEGATION_DEPTH {
            return Err(AuthError::BadDelegation(format!(
                "delegation chain deeper than {MAX_DELEGATION_DEPTH}"
            )));
        }

        if let Some(revocation) = ctx.revocation {
            if revocation.is_revoked(&token_id, RevocationStage::Parse) {
                return Err(AuthError::TokenRevoked);
            }
        }

        let envelope = CoseSign1::from_bytes(token)?;

        for issuer in ctx.issuers {
            if envelope.verify(issuer).is_ok() {
                return decode_claims(token_id, &envelope, ctx);
            }
        }

        let proofs = envelope.delegation_proofs()?;
        let Some(proof_bytes) = proofs.first() else {
            return Err(AuthError::UnknownIssuer);
        };

        let proof_grant = verify_chain(proof_bytes, ctx, seen).await?;
        envelope.verify(&proof_grant.verifying_key()?)?;
        let grant = decode_claims(token_id, &envelope, ctx)?;
        check_delegation_coverage(&grant, &proof_grant, ctx).await?;
        Ok(grant)
    })
}

/// Parse and verify a token (possibly a delegation chain) against the
/// configured issuers, revocation state, and clock.
pub async fn parse_and_verify(token: &[u8], ctx: &VerifyCtx<'_>) -> Result<CapabilityGrant, AuthError> {
    let mut seen = Vec::new();
    verify_chain(token, ctx, &mut seen).await
}

// ── Description ────────────────────────────────────────────────────────────

/// Projection of a verified token into a display-friendly form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribedCapability {
    pub actions: Vec<String>,
    pub doc_id: String,
    pub root_node_id: String,
    pub max_depth: Option<u32>,
    pub exclude_node_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct TokenDescription {
    pub token_id: TokenId,
    pub subject_public_key: ReplicaId,
    pub caps: Vec<DescribedCapability>,
    pub exp: Option<u64>,
    pub nbf: Option<u64>,
}

/// Verify a token and project its caps for display.
pub async fn describe_capability_token(
    token: &[u8],
    ctx: &VerifyCtx<'_>,
) -> Result<TokenDescription, AuthError> {
    let grant = parse_and_verify(token, ctx).await?;
    let caps = grant
        .caps
        .iter()
        .map(|cap| DescribedCapability {
            actions: cap.actions.iter().map(|a| a.as_str().to_string()).collect(),
            doc_id: cap.res.doc_id.to_string(),
            root_node_id: cap.res.root.to_hex(),
            max_depth: cap.res.max_depth,
            exclude_node_ids: if cap.res.exclude.is_empty() {
                None
            } else {
                Some(cap.res.exclude.iter().map(|n| n.to_hex()).collect())
            },
        })
        .collect();
    Ok(TokenDescription {
        token_id: grant.token_id,
        subject_public_key: grant.public_key,
        caps,
        exp: grant.exp,
        nbf: grant.nbf,
    })
}
