//! Device keystore: AEAD-sealed per-document key blobs.
//!
//! A single 32-byte wrap key per installation protects every local secret.
//! Each blob is AES-256-GCM with a fresh 12-byte nonce; the AAD binds the
//! blob's purpose tag and document id, so a blob copied between documents (or
//! purposes) fails to open. Blobs are stored as `sealv1:` ‖ nonce ‖
//! ciphertext; anything without the marker is a legacy plaintext blob and is
//! re-sealed once on first load.
//!
//! Initialization of freshly generated keys is guarded by a TTL'd lock row in
//! the secret store so two concurrent processes do not clobber each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use ciborium::value::Value;
use ed25519_dalek::SigningKey;

use crate::cbor;
use crate::clock::Clock;
use crate::error::AuthError;
use crate::ids::DocId;

const SEAL_MARKER: &[u8] = b"sealv1:";
const NONCE_LEN: usize = 12;

const LOCK_TTL_MS: u64 = 10_000;
const LOCK_RETRY: Duration = Duration::from_millis(100);

pub const PURPOSE_ISSUER_KEY: &str = "issuer-key-v1";
pub const PURPOSE_REPLICA_IDENTITY: &str = "replica-identity-v1";
pub const PURPOSE_PAYLOAD_KEY: &str = "payload-key-v1";
pub const PURPOSE_IDENTITY_CHAIN: &str = "identity-chain-v1";

/// Raw blob storage, keyed by string. The SQLite backend provides the
/// persistent implementation.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// In-memory secret store for tests and ephemeral replicas.
#[derive(Default)]
pub struct MemorySecretStore(Mutex<HashMap<String, Vec<u8>>>);

impl MemorySecretStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.0.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.0.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().remove(key);
        Ok(())
    }
}

/// A local replica's sealed identity: signing key plus the capability tokens
/// it holds for the document.
#[derive(Debug, Clone)]
pub struct ReplicaIdentity {
    pub signing_key: [u8; 32],
    pub local_tokens: Vec<Vec<u8>>,
}

impl ReplicaIdentity {
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.signing_key)
    }

    fn encode(&self) -> Result<Vec<u8>, AuthError> {
        cbor::to_canonical_bytes(&Value::Map(vec![
            (cbor::text("replica_sk"), cbor::bytes(self.signing_key.to_vec())),
            (
                cbor::text("local_tokens"),
                Value::Array(self.local_tokens.iter().map(|t| cbor::bytes(t.clone())).collect()),
            ),
        ]))
    }

    fn decode(bytes: &[u8]) -> Result<Self, AuthError> {
        let value = cbor::from_slice(bytes)?;
        let entries = cbor::as_map(&value)
            .ok_or_else(|| AuthError::Keystore("replica identity is not a map".into()))?;
        let sk = cbor::field(entries, "replica_sk")
            .and_then(cbor::as_bytes)
            .ok_or_else(|| AuthError::Keystore("replica identity missing replica_sk".into()))?;
        let signing_key: [u8; 32] = sk
            .try_into()
            .map_err(|_| AuthError::Keystore("replica_sk must be 32 bytes".into()))?;
        let local_tokens = cbor::field(entries, "local_tokens")
            .and_then(cbor::as_array)
            .ok_or_else(|| AuthError::Keystore("replica identity missing local_tokens".into()))?
            .iter()
            .map(|t| {
                cbor::as_bytes(t)
                    .map(|b| b.to_vec())
                    .ok_or_else(|| AuthError::Keystore("token is not bytes".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            signing_key,
            local_tokens,
        })
    }
}

pub struct KeyStore {
    wrap_key: [u8; 32],
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
}

fn blob_aad(purpose: &str, doc_id: &DocId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + purpose.len() + doc_id.as_bytes().len());
    aad.extend_from_slice(&(purpose.len() as u32).to_be_bytes());
    aad.extend_from_slice(purpose.as_bytes());
    aad.extend_from_slice(&(doc_id.as_bytes().len() as u32).to_be_bytes());
    aad.extend_from_slice(doc_id.as_bytes());
    aad
}

impl KeyStore {
    pub fn new(wrap_key: [u8; 32], store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            wrap_key,
            store,
            clock,
        }
    }

    /// Generate a fresh device wrap key.
    pub fn generate_wrap_key() -> [u8; 32] {
        rand::random()
    }

    fn seal(&self, purpose: &str, doc_id: &DocId, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        let cipher = Aes256Gcm::new((&self.wrap_key).into());
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = blob_aad(purpose, doc_id);
        let ct = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| AuthError::Keystore("seal failed".into()))?;
        let mut blob = Vec::with_capacity(SEAL_MARKER.len() + NONCE_LEN + ct.len());
        blob.extend_from_slice(SEAL_MARKER);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ct);
        Ok(blob)
    }

    fn open(&self, purpose: &str, doc_id: &DocId, blob: &[u8]) -> Result<Vec<u8>, AuthError> {
        let body = blob
            .strip_prefix(SEAL_MARKER)
            .ok_or_else(|| AuthError::Keystore("blob is not sealed".into()))?;
        if body.len() < NONCE_LEN {
            return Err(AuthError::Keystore("sealed blob too short".into()));
        }
        let (nonce_bytes, ct) = body.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new((&self.wrap_key).into());
        let aad = blob_aad(purpose, doc_id);
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload { msg: ct, aad: &aad },
            )
            .map_err(|_| AuthError::Keystore("blob failed to open (wrong key or AAD)".into()))
    }

    /// Load a blob, transparently migrating legacy plaintext once.
    async fn load_blob(&self, purpose: &str, doc_id: &DocId, key: &str) -> Result<Option<Vec<u8>>, AuthError> {
        let Some(stored) = self.store.get(key).await.map_err(AuthError::backend)? else {
            return Ok(None);
        };
        if stored.starts_with(SEAL_MARKER) {
            return Ok(Some(self.open(purpose, doc_id, &stored)?));
        }
        // legacy plaintext blob from an older version: re-seal in place
        tracing::info!(key, "migrating legacy plaintext blob");
        let sealed = self.seal(purpose, doc_id, &stored)?;
        self.store.put(key, &sealed).await.map_err(AuthError::backend)?;
        Ok(Some(stored))
    }

    async fn store_blob(&self, purpose: &str, doc_id: &DocId, key: &str, plaintext: &[u8]) -> Result<(), AuthError> {
        let sealed = self.seal(purpose, doc_id, plaintext)?;
        self.store.put(key, &sealed).await.map_err(AuthError::backend)
    }

    // ── Initialization guard ───────────────────────────────────────────────

    async fn acquire_init_lock(&self, doc_id: &DocId) -> Result<InitLock<'_>, AuthError> {
        let key = format!("doc/{doc_id}/init-lock");
        let nonce: [u8; 8] = rand::random();
        loop {
            let held = self.store.get(&key).await.map_err(AuthError::backend)?;
            let now = self.clock.now_millis();
            let live = held.as_ref().is_some_and(|v| {
                v.len() >= 8
                    && u64::from_be_bytes(v[..8].try_into().unwrap_or([0; 8]))
                        .saturating_add(LOCK_TTL_MS)
                        > now
            });
            if live {
                tokio::time::sleep(LOCK_RETRY).await;
                continue;
            }
            let mut marker = now.to_be_bytes().to_vec();
            marker.extend_from_slice(&nonce);
            self.store.put(&key, &marker).await.map_err(AuthError::backend)?;
            // confirm we won the write
            let confirmed = self.store.get(&key).await.map_err(AuthError::backend)?;
            if confirmed.as_deref() == Some(marker.as_slice()) {
                return Ok(InitLock { store: self, key });
            }
        }
    }

    // ── Per-document blobs ─────────────────────────────────────────────────

    /// Load the document's issuer signing key, generating and sealing one if
    /// absent.
    pub async fn ensure_issuer_key(&self, doc_id: &DocId) -> Result<SigningKey, AuthError> {
        let key = format!("doc/{doc_id}/issuer-key");
        if let Some(plain) = self.load_blob(PURPOSE_ISSUER_KEY, doc_id, &key).await? {
            let sk: [u8; 32] = plain
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::Keystore("issuer key must be 32 bytes".into()))?;
            return Ok(SigningKey::from_bytes(&sk));
        }
        let lock = self.acquire_init_lock(doc_id).await?;
        // re-check under the lock
        if let Some(plain) = self.load_blob(PURPOSE_ISSUER_KEY, doc_id, &key).await? {
            let sk: [u8; 32] = plain
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::Keystore("issuer key must be 32 bytes".into()))?;
            lock.release().await?;
            return Ok(SigningKey::from_bytes(&sk));
        }
        let generated = SigningKey::from_bytes(&rand::random());
        self.store_blob(PURPOSE_ISSUER_KEY, doc_id, &key, &generated.to_bytes()).await?;
        lock.release().await?;
        Ok(generated)
    }

    pub async fn load_issuer_key(&self, doc_id: &DocId) -> Result<Option<SigningKey>, AuthError> {
        let key = format!("doc/{doc_id}/issuer-key");
        match self.load_blob(PURPOSE_ISSUER_KEY, doc_id, &key).await? {
            Some(plain) => {
                let sk: [u8; 32] = plain
                    .as_slice()
                    .try_into()
                    .map_err(|_| AuthError::Keystore("issuer key must be 32 bytes".into()))?;
                Ok(Some(SigningKey::from_bytes(&sk)))
            }
            None => Ok(None),
        }
    }

    fn replica_key_path(doc_id: &DocId, label: &str) -> String {
        format!("doc/{doc_id}/replica/{label}")
    }

    pub async fn load_replica_identity(
        &self,
        doc_id: &DocId,
        label: &str,
    ) -> Result<Option<ReplicaIdentity>, AuthError> {
        let key = Self::replica_key_path(doc_id, label);
        match self.load_blob(PURPOSE_REPLICA_IDENTITY, doc_id, &key).await? {
            Some(plain) => Ok(Some(ReplicaIdentity::decode(&plain)?)),
            None => Ok(None),
        }
    }

    pub async fn store_replica_identity(
        &self,
        doc_id: &DocId,
        label: &str,
        identity: &ReplicaIdentity,
    ) -> Result<(), AuthError> {
        let key = Self::replica_key_path(doc_id, label);
        self.store_blob(PURPOSE_REPLICA_IDENTITY, doc_id, &key, &identity.encode()?).await
    }

    /// Load or create the replica identity for `(doc, label)`.
    pub async fn ensure_replica_identity(
        &self,
        doc_id: &DocId,
        label: &str,
    ) -> Result<ReplicaIdentity, AuthError> {
        if let Some(identity) = self.load_replica_identity(doc_id, label).await? {
            return Ok(identity);
        }
        let lock = self.acquire_init_lock(doc_id).await?;
        if let Some(identity) = self.load_replica_identity(doc_id, label).await? {
            lock.release().await?;
            return Ok(identity);
        }
        let identity = ReplicaIdentity {
            signing_key: rand::random(),
            local_tokens: Vec::new(),
        };
        self.store_replica_identity(doc_id, label, &identity).await?;
        lock.release().await?;
        Ok(identity)
    }

    /// The document's payload encryption key (used by the payload-at-rest
    /// layer outside this core).
    pub async fn ensure_payload_key(&self, doc_id: &DocId) -> Result<[u8; 32], AuthError> {
        let key = format!("doc/{doc_id}/payload-key");
        if let Some(plain) = self.load_blob(PURPOSE_PAYLOAD_KEY, doc_id, &key).await? {
            return plain
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::Keystore("payload key must be 32 bytes".into()));
        }
        let lock = self.acquire_init_lock(doc_id).await?;
        if let Some(plain) = self.load_blob(PURPOSE_PAYLOAD_KEY, doc_id, &key).await? {
            lock.release().await?;
            return plain
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::Keystore("payload key must be 32 bytes".into()));
        }
        let generated: [u8; 32] = rand::random();
        self.store_blob(PURPOSE_PAYLOAD_KEY, doc_id, &key, &generated).await?;
        lock.release().await?;
        Ok(generated)
    }

    pub async fn store_payload_key(&self, doc_id: &DocId, payload_key: &[u8; 32]) -> Result<(), AuthError> {
        let key = format!("doc/{doc_id}/payload-key");
        self.store_blob(PURPOSE_PAYLOAD_KEY, doc_id, &key, payload_key).await
    }

    /// Identity-chain certificates (encoded advertisement payload).
    pub async fn store_identity_chain(&self, doc_id: &DocId, chain: &[u8]) -> Result<(), AuthError> {
        let key = format!("doc/{doc_id}/identity-chain");
        self.store_blob(PURPOSE_IDENTITY_CHAIN, doc_id, &key, chain).await
    }

    pub async fn load_identity_chain(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, AuthError> {
        let key = format!("doc/{doc_id}/identity-chain");
        self.load_blob(PURPOSE_IDENTITY_CHAIN, doc_id, &key).await
    }
}

struct InitLock<'a> {
    store: &'a KeyStore,
    key: String,
}

impl InitLock<'_> {
    async fn release(self) -> Result<(), AuthError> {
        self.store.store.delete(&self.key).await.map_err(AuthError::backend)
    }
}
