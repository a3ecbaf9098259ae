//! The SQLite backend doubles as the keystore's secret store; sealed blobs
//! must survive a close/reopen cycle and stay bound to their document.

use std::sync::Arc;

use treecrdt_auth::clock::SystemClock;
use treecrdt_auth::ids::DocId;
use treecrdt_auth::keystore::KeyStore;
use treecrdt_store::SqliteBackend;

fn keystore(backend: Arc<SqliteBackend>, wrap_key: [u8; 32]) -> KeyStore {
    KeyStore::new(wrap_key, backend, Arc::new(SystemClock))
}

#[tokio::test]
async fn issuer_key_persists_across_reopen() {
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("treecrdt-ks-{}-{nonce}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("store.db");
    let wrap_key = KeyStore::generate_wrap_key();
    let doc = DocId::new("doc-persist").unwrap();

    let first = {
        let backend = SqliteBackend::open(&path).unwrap();
        keystore(backend, wrap_key).ensure_issuer_key(&doc).await.unwrap()
    };

    let backend = SqliteBackend::open(&path).unwrap();
    let second = keystore(backend, wrap_key).ensure_issuer_key(&doc).await.unwrap();
    assert_eq!(first.to_bytes(), second.to_bytes());

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn replica_identity_holds_tokens_per_doc() {
    let backend = SqliteBackend::open_memory().unwrap();
    let ks = keystore(backend, [3u8; 32]);
    let doc_a = DocId::new("doc-a").unwrap();
    let doc_b = DocId::new("doc-b").unwrap();

    let mut identity = ks.ensure_replica_identity(&doc_a, "default").await.unwrap();
    identity.local_tokens.push(b"token-envelope".to_vec());
    ks.store_replica_identity(&doc_a, "default", &identity).await.unwrap();

    let reloaded = ks.load_replica_identity(&doc_a, "default").await.unwrap().unwrap();
    assert_eq!(reloaded.local_tokens, vec![b"token-envelope".to_vec()]);
    assert_eq!(reloaded.signing_key, identity.signing_key);

    // identities are per document
    assert!(ks.load_replica_identity(&doc_b, "default").await.unwrap().is_none());
    let other = ks.ensure_replica_identity(&doc_b, "default").await.unwrap();
    assert_ne!(other.signing_key, identity.signing_key);
}

#[tokio::test]
async fn payload_key_is_stable_and_sealed() {
    let backend = SqliteBackend::open_memory().unwrap();
    let ks = keystore(backend.clone(), [4u8; 32]);
    let doc = DocId::new("doc-payload").unwrap();

    let key1 = ks.ensure_payload_key(&doc).await.unwrap();
    let key2 = ks.ensure_payload_key(&doc).await.unwrap();
    assert_eq!(key1, key2);

    // the raw row never contains the plaintext key
    use treecrdt_auth::keystore::SecretStore;
    let raw = backend.get("doc/doc-payload/payload-key").await.unwrap().unwrap();
    assert!(!raw.windows(32).any(|w| w == key1));

    // a different wrap key cannot open the blob
    let other = keystore(backend, [5u8; 32]);
    assert!(other.ensure_payload_key(&doc).await.is_err());
}
