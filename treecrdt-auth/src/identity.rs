//! Identity → device → replica certificate chains.
//!
//! A peer can prove its replica key is authorized by a longer-lived identity:
//! the identity key signs a device certificate, the device key signs a
//! replica certificate. The chain travels as the `auth.identity_chain.v1`
//! capability advertisement.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ciborium::value::Value;
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::cbor;
use crate::cose::CoseSign1;
use crate::error::AuthError;
use crate::ids::ReplicaId;

const DEVICE_CERT_TYPE: &str = "treecrdt/device-cert/v1";
const REPLICA_CERT_TYPE: &str = "treecrdt/replica-cert/v1";

fn issue_cert(signer: &SigningKey, cert_type: &str, subject: &VerifyingKey) -> Result<Vec<u8>, AuthError> {
    let payload = cbor::to_canonical_bytes(&Value::Map(vec![
        (cbor::text("t"), cbor::text(cert_type)),
        (cbor::text("pub"), cbor::bytes(subject.to_bytes().to_vec())),
    ]))?;
    CoseSign1::sign(signer, payload, Vec::new())?.to_bytes()
}

fn verify_cert(bytes: &[u8], cert_type: &str, signer: &VerifyingKey) -> Result<VerifyingKey, AuthError> {
    let envelope = CoseSign1::from_bytes(bytes)?;
    envelope.verify(signer)?;
    let payload = cbor::from_slice(&envelope.payload)?;
    let entries = cbor::as_map(&payload).ok_or_else(|| AuthError::Malformed("cert is not a map".into()))?;
    let t = cbor::field(entries, "t")
        .and_then(cbor::as_text)
        .ok_or_else(|| AuthError::Malformed("cert missing t".into()))?;
    if t != cert_type {
        return Err(AuthError::Malformed(format!("unexpected cert type {t}")));
    }
    let subject = cbor::field(entries, "pub")
        .and_then(cbor::as_bytes)
        .ok_or_else(|| AuthError::Malformed("cert missing pub".into()))?;
    let subject: [u8; 32] = subject
        .try_into()
        .map_err(|_| AuthError::Malformed("cert pub must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&subject)
        .map_err(|_| AuthError::Malformed("cert pub is not a valid Ed25519 point".into()))
}

/// Sign a device certificate with the identity key.
pub fn issue_device_cert(identity: &SigningKey, device: &VerifyingKey) -> Result<Vec<u8>, AuthError> {
    issue_cert(identity, DEVICE_CERT_TYPE, device)
}

/// Sign a replica certificate with the device key.
pub fn issue_replica_cert(device: &SigningKey, replica: &VerifyingKey) -> Result<Vec<u8>, AuthError> {
    issue_cert(device, REPLICA_CERT_TYPE, replica)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityChain {
    pub identity_pub: ReplicaId,
    pub device_cert: Vec<u8>,
    pub replica_cert: Vec<u8>,
}

impl IdentityChain {
    /// Verify the full chain and return the replica key it authorizes.
    pub fn verify(&self) -> Result<ReplicaId, AuthError> {
        let identity = VerifyingKey::from_bytes(self.identity_pub.as_bytes())
            .map_err(|_| AuthError::Malformed("identity key is not a valid Ed25519 point".into()))?;
        let device = verify_cert(&self.device_cert, DEVICE_CERT_TYPE, &identity)?;
        let replica = verify_cert(&self.replica_cert, REPLICA_CERT_TYPE, &device)?;
        Ok(ReplicaId::from_bytes(replica.to_bytes()))
    }

    /// Encode as the `auth.identity_chain.v1` advertisement value.
    pub fn encode(&self) -> Result<String, AuthError> {
        let value = Value::Map(vec![
            (cbor::text("identity_pub"), cbor::bytes(self.identity_pub.as_bytes().to_vec())),
            (cbor::text("device_cert"), cbor::bytes(self.device_cert.clone())),
            (cbor::text("replica_cert"), cbor::bytes(self.replica_cert.clone())),
        ]);
        Ok(URL_SAFE_NO_PAD.encode(cbor::to_canonical_bytes(&value)?))
    }

    pub fn decode(encoded: &str) -> Result<Self, AuthError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| AuthError::Malformed(format!("bad identity chain encoding: {e}")))?;
        let value = cbor::from_slice(&bytes)?;
        let entries =
            cbor::as_map(&value).ok_or_else(|| AuthError::Malformed("identity chain is not a map".into()))?;
        let identity_pub = cbor::field(entries, "identity_pub")
            .and_then(cbor::as_bytes)
            .ok_or_else(|| AuthError::Malformed("identity chain missing identity_pub".into()))?;
        let device_cert = cbor::field(entries, "device_cert")
            .and_then(cbor::as_bytes)
            .ok_or_else(|| AuthError::Malformed("identity chain missing device_cert".into()))?;
        let replica_cert = cbor::field(entries, "replica_cert")
            .and_then(cbor::as_bytes)
            .ok_or_else(|| AuthError::Malformed("identity chain missing replica_cert".into()))?;
        Ok(Self {
            identity_pub: ReplicaId::from_slice(identity_pub)?,
            device_cert: device_cert.to_vec(),
            replica_cert: replica_cert.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn chain_round_trip() {
        let identity = SigningKey::generate(&mut OsRng);
        let device = SigningKey::generate(&mut OsRng);
        let replica = SigningKey::generate(&mut OsRng);

        let chain = IdentityChain {
            identity_pub: ReplicaId::from_bytes(identity.verifying_key().to_bytes()),
            device_cert: issue_device_cert(&identity, &device.verifying_key()).unwrap(),
            replica_cert: issue_replica_cert(&device, &replica.verifying_key()).unwrap(),
        };

        let authorized = chain.verify().unwrap();
        assert_eq!(authorized.as_bytes(), &replica.verifying_key().to_bytes());

        let decoded = IdentityChain::decode(&chain.encode().unwrap()).unwrap();
        assert_eq!(decoded, chain);
    }

    #[test]
    fn broken_link_fails() {
        let identity = SigningKey::generate(&mut OsRng);
        let device = SigningKey::generate(&mut OsRng);
        let rogue_device = SigningKey::generate(&mut OsRng);
        let replica = SigningKey::generate(&mut OsRng);

        // replica cert signed by a device the identity never certified
        let chain = IdentityChain {
            identity_pub: ReplicaId::from_bytes(identity.verifying_key().to_bytes()),
            device_cert: issue_device_cert(&identity, &device.verifying_key()).unwrap(),
            replica_cert: issue_replica_cert(&rogue_device, &replica.verifying_key()).unwrap(),
        };
        assert!(chain.verify().is_err());
    }

    #[test]
    fn cert_types_are_not_interchangeable() {
        let identity = SigningKey::generate(&mut OsRng);
        let device = SigningKey::generate(&mut OsRng);

        // a device cert cannot stand in for a replica cert
        let cert = issue_device_cert(&identity, &device.verifying_key()).unwrap();
        assert!(verify_cert(&cert, REPLICA_CERT_TYPE, &identity.verifying_key()).is_err());
    }
}
