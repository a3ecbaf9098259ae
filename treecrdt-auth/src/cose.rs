//! COSE_Sign1 envelopes over Ed25519.
//!
//! The envelope is the 4-element CBOR array
//! `[protected_bstr, unprotected_map, payload_bstr, signature_bstr]` with the
//! protected header fixed to `{1: -8}` (EdDSA). Signing covers the
//! Sig_structure `["Signature1", protected, external_aad = h'', payload]`,
//! deterministically encoded.
//!
//! Delegated capability tokens carry their proof envelope in the unprotected
//! header `treecrdt.delegation_proof_v1`, either as a single `bstr` or a
//! one-element array of `bstr`.

use ciborium::value::Value;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::cbor;
use crate::error::AuthError;

/// COSE algorithm identifier for EdDSA.
pub const ALG_EDDSA: i64 = -8;

/// Protected-header label for the algorithm.
const HDR_ALG: i64 = 1;

/// Unprotected-header key carrying a delegation proof envelope.
pub const DELEGATION_PROOF_HEADER: &str = "treecrdt.delegation_proof_v1";

#[derive(Debug, Clone)]
pub struct CoseSign1 {
    /// Encoded protected header (a serialized CBOR map).
    pub protected: Vec<u8>,
    pub unprotected: Vec<(Value, Value)>,
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
}

fn protected_header() -> Result<Vec<u8>, AuthError> {
    cbor::to_canonical_bytes(&Value::Map(vec![(
        cbor::i64_value(HDR_ALG),
        cbor::i64_value(ALG_EDDSA),
    )]))
}

fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>, AuthError> {
    cbor::to_canonical_bytes(&Value::Array(vec![
        cbor::text("Signature1"),
        cbor::bytes(protected.to_vec()),
        cbor::bytes(Vec::new()),
        cbor::bytes(payload.to_vec()),
    ]))
}

impl CoseSign1 {
    /// Sign `payload`, producing a complete envelope.
    pub fn sign(
        key: &SigningKey,
        payload: Vec<u8>,
        unprotected: Vec<(Value, Value)>,
    ) -> Result<Self, AuthError> {
        let protected = protected_header()?;
        let structure = sig_structure(&protected, &payload)?;
        let signature = key.sign(&structure).to_bytes();
        Ok(Self {
            protected,
            unprotected,
            payload,
            signature,
        })
    }

    /// Verify the envelope signature against a candidate public key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), AuthError> {
        let header = cbor::from_slice(&self.protected)?;
        let entries = cbor::as_map(&header)
            .ok_or_else(|| AuthError::Malformed("protected header is not a map".into()))?;
        let alg = cbor::claim(entries, HDR_ALG, "alg")
            .and_then(cbor::as_i64)
            .ok_or_else(|| AuthError::Malformed("missing alg header".into()))?;
        if alg != ALG_EDDSA {
            return Err(AuthError::Malformed(format!("unsupported alg {alg}")));
        }
        let structure = sig_structure(&self.protected, &self.payload)?;
        key.verify(&structure, &Signature::from_bytes(&self.signature))
            .map_err(|_| AuthError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AuthError> {
        cbor::to_canonical_bytes(&Value::Array(vec![
            cbor::bytes(self.protected.clone()),
            Value::Map(self.unprotected.clone()),
            cbor::bytes(self.payload.clone()),
            cbor::bytes(self.signature.to_vec()),
        ]))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        let value = cbor::from_slice(bytes)?;
        let items = cbor::as_array(&value)
            .ok_or_else(|| AuthError::Malformed("COSE_Sign1 is not an array".into()))?;
        if items.len() != 4 {
            return Err(AuthError::Malformed(format!(
                "COSE_Sign1 must have 4 elements, got {}",
                items.len()
            )));
        }
        let protected = cbor::as_bytes(&items[0])
            .ok_or_else(|| AuthError::Malformed("protected header is not a bstr".into()))?
            .to_vec();
        let unprotected = cbor::as_map(&items[1])
            .ok_or_else(|| AuthError::Malformed("unprotected header is not a map".into()))?
            .to_vec();
        let payload = cbor::as_bytes(&items[2])
            .ok_or_else(|| AuthError::Malformed("payload is not a bstr".into()))?
            .to_vec();
        let sig = cbor::as_bytes(&items[3])
            .ok_or_else(|| AuthError::Malformed("signature is not a bstr".into()))?;
        let signature: [u8; 64] = sig
            .try_into()
            .map_err(|_| AuthError::Malformed(format!("signature must be 64 bytes, got {}", sig.len())))?;
        Ok(Self {
            protected,
            unprotected,
            payload,
            signature,
        })
    }

    /// Extract delegation proof envelopes from the unprotected header.
    ///
    /// Returns an empty vec when the header is absent. The header value must
    /// be a `bstr` or a one-element array of `bstr`.
    pub fn delegation_proofs(&self) -> Result<Vec<Vec<u8>>, AuthError> {
        let Some(value) = cbor::field(&self.unprotected, DELEGATION_PROOF_HEADER) else {
            return Ok(Vec::new());
        };
        if let Some(b) = cbor::as_bytes(value) {
            return Ok(vec![b.to_vec()]);
        }
        if let Some(items) = cbor::as_array(value) {
            if items.len() != 1 {
                return Err(AuthError::Malformed(format!(
                    "delegation proof array must have 1 element, got {}",
                    items.len()
                )));
            }
            let b = cbor::as_bytes(&items[0])
                .ok_or_else(|| AuthError::Malformed("delegation proof is not a bstr".into()))?;
            return Ok(vec![b.to_vec()]);
        }
        Err(AuthError::Malformed("delegation proof header has wrong type".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_verify_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let envelope = CoseSign1::sign(&key, b"hello".to_vec(), Vec::new()).unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let parsed = CoseSign1::from_bytes(&bytes).unwrap();
        parsed.verify(&key.verifying_key()).unwrap();
        assert_eq!(parsed.payload, b"hello");
    }

    #[test]
    fn wrong_key_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let envelope = CoseSign1::sign(&key, b"hello".to_vec(), Vec::new()).unwrap();
        assert!(matches!(
            envelope.verify(&other.verifying_key()),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_payload_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let mut envelope = CoseSign1::sign(&key, b"hello".to_vec(), Vec::new()).unwrap();
        envelope.payload[0] ^= 1;
        assert!(envelope.verify(&key.verifying_key()).is_err());
    }

    #[test]
    fn encoding_is_stable() {
        let key = SigningKey::generate(&mut OsRng);
        let envelope = CoseSign1::sign(&key, b"x".to_vec(), Vec::new()).unwrap();
        assert_eq!(envelope.to_bytes().unwrap(), envelope.to_bytes().unwrap());
    }

    #[test]
    fn delegation_proof_forms() {
        let key = SigningKey::generate(&mut OsRng);
        let proof = vec![1u8, 2, 3];

        let direct = CoseSign1::sign(
            &key,
            b"p".to_vec(),
            vec![(cbor::text(DELEGATION_PROOF_HEADER), cbor::bytes(proof.clone()))],
        )
        .unwrap();
        assert_eq!(direct.delegation_proofs().unwrap(), vec![proof.clone()]);

        let wrapped = CoseSign1::sign(
            &key,
            b"p".to_vec(),
            vec![(
                cbor::text(DELEGATION_PROOF_HEADER),
                Value::Array(vec![cbor::bytes(proof.clone())]),
            )],
        )
        .unwrap();
        assert_eq!(wrapped.delegation_proofs().unwrap(), vec![proof.clone()]);

        let two = CoseSign1::sign(
            &key,
            b"p".to_vec(),
            vec![(
                cbor::text(DELEGATION_PROOF_HEADER),
                Value::Array(vec![cbor::bytes(proof.clone()), cbor::bytes(proof)]),
            )],
        )
        .unwrap();
        assert!(two.delegation_proofs().is_err());

        let none = CoseSign1::sign(&key, b"p".to_vec(), Vec::new()).unwrap();
        assert!(none.delegation_proofs().unwrap().is_empty());
    }
}
