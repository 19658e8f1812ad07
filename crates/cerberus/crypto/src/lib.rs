//! Cerberus Crypto - the local signing substrate
//!
//! Every Cerberus component that emits signed artifacts (head votes,
//! capability tokens, timestamp tokens) holds its own Ed25519 keypair in a
//! shared `ComponentKeyStore`. Signing is deterministic for a given key and
//! message; verification is total and never returns an error, only `false`.

#![deny(unsafe_code)]

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use cerberus_types::ComponentSignature;

/// Signature algorithm identifier stamped on every `ComponentSignature`.
pub const SIGNATURE_ALG: &str = "ed25519";

/// Crypto substrate errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Component already registered: {0}")]
    ComponentExists(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Lock error")]
    LockError,
}

/// Holds one Ed25519 keypair per named component.
///
/// A component's private key never leaves the store; callers sign through
/// `sign_as` and check through `verify_from`, which enforces key isolation:
/// a signature made under one component name never verifies under another.
pub struct ComponentKeyStore {
    keys: RwLock<HashMap<String, SigningKey>>,
}

impl ComponentKeyStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Generate and register a keypair for a component. Fails if the name is
    /// already taken; a component's key is fixed for the store's lifetime.
    pub fn register(&self, component: &str) -> Result<VerifyingKey, CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::LockError)?;
        if keys.contains_key(component) {
            return Err(CryptoError::ComponentExists(component.to_string()));
        }

        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *secret);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        keys.insert(component.to_string(), signing_key);
        debug!(component = component, "Registered component keypair");
        Ok(verifying_key)
    }

    /// Public key for a registered component.
    pub fn public_key(&self, component: &str) -> Option<VerifyingKey> {
        let keys = self.keys.read().ok()?;
        keys.get(component).map(|k| k.verifying_key())
    }

    pub fn is_registered(&self, component: &str) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(component))
            .unwrap_or(false)
    }

    /// Sign a message under a component's key.
    pub fn sign_as(&self, component: &str, message: &[u8]) -> Result<ComponentSignature, CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::LockError)?;
        let key = keys
            .get(component)
            .ok_or_else(|| CryptoError::UnknownComponent(component.to_string()))?;

        let signature = key.sign(message);
        Ok(ComponentSignature {
            component: component.to_string(),
            alg: SIGNATURE_ALG.to_string(),
            bytes: signature.to_bytes().to_vec(),
        })
    }

    /// Verify a signature against a component's public key. Total: unknown
    /// components, malformed signature bytes, and mismatched content all
    /// yield `false`.
    pub fn verify_from(&self, component: &str, signature: &ComponentSignature, message: &[u8]) -> bool {
        if signature.component != component || signature.alg != SIGNATURE_ALG {
            return false;
        }
        let Some(public_key) = self.public_key(component) else {
            return false;
        };
        verify_detached(&public_key, &signature.bytes, message)
    }
}

impl Default for ComponentKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify raw signature bytes against a public key. Never errors.
pub fn verify_detached(public_key: &VerifyingKey, signature_bytes: &[u8], message: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature_bytes) else {
        return false;
    };
    public_key.verify(message, &signature).is_ok()
}

/// BLAKE3 hash of arbitrary bytes, hex-encoded (64 chars).
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_register_rejects_duplicate() {
        let store = ComponentKeyStore::new();
        store.register("identity-head").unwrap();
        let err = store.register("identity-head").unwrap_err();
        assert!(matches!(err, CryptoError::ComponentExists(_)));
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let store = ComponentKeyStore::new();
        store.register("tsa").unwrap();

        let sig = store.sign_as("tsa", b"hello").unwrap();
        assert_eq!(sig.alg, SIGNATURE_ALG);
        assert!(store.verify_from("tsa", &sig, b"hello"));
        assert!(!store.verify_from("tsa", &sig, b"tampered"));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let store = ComponentKeyStore::new();
        store.register("ledger").unwrap();

        let a = store.sign_as("ledger", b"same message").unwrap();
        let b = store.sign_as("ledger", b"same message").unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn test_component_isolation() {
        let store = ComponentKeyStore::new();
        store.register("identity-head").unwrap();
        store.register("capability-head").unwrap();

        let sig = store.sign_as("identity-head", b"vote").unwrap();
        // Same message, wrong component: must not verify.
        assert!(!store.verify_from("capability-head", &sig, b"vote"));
    }

    #[test]
    fn test_verify_is_total() {
        let store = ComponentKeyStore::new();
        store.register("tsa").unwrap();

        // Unknown component.
        let sig = store.sign_as("tsa", b"x").unwrap();
        assert!(!store.verify_from("nobody", &sig, b"x"));

        // Malformed signature bytes.
        let bad = ComponentSignature {
            component: "tsa".to_string(),
            alg: SIGNATURE_ALG.to_string(),
            bytes: vec![0u8; 7],
        };
        assert!(!store.verify_from("tsa", &bad, b"x"));

        let public_key = store.public_key("tsa").unwrap();
        assert!(!verify_detached(&public_key, &[], b"x"));
    }

    #[test]
    fn test_sign_unknown_component_errors() {
        let store = ComponentKeyStore::new();
        let err = store.sign_as("ghost", b"x").unwrap_err();
        assert!(matches!(err, CryptoError::UnknownComponent(_)));
    }

    #[test]
    fn test_content_hash_is_hex() {
        let hash = content_hash(b"payload");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, content_hash(b"payload"));
        assert_ne!(hash, content_hash(b"payload2"));
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_message(message in proptest::collection::vec(any::<u8>(), 0..256)) {
            let store = ComponentKeyStore::new();
            store.register("prop").unwrap();
            let sig = store.sign_as("prop", &message).unwrap();
            prop_assert!(store.verify_from("prop", &sig, &message));
        }

        #[test]
        fn prop_tampered_message_fails(
            message in proptest::collection::vec(any::<u8>(), 1..256),
            flip in 0usize..256,
        ) {
            let store = ComponentKeyStore::new();
            store.register("prop").unwrap();
            let sig = store.sign_as("prop", &message).unwrap();

            let mut tampered = message.clone();
            let idx = flip % tampered.len();
            tampered[idx] ^= 0xff;
            prop_assert!(!store.verify_from("prop", &sig, &tampered));
        }
    }
}
