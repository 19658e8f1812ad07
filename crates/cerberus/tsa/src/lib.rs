//! Cerberus TSA - a local timestamp authority
//!
//! Binds a data hash (typically a sealed block's Merkle root) to a signed
//! (hash, serial, generation time, nonce) tuple. Serials are strictly
//! increasing, generation times never go backwards, and a nonce is accepted
//! at most once. Tokens verify offline against the authority's public key
//! alone.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use cerberus_crypto::{ComponentKeyStore, CryptoError};
use cerberus_types::{canonical_json, ComponentSignature};

/// Component name the authority registers in the key store.
pub const TSA_COMPONENT: &str = "cerberus-tsa";

/// Timestamp authority errors
#[derive(Debug, Error)]
pub enum TsaError {
    #[error("Nonce already used: {0}")]
    NonceReused(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock error")]
    LockError,
}

/// A signed timestamp token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeStampToken {
    pub serial: u64,
    /// Hex hash of the content being timestamped.
    pub data_hash: String,
    /// Caller-supplied replay guard.
    pub nonce: String,
    pub generated_at: DateTime<Utc>,
    pub signature: ComponentSignature,
}

impl TimeStampToken {
    /// The bytes the authority signed: everything except the signature.
    fn signable_content(
        serial: u64,
        data_hash: &str,
        nonce: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        #[derive(Serialize)]
        struct Content<'a> {
            serial: u64,
            data_hash: &'a str,
            nonce: &'a str,
            generated_at: DateTime<Utc>,
        }
        canonical_json(&Content {
            serial,
            data_hash,
            nonce,
            generated_at,
        })
    }
}

struct TsaState {
    next_serial: u64,
    seen_nonces: HashSet<String>,
    last_generated: DateTime<Utc>,
}

/// The local timestamp authority.
///
/// Holds its signing key in the shared component key store and hands out
/// its public key for offline verification.
pub struct TimestampAuthority {
    keystore: Arc<ComponentKeyStore>,
    public_key: VerifyingKey,
    state: RwLock<TsaState>,
}

impl TimestampAuthority {
    /// Create the authority, registering its keypair in the store.
    pub fn new(keystore: Arc<ComponentKeyStore>) -> Result<Self, TsaError> {
        let public_key = keystore.register(TSA_COMPONENT)?;
        Ok(Self {
            keystore,
            public_key,
            state: RwLock::new(TsaState {
                next_serial: 1,
                seen_nonces: HashSet::new(),
                last_generated: Utc::now(),
            }),
        })
    }

    /// Public key tokens verify against.
    pub fn public_key(&self) -> VerifyingKey {
        self.public_key
    }

    /// Issue a token over a data hash. Rejects nonce reuse.
    pub fn request_timestamp(&self, data_hash: &str, nonce: &str) -> Result<TimeStampToken, TsaError> {
        let mut state = self.state.write().map_err(|_| TsaError::LockError)?;

        if state.seen_nonces.contains(nonce) {
            warn!(nonce = nonce, "Timestamp request replayed");
            return Err(TsaError::NonceReused(nonce.to_string()));
        }

        let serial = state.next_serial;
        // Generation time never moves backwards, even if the wall clock does.
        let generated_at = Utc::now().max(state.last_generated);

        let content = TimeStampToken::signable_content(serial, data_hash, nonce, generated_at)?;
        let signature = self.keystore.sign_as(TSA_COMPONENT, &content)?;

        state.next_serial += 1;
        state.seen_nonces.insert(nonce.to_string());
        state.last_generated = generated_at;
        drop(state);

        debug!(serial = serial, data_hash = data_hash, "Issued timestamp token");
        Ok(TimeStampToken {
            serial,
            data_hash: data_hash.to_string(),
            nonce: nonce.to_string(),
            generated_at,
            signature,
        })
    }
}

/// Verify a token offline given only the authority's public key.
pub fn verify_token(public_key: &VerifyingKey, token: &TimeStampToken) -> bool {
    let Ok(content) = TimeStampToken::signable_content(
        token.serial,
        &token.data_hash,
        &token.nonce,
        token.generated_at,
    ) else {
        return false;
    };
    cerberus_crypto::verify_detached(public_key, &token.signature.bytes, &content)
}
