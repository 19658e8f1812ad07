//! Identity documents, the document store, and device attestation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

use cerberus_types::Did;

use crate::IdentityError;

/// Risk tier attributed to an identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// A public key bound to an identity, valid within a window
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicKeyEntry {
    pub kid: String,
    /// Key type; `ed25519` today.
    pub kty: String,
    /// Hex-encoded public key bytes.
    pub public_key: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl PublicKeyEntry {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.created <= now && now < self.expires
    }
}

/// Revocation state of a document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RevocationStatus {
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Descriptive attributes carried by a document
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityAttributes {
    pub org: Option<String>,
    pub role: Option<String>,
    pub risk_tier: RiskTier,
}

impl Default for IdentityAttributes {
    fn default() -> Self {
        Self {
            org: None,
            role: None,
            risk_tier: RiskTier::Low,
        }
    }
}

/// An identity document.
///
/// Documents are value objects: revocation replaces the stored document
/// with a revoked copy instead of mutating it in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub id: Did,
    pub doc_type: String,
    pub public_keys: Vec<PublicKeyEntry>,
    #[serde(default)]
    pub attributes: IdentityAttributes,
    #[serde(default)]
    pub revocation: RevocationStatus,
}

impl IdentityDocument {
    pub fn new(id: Did) -> Self {
        Self {
            id,
            doc_type: "identity".to_string(),
            public_keys: Vec::new(),
            attributes: IdentityAttributes::default(),
            revocation: RevocationStatus::default(),
        }
    }

    pub fn with_key(mut self, entry: PublicKeyEntry) -> Self {
        self.public_keys.push(entry);
        self
    }

    pub fn with_risk_tier(mut self, tier: RiskTier) -> Self {
        self.attributes.risk_tier = tier;
        self
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation.revoked
    }

    pub fn has_current_key(&self, now: DateTime<Utc>) -> bool {
        self.public_keys.iter().any(|k| k.is_current(now))
    }

    fn revoked_copy(&self, reason: &str) -> IdentityDocument {
        let mut revoked = self.clone();
        revoked.revocation = RevocationStatus {
            revoked: true,
            revoked_at: Some(Utc::now()),
            reason: Some(reason.to_string()),
        };
        revoked
    }
}

/// Registry of identity documents keyed by DID.
pub struct IdentityDocumentStore {
    documents: RwLock<HashMap<String, IdentityDocument>>,
}

impl IdentityDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Register a document. Duplicate DIDs are rejected.
    pub fn register(&self, document: IdentityDocument) -> Result<(), IdentityError> {
        let mut documents = self.documents.write().map_err(|_| IdentityError::LockError)?;
        if documents.contains_key(&document.id.0) {
            return Err(IdentityError::DuplicateDocument(document.id));
        }
        debug!(did = %document.id, "Registered identity document");
        documents.insert(document.id.0.clone(), document);
        Ok(())
    }

    pub fn resolve(&self, did: &Did) -> Option<IdentityDocument> {
        let documents = self.documents.read().ok()?;
        documents.get(&did.0).cloned()
    }

    /// Replace a document with a revoked copy.
    pub fn revoke(&self, did: &Did, reason: &str) -> Result<(), IdentityError> {
        let mut documents = self.documents.write().map_err(|_| IdentityError::LockError)?;
        let document = documents
            .get(&did.0)
            .ok_or_else(|| IdentityError::NotFound(did.clone()))?;
        let revoked = document.revoked_copy(reason);
        documents.insert(did.0.clone(), revoked);
        info!(did = %did, reason = reason, "Revoked identity document");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Trusted device fingerprints per DID.
pub struct DeviceAttestationRegistry {
    devices: RwLock<HashMap<String, HashSet<String>>>,
}

impl DeviceAttestationRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn trust_device(&self, did: &Did, fingerprint: &str) -> Result<(), IdentityError> {
        let mut devices = self.devices.write().map_err(|_| IdentityError::LockError)?;
        devices
            .entry(did.0.clone())
            .or_default()
            .insert(fingerprint.to_string());
        Ok(())
    }

    pub fn is_trusted(&self, did: &Did, fingerprint: &str) -> bool {
        self.devices
            .read()
            .map(|d| {
                d.get(&did.0)
                    .map(|fps| fps.contains(fingerprint))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

impl Default for DeviceAttestationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
