//! Cerberus Identity - who is allowed to ask
//!
//! Identity documents live in a registry keyed by DID. The identity head
//! runs its full battery of checks on every request and reports every
//! failure it finds, never just the first one.

#![deny(unsafe_code)]

mod document;
mod head;

pub use document::{
    DeviceAttestationRegistry, IdentityAttributes, IdentityDocument, IdentityDocumentStore,
    PublicKeyEntry, RevocationStatus, RiskTier,
};
pub use head::{IdentityHead, IdentityHeadConfig};

use cerberus_types::Did;
use thiserror::Error;

/// Identity-related errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity document already registered: {0}")]
    DuplicateDocument(Did),

    #[error("Identity document not found: {0}")]
    NotFound(Did),

    #[error("Lock error")]
    LockError,
}
