//! Cerberus Capability - what an identity is allowed to do
//!
//! Capability tokens are scoped, expiring grants issued by a single
//! authority. The capability head checks a request's token against the
//! authority's books; the authority itself enforces issuance policy
//! (no self-issuance, least-privilege scope ceilings) at issue time.

#![deny(unsafe_code)]

mod authority;
mod head;
mod token;

pub use authority::{
    CapabilityAuthority, CapabilityAuthorityConfig, CapabilityEvent, CapabilityEventType,
    IssueOptions, RevocationEntry, CAPABILITY_AUTHORITY_COMPONENT,
};
pub use head::{CapabilityHead, CAPABILITY_HEAD_COMPONENT};
pub use token::{CapabilityScope, CapabilityToken, DelegationPolicy, TokenBinding};

use cerberus_crypto::CryptoError;
use cerberus_types::Did;
use thiserror::Error;

/// Capability-related errors
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Authority cannot issue a token to itself: {0}")]
    SelfIssuance(Did),

    #[error("Scope exceeds the least-privilege ceiling: {actions} actions, ceiling {ceiling}")]
    ScopeTooBroad { actions: usize, ceiling: usize },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock error")]
    LockError,
}
