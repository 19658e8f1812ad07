//! Capability token model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cerberus_types::{canonical_json, ComponentSignature, Did, TokenId};

/// One granted scope: a resource pattern and the actions permitted on it.
///
/// Resource patterns match exactly, or by prefix when the pattern ends
/// with `*`. An action entry of `*` permits any action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityScope {
    pub resource: String,
    pub actions: Vec<String>,
}

impl CapabilityScope {
    pub fn new(resource: impl Into<String>, actions: Vec<&str>) -> Self {
        Self {
            resource: resource.into(),
            actions: actions.into_iter().map(String::from).collect(),
        }
    }

    pub fn permits(&self, action: &str, resource: &str) -> bool {
        let action_ok = self.actions.iter().any(|a| a == "*" || a == action);
        action_ok && resource_matches(&self.resource, resource)
    }
}

fn resource_matches(pattern: &str, resource: &str) -> bool {
    pattern == "*"
        || pattern == resource
        || (pattern.ends_with('*') && resource.starts_with(pattern.trim_end_matches('*')))
}

/// Whether and how far a token may be delegated
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationPolicy {
    pub is_delegable: bool,
    pub max_depth: u32,
}

/// Optional proof-of-possession binding
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBinding {
    pub client_cert_fingerprint: Option<String>,
}

/// A capability token issued by the authority
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub token_id: TokenId,
    pub issuer: Did,
    pub subject: Did,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Replay guard unique per token.
    pub nonce: String,
    pub scope: Vec<CapabilityScope>,
    #[serde(default)]
    pub delegation: DelegationPolicy,
    #[serde(default)]
    pub binding: TokenBinding,
    pub signature: Option<ComponentSignature>,
}

impl CapabilityToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn permits(&self, action: &str, resource: &str) -> bool {
        self.scope.iter().any(|s| s.permits(action, resource))
    }

    /// Canonical bytes the authority signs: the token with its signature
    /// slot empty.
    pub fn signable_content(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        canonical_json(&unsigned)
    }
}
