//! The capability authority: sole issuer of tokens.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use cerberus_crypto::ComponentKeyStore;
use cerberus_types::{Did, TokenId};

use crate::token::{CapabilityScope, CapabilityToken, DelegationPolicy, TokenBinding};
use crate::CapabilityError;

/// Component name the authority signs tokens under.
pub const CAPABILITY_AUTHORITY_COMPONENT: &str = "capability-authority";

/// Authority configuration
#[derive(Clone, Debug)]
pub struct CapabilityAuthorityConfig {
    /// TTL applied when an issue request does not specify one.
    pub default_ttl: Duration,
    /// Least-privilege ceiling: total actions a token's scopes may name.
    pub max_scope_actions: usize,
}

impl Default for CapabilityAuthorityConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::days(30),
            max_scope_actions: 8,
        }
    }
}

/// Per-issue overrides
#[derive(Clone, Debug, Default)]
pub struct IssueOptions {
    pub ttl: Option<Duration>,
    pub delegation: DelegationPolicy,
    pub binding: TokenBinding,
}

/// Kinds of audit events the authority records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityEventType {
    Issued,
    Revoked,
    Rotated,
}

/// One entry in the authority's audit log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityEvent {
    pub event_type: CapabilityEventType,
    pub token_id: TokenId,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// One entry in the revocation list
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub token_id: TokenId,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

struct AuthorityState {
    tokens: HashMap<String, CapabilityToken>,
    revoked: HashMap<String, RevocationEntry>,
    audit: Vec<CapabilityEvent>,
}

/// The sole issuer of capability tokens.
///
/// Issue, revoke, and rotate all append to an audit log. Revocation is
/// idempotent; rotation is a composite issue-and-revoke performed under a
/// single lock so no interleaving observes the half-rotated state.
pub struct CapabilityAuthority {
    authority_did: Did,
    keystore: Arc<ComponentKeyStore>,
    config: CapabilityAuthorityConfig,
    state: RwLock<AuthorityState>,
}

impl CapabilityAuthority {
    /// Create the authority, registering its signing key.
    pub fn new(authority_did: Did, keystore: Arc<ComponentKeyStore>) -> Result<Self, CapabilityError> {
        keystore.register(CAPABILITY_AUTHORITY_COMPONENT)?;
        Ok(Self {
            authority_did,
            keystore,
            config: CapabilityAuthorityConfig::default(),
            state: RwLock::new(AuthorityState {
                tokens: HashMap::new(),
                revoked: HashMap::new(),
                audit: Vec::new(),
            }),
        })
    }

    pub fn with_config(mut self, config: CapabilityAuthorityConfig) -> Self {
        self.config = config;
        self
    }

    pub fn authority_did(&self) -> &Did {
        &self.authority_did
    }

    /// Issue a token. The authority never issues to itself, and the total
    /// action count across scopes must stay under the configured ceiling.
    pub fn issue(
        &self,
        subject: &Did,
        scope: Vec<CapabilityScope>,
        options: IssueOptions,
    ) -> Result<CapabilityToken, CapabilityError> {
        let mut state = self.state.write().map_err(|_| CapabilityError::LockError)?;
        let token = self.build_and_sign(subject, scope, &options)?;
        state.tokens.insert(token.token_id.0.clone(), token.clone());
        state.audit.push(CapabilityEvent {
            event_type: CapabilityEventType::Issued,
            token_id: token.token_id.clone(),
            detail: format!("issued to {}", subject),
            at: Utc::now(),
        });
        info!(token_id = %token.token_id, subject = %subject, "Issued capability token");
        Ok(token)
    }

    fn build_and_sign(
        &self,
        subject: &Did,
        scope: Vec<CapabilityScope>,
        options: &IssueOptions,
    ) -> Result<CapabilityToken, CapabilityError> {
        if subject == &self.authority_did {
            warn!(subject = %subject, "Rejected self-issuance attempt");
            return Err(CapabilityError::SelfIssuance(subject.clone()));
        }

        let actions: usize = scope.iter().map(|s| s.actions.len()).sum();
        if actions > self.config.max_scope_actions {
            return Err(CapabilityError::ScopeTooBroad {
                actions,
                ceiling: self.config.max_scope_actions,
            });
        }

        let issued_at = Utc::now();
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let mut token = CapabilityToken {
            token_id: TokenId::generate(),
            issuer: self.authority_did.clone(),
            subject: subject.clone(),
            issued_at,
            expires_at: issued_at + ttl,
            nonce: uuid::Uuid::new_v4().to_string(),
            scope,
            delegation: options.delegation.clone(),
            binding: options.binding.clone(),
            signature: None,
        };

        let content = token.signable_content()?;
        token.signature = Some(self.keystore.sign_as(CAPABILITY_AUTHORITY_COMPONENT, &content)?);
        Ok(token)
    }

    /// Revoke a token. Returns `true` if the token was ever issued (already
    /// revoked included), `false` for tokens this authority never saw.
    pub fn revoke(&self, token_id: &TokenId, reason: &str) -> Result<bool, CapabilityError> {
        let mut state = self.state.write().map_err(|_| CapabilityError::LockError)?;

        if state.revoked.contains_key(&token_id.0) {
            return Ok(true);
        }
        if !state.tokens.contains_key(&token_id.0) {
            return Ok(false);
        }

        state.revoked.insert(
            token_id.0.clone(),
            RevocationEntry {
                token_id: token_id.clone(),
                reason: reason.to_string(),
                revoked_at: Utc::now(),
            },
        );
        state.audit.push(CapabilityEvent {
            event_type: CapabilityEventType::Revoked,
            token_id: token_id.clone(),
            detail: reason.to_string(),
            at: Utc::now(),
        });
        info!(token_id = %token_id, reason = reason, "Revoked capability token");
        Ok(true)
    }

    /// Replace a token atomically: a successor is issued and the original
    /// revoked under one lock. Returns `None` for unknown tokens.
    pub fn rotate(
        &self,
        token_id: &TokenId,
        new_scope: Option<Vec<CapabilityScope>>,
    ) -> Result<Option<CapabilityToken>, CapabilityError> {
        let mut state = self.state.write().map_err(|_| CapabilityError::LockError)?;

        let Some(old) = state.tokens.get(&token_id.0).cloned() else {
            return Ok(None);
        };

        let options = IssueOptions {
            ttl: None,
            delegation: old.delegation.clone(),
            binding: old.binding.clone(),
        };
        let replacement =
            self.build_and_sign(&old.subject, new_scope.unwrap_or(old.scope), &options)?;

        state
            .tokens
            .insert(replacement.token_id.0.clone(), replacement.clone());
        state.revoked.entry(token_id.0.clone()).or_insert(RevocationEntry {
            token_id: token_id.clone(),
            reason: format!("rotated to {}", replacement.token_id),
            revoked_at: Utc::now(),
        });
        state.audit.push(CapabilityEvent {
            event_type: CapabilityEventType::Rotated,
            token_id: token_id.clone(),
            detail: format!("successor {}", replacement.token_id),
            at: Utc::now(),
        });

        info!(
            old_token = %token_id,
            new_token = %replacement.token_id,
            "Rotated capability token"
        );
        Ok(Some(replacement))
    }

    pub fn get_token(&self, token_id: &TokenId) -> Option<CapabilityToken> {
        let state = self.state.read().ok()?;
        state.tokens.get(&token_id.0).cloned()
    }

    pub fn is_revoked(&self, token_id: &TokenId) -> bool {
        self.state
            .read()
            .map(|s| s.revoked.contains_key(&token_id.0))
            .unwrap_or(false)
    }

    /// Known, unrevoked, unexpired.
    pub fn is_valid(&self, token_id: &TokenId) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        let Some(token) = state.tokens.get(&token_id.0) else {
            return false;
        };
        !state.revoked.contains_key(&token_id.0) && !token.is_expired(Utc::now())
    }

    /// Recompute and check a token's signature against the authority key.
    pub fn verify_token_signature(&self, token: &CapabilityToken) -> bool {
        let Some(signature) = &token.signature else {
            return false;
        };
        let Ok(content) = token.signable_content() else {
            return false;
        };
        self.keystore
            .verify_from(CAPABILITY_AUTHORITY_COMPONENT, signature, &content)
    }

    pub fn issued_count(&self) -> usize {
        self.state.read().map(|s| s.tokens.len()).unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        let Ok(state) = self.state.read() else {
            return 0;
        };
        let now = Utc::now();
        state
            .tokens
            .values()
            .filter(|t| !state.revoked.contains_key(&t.token_id.0) && !t.is_expired(now))
            .count()
    }

    pub fn audit_log(&self) -> Vec<CapabilityEvent> {
        self.state.read().map(|s| s.audit.clone()).unwrap_or_default()
    }

    pub fn revocation_list(&self) -> Vec<RevocationEntry> {
        self.state
            .read()
            .map(|s| s.revoked.values().cloned().collect())
            .unwrap_or_default()
    }
}
