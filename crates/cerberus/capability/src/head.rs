//! The capability voting head.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use cerberus_crypto::{ComponentKeyStore, CryptoError};
use cerberus_quorum::VotingHead;
use cerberus_types::{
    CerberusVote, ConstraintsApplied, DenyReason, GateDecision, HeadKind, RequestEnvelope,
    Severity,
};

use crate::authority::CapabilityAuthority;

/// Component name the head signs votes under.
pub const CAPABILITY_HEAD_COMPONENT: &str = "capability-head";

/// The capability head.
///
/// Checks the envelope's token against the authority's books: existence,
/// revocation, expiry, subject binding, and scope. All checks run and every
/// failure is reported. While the authority has issued no tokens the head
/// is in open mode and allows everything, mirroring identity's open
/// enrollment.
pub struct CapabilityHead {
    authority: Arc<CapabilityAuthority>,
    signer: Option<Arc<ComponentKeyStore>>,
}

impl CapabilityHead {
    pub fn new(authority: Arc<CapabilityAuthority>) -> Self {
        Self {
            authority,
            signer: None,
        }
    }

    /// Register the head's signing key and sign every vote with it.
    pub fn with_signer(mut self, keystore: Arc<ComponentKeyStore>) -> Result<Self, CryptoError> {
        keystore.register(CAPABILITY_HEAD_COMPONENT)?;
        self.signer = Some(keystore);
        Ok(self)
    }

    fn collect_reasons(&self, envelope: &RequestEnvelope) -> Vec<DenyReason> {
        let mut reasons = Vec::new();

        let Some(token_id) = &envelope.capability_token_id else {
            reasons.push(DenyReason::new(
                "CAP_TOKEN_NOT_FOUND",
                "request presented no capability token",
            ));
            return reasons;
        };

        let Some(token) = self.authority.get_token(token_id) else {
            reasons.push(DenyReason::new(
                "CAP_TOKEN_NOT_FOUND",
                format!("unknown capability token {token_id}"),
            ));
            return reasons;
        };

        if self.authority.is_revoked(token_id) {
            reasons.push(DenyReason::new(
                "CAP_TOKEN_REVOKED",
                format!("capability token {token_id} is revoked"),
            ));
        }

        if token.is_expired(Utc::now()) {
            reasons.push(DenyReason::new(
                "CAP_TOKEN_EXPIRED",
                format!("capability token {token_id} expired at {}", token.expires_at),
            ));
        }

        if token.subject != envelope.actor {
            reasons.push(DenyReason::new(
                "CAP_SUBJECT_MISMATCH",
                format!(
                    "token subject {} does not match actor {}",
                    token.subject, envelope.actor
                ),
            ));
        }

        if !token.permits(&envelope.intent.action, &envelope.intent.resource) {
            reasons.push(DenyReason::new(
                "CAP_SCOPE_DENIED",
                format!(
                    "scope does not permit {} on {}",
                    envelope.intent.action, envelope.intent.resource
                ),
            ));
        }

        reasons
    }
}

impl VotingHead for CapabilityHead {
    fn kind(&self) -> HeadKind {
        HeadKind::Capability
    }

    fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
        // Open mode: nothing issued yet, nothing to check against.
        let reasons = if self.authority.issued_count() == 0 {
            Vec::new()
        } else {
            self.collect_reasons(envelope)
        };

        let decision = if reasons.is_empty() {
            GateDecision::Allow
        } else {
            GateDecision::Deny
        };
        let severity = if decision == GateDecision::Deny {
            Severity::High
        } else {
            Severity::Low
        };

        debug!(
            request_id = %envelope.request_id,
            decision = %decision,
            reason_count = reasons.len(),
            "Capability head voted"
        );

        let mut vote = CerberusVote {
            request_id: envelope.request_id.clone(),
            head: HeadKind::Capability,
            decision,
            reasons,
            constraints: ConstraintsApplied::default(),
            severity,
            signature: None,
            voted_at: Utc::now(),
        };

        if let Some(keystore) = &self.signer {
            if let Ok(content) = vote.signable_content() {
                vote.signature = keystore.sign_as(CAPABILITY_HEAD_COMPONENT, &content).ok();
            }
        }

        vote
    }
}
