//! Cerberus Invariant - the system protecting its own substrate
//!
//! Root protection rules name resource prefixes no request may mutate
//! through the gate: the invariant definitions themselves, the gate's
//! configuration, and the ledger's history. The invariant head checks every
//! rule and reports every one the request trips.

#![deny(unsafe_code)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use cerberus_crypto::{ComponentKeyStore, CryptoError};
use cerberus_quorum::VotingHead;
use cerberus_types::{
    CerberusVote, ConstraintsApplied, DenyReason, GateDecision, HeadKind, RequestEnvelope,
    Severity,
};

/// Component name the head signs votes under.
pub const INVARIANT_HEAD_COMPONENT: &str = "invariant-head";

/// Actions that never mutate state and therefore never trip a rule.
const READ_ONLY_ACTIONS: &[&str] = &["read", "list", "get", "query"];

/// A root protection rule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvariantRule {
    /// Stable id, doubles as the deny reason code.
    pub id: String,
    pub description: String,
    /// Resource prefix the rule protects.
    pub protected_prefix: String,
    /// Specific actions the rule forbids; `None` means every mutating
    /// action.
    pub denied_actions: Option<Vec<String>>,
}

impl InvariantRule {
    pub fn new(id: impl Into<String>, description: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            protected_prefix: prefix.into(),
            denied_actions: None,
        }
    }

    pub fn is_triggered(&self, action: &str, resource: &str) -> bool {
        if !resource.starts_with(&self.protected_prefix) {
            return false;
        }
        match &self.denied_actions {
            Some(actions) => actions.iter().any(|a| a == action),
            None => !READ_ONLY_ACTIONS.contains(&action),
        }
    }
}

/// The registry of root protection rules.
///
/// The defaults protect the three surfaces the system cannot function
/// without; deployments may add rules but the head never runs with none.
pub struct InvariantRegistry {
    rules: Vec<InvariantRule>,
}

impl InvariantRegistry {
    pub fn new(rules: Vec<InvariantRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: InvariantRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[InvariantRule] {
        &self.rules
    }

    /// Every rule the request trips, in registry order.
    pub fn triggered(&self, action: &str, resource: &str) -> Vec<&InvariantRule> {
        self.rules
            .iter()
            .filter(|r| r.is_triggered(action, resource))
            .collect()
    }
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new(vec![
            InvariantRule::new(
                "INV_ROOT_001",
                "invariant definitions are immutable through the gate",
                "state://invariant/",
            ),
            InvariantRule::new(
                "INV_ROOT_005",
                "gate configuration is immutable through the gate",
                "state://cerberus/",
            ),
            InvariantRule::new(
                "INV_ROOT_009",
                "ledger history is append-only",
                "state://ledger/",
            ),
        ])
    }
}

/// The invariant voting head.
pub struct InvariantHead {
    registry: Arc<InvariantRegistry>,
    signer: Option<Arc<ComponentKeyStore>>,
}

impl InvariantHead {
    pub fn new(registry: Arc<InvariantRegistry>) -> Self {
        Self {
            registry,
            signer: None,
        }
    }

    /// Register the head's signing key and sign every vote with it.
    pub fn with_signer(mut self, keystore: Arc<ComponentKeyStore>) -> Result<Self, CryptoError> {
        keystore.register(INVARIANT_HEAD_COMPONENT)?;
        self.signer = Some(keystore);
        Ok(self)
    }
}

impl VotingHead for InvariantHead {
    fn kind(&self) -> HeadKind {
        HeadKind::Invariant
    }

    fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
        let reasons: Vec<DenyReason> = self
            .registry
            .triggered(&envelope.intent.action, &envelope.intent.resource)
            .into_iter()
            .map(|rule| {
                DenyReason::new(
                    rule.id.clone(),
                    format!("{} ({} on {})", rule.description, envelope.intent.action, envelope.intent.resource),
                )
            })
            .collect();

        let decision = if reasons.is_empty() {
            GateDecision::Allow
        } else {
            GateDecision::Deny
        };
        // A tripped root rule is always critical: the request targeted the
        // system's own substrate.
        let severity = if decision == GateDecision::Deny {
            Severity::Critical
        } else {
            Severity::Low
        };

        debug!(
            request_id = %envelope.request_id,
            decision = %decision,
            reason_count = reasons.len(),
            "Invariant head voted"
        );

        let mut vote = CerberusVote {
            request_id: envelope.request_id.clone(),
            head: HeadKind::Invariant,
            decision,
            reasons,
            constraints: ConstraintsApplied::default(),
            severity,
            signature: None,
            voted_at: Utc::now(),
        };

        if let Some(keystore) = &self.signer {
            if let Ok(content) = vote.signable_content() {
                vote.signature = keystore.sign_as(INVARIANT_HEAD_COMPONENT, &content).ok();
            }
        }

        vote
    }
}
