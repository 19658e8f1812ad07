//! Mock voting heads for gate tests.

use std::time::Duration;

use cerberus_quorum::VotingHead;
use cerberus_types::{
    CerberusVote, ConstraintsApplied, DenyReason, GateDecision, HeadKind, RequestEnvelope,
    Severity,
};
use chrono::Utc;

/// A head that always returns the same decision.
pub struct StaticHead {
    kind: HeadKind,
    decision: GateDecision,
    reasons: Vec<DenyReason>,
    constraints: ConstraintsApplied,
}

impl StaticHead {
    pub fn allow(kind: HeadKind) -> Self {
        Self {
            kind,
            decision: GateDecision::Allow,
            reasons: Vec::new(),
            constraints: ConstraintsApplied::default(),
        }
    }

    pub fn deny(kind: HeadKind, code: &str) -> Self {
        Self {
            kind,
            decision: GateDecision::Deny,
            reasons: vec![DenyReason::new(code, "mock denial")],
            constraints: ConstraintsApplied::default(),
        }
    }

    pub fn quarantine(kind: HeadKind, code: &str) -> Self {
        Self {
            kind,
            decision: GateDecision::Quarantine,
            reasons: vec![DenyReason::new(code, "mock quarantine")],
            constraints: ConstraintsApplied::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: ConstraintsApplied) -> Self {
        self.constraints = constraints;
        self
    }
}

impl VotingHead for StaticHead {
    fn kind(&self) -> HeadKind {
        self.kind
    }

    fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
        CerberusVote {
            request_id: envelope.request_id.clone(),
            head: self.kind,
            decision: self.decision,
            reasons: self.reasons.clone(),
            constraints: self.constraints.clone(),
            severity: match self.decision {
                GateDecision::Allow => Severity::Low,
                GateDecision::Quarantine => Severity::Medium,
                GateDecision::Deny => Severity::High,
            },
            signature: None,
            voted_at: Utc::now(),
        }
    }
}

/// A head that sleeps past any reasonable deadline before answering.
pub struct HangingHead {
    kind: HeadKind,
    delay: Duration,
}

impl HangingHead {
    pub fn new(kind: HeadKind, delay: Duration) -> Self {
        Self { kind, delay }
    }
}

impl VotingHead for HangingHead {
    fn kind(&self) -> HeadKind {
        self.kind
    }

    fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
        std::thread::sleep(self.delay);
        CerberusVote::allow(envelope.request_id.clone(), self.kind)
    }
}
