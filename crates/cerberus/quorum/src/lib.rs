//! Cerberus Quorum - folds independent head votes into one decision
//!
//! The engine never refuses to decide: malformed, missing, or empty vote
//! sets produce a deterministic deny, not an error. The baseline is always
//! the most restrictive vote present; a missed quorum can only make the
//! outcome stricter, never looser.

#![deny(unsafe_code)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cerberus_types::{
    CerberusDecision, CerberusVote, CommitPolicy, ConstraintsApplied, DenyReason,
    DeploymentProfile, GateDecision, HeadKind, QuorumOutcome, QuorumPolicy, RequestEnvelope,
    RequestId, Severity,
};

/// A voting head of the gate.
///
/// Evaluation is synchronous and side-effect free on the envelope; the
/// liveness monitor supplies deadlines and parallelism around this trait.
pub trait VotingHead: Send + Sync {
    fn kind(&self) -> HeadKind;

    /// Produce a vote. Heads run every check and collect every reason; they
    /// never short-circuit on the first failure.
    fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote;
}

/// Per-head vote weights used by the weighted and bft policies.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HeadWeights {
    pub identity: f64,
    pub capability: f64,
    pub invariant: f64,
}

impl HeadWeights {
    pub fn weight_of(&self, head: HeadKind) -> f64 {
        match head {
            HeadKind::Identity => self.identity,
            HeadKind::Capability => self.capability,
            HeadKind::Invariant => self.invariant,
        }
    }
}

impl Default for HeadWeights {
    fn default() -> Self {
        // The invariant head guards the system's own substrate, so its vote
        // carries extra weight.
        Self {
            identity: 1.0,
            capability: 1.0,
            invariant: 1.5,
        }
    }
}

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuorumConfig {
    pub policy: QuorumPolicy,
    #[serde(default)]
    pub weights: HeadWeights,
    /// Whether allowed commits must wait for block anchoring.
    pub require_anchor_append: bool,
    /// Whether allowed commits must present a matching shadow-run hash.
    pub require_shadow_hash_match: bool,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            policy: QuorumPolicy::Unanimous,
            weights: HeadWeights::default(),
            require_anchor_append: true,
            require_shadow_hash_match: true,
        }
    }
}

/// The quorum engine.
pub struct QuorumEngine {
    config: QuorumConfig,
}

impl QuorumEngine {
    pub fn new(config: QuorumConfig) -> Self {
        Self { config }
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.config.policy
    }

    /// Classify the deployment by policy and voter population. Genuine
    /// Byzantine tolerance of one faulty head needs at least four voters.
    pub fn profile(&self, voter_count: usize) -> DeploymentProfile {
        match self.config.policy {
            QuorumPolicy::Bft if voter_count >= 4 => DeploymentProfile::BftDeployed,
            QuorumPolicy::Bft => DeploymentProfile::BftReady,
            _ => DeploymentProfile::CrashSafe,
        }
    }

    /// Fold votes into the final decision. Total: always returns a decision.
    pub fn decide(&self, request_id: &RequestId, votes: &[CerberusVote]) -> CerberusDecision {
        if votes.is_empty() {
            warn!(request_id = %request_id, "No votes collected; denying");
            return self.empty_denial(request_id);
        }

        let voters: Vec<HeadKind> = votes.iter().map(|v| v.head).collect();
        let achieved = self.quorum_achieved(votes);

        let baseline = votes
            .iter()
            .map(|v| v.decision)
            .fold(GateDecision::Allow, GateDecision::most_restrictive);

        let mut reasons: Vec<DenyReason> = votes.iter().flat_map(|v| v.reasons.clone()).collect();

        // Fail closed: a missed quorum can downgrade an allow to a deny but
        // never relax a restrictive baseline.
        let final_decision = if !achieved && baseline == GateDecision::Allow {
            reasons.push(DenyReason::new(
                "QUORUM_NOT_ACHIEVED",
                format!("policy {} not satisfied by the collected votes", self.config.policy),
            ));
            GateDecision::Deny
        } else {
            baseline
        };

        let invariant_denied = votes
            .iter()
            .any(|v| v.head == HeadKind::Invariant && v.decision == GateDecision::Deny);
        let severity = if invariant_denied {
            Severity::Critical
        } else {
            match final_decision {
                GateDecision::Deny => Severity::High,
                GateDecision::Quarantine => Severity::Medium,
                GateDecision::Allow => Severity::Low,
            }
        };

        let constraints = votes
            .iter()
            .fold(ConstraintsApplied::default(), |acc, v| acc.merge(&v.constraints));

        let commit_policy = if final_decision == GateDecision::Allow {
            CommitPolicy {
                allowed: true,
                requires_anchor_append: self.config.require_anchor_append,
                requires_shadow_hash_match: self.config.require_shadow_hash_match,
            }
        } else {
            CommitPolicy::denied()
        };

        let signatures = votes.iter().filter_map(|v| v.signature.clone()).collect();

        debug!(
            request_id = %request_id,
            decision = %final_decision,
            severity = %severity,
            achieved = achieved,
            "Quorum decided"
        );

        CerberusDecision {
            request_id: request_id.clone(),
            final_decision,
            severity,
            quorum: QuorumOutcome {
                policy: self.config.policy,
                achieved,
                profile: self.profile(voters.len()),
                voters,
            },
            reasons,
            constraints,
            commit_policy,
            signatures,
            decided_at: Utc::now(),
        }
    }

    fn quorum_achieved(&self, votes: &[CerberusVote]) -> bool {
        let allow_count = votes
            .iter()
            .filter(|v| v.decision == GateDecision::Allow)
            .count();
        match self.config.policy {
            QuorumPolicy::Unanimous => allow_count == votes.len(),
            QuorumPolicy::TwoOfThree => allow_count >= 2,
            QuorumPolicy::WeightedMajority => {
                let (allow, total) = self.weighted_tally(votes);
                allow > total / 2.0
            }
            QuorumPolicy::Bft => {
                let (allow, total) = self.weighted_tally(votes);
                allow > total * 2.0 / 3.0
            }
        }
    }

    fn weighted_tally(&self, votes: &[CerberusVote]) -> (f64, f64) {
        let mut allow = 0.0;
        let mut total = 0.0;
        for vote in votes {
            let w = self.config.weights.weight_of(vote.head);
            total += w;
            if vote.decision == GateDecision::Allow {
                allow += w;
            }
        }
        (allow, total)
    }

    fn empty_denial(&self, request_id: &RequestId) -> CerberusDecision {
        CerberusDecision {
            request_id: request_id.clone(),
            final_decision: GateDecision::Deny,
            severity: Severity::Critical,
            quorum: QuorumOutcome {
                policy: self.config.policy,
                achieved: false,
                voters: Vec::new(),
                profile: self.profile(0),
            },
            reasons: vec![DenyReason::new(
                "QUORUM_NO_VOTES",
                "no head votes were collected for this request",
            )],
            constraints: ConstraintsApplied::default(),
            commit_policy: CommitPolicy::denied(),
            signatures: Vec::new(),
            decided_at: Utc::now(),
        }
    }
}

impl Default for QuorumEngine {
    fn default() -> Self {
        Self::new(QuorumConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid() -> RequestId {
        RequestId::new("req-quorum-test")
    }

    fn vote(head: HeadKind, decision: GateDecision) -> CerberusVote {
        CerberusVote {
            request_id: rid(),
            head,
            decision,
            reasons: if decision == GateDecision::Deny {
                vec![DenyReason::new("TEST_DENY", "test")]
            } else {
                vec![]
            },
            constraints: ConstraintsApplied::default(),
            severity: Severity::Low,
            signature: None,
            voted_at: Utc::now(),
        }
    }

    fn engine(policy: QuorumPolicy) -> QuorumEngine {
        QuorumEngine::new(QuorumConfig {
            policy,
            ..QuorumConfig::default()
        })
    }

    fn all_heads(decision: GateDecision) -> Vec<CerberusVote> {
        vec![
            vote(HeadKind::Identity, decision),
            vote(HeadKind::Capability, decision),
            vote(HeadKind::Invariant, decision),
        ]
    }

    #[test]
    fn test_unanimous_all_allow() {
        let decision = engine(QuorumPolicy::Unanimous).decide(&rid(), &all_heads(GateDecision::Allow));
        assert_eq!(decision.final_decision, GateDecision::Allow);
        assert!(decision.quorum.achieved);
        assert_eq!(decision.severity, Severity::Low);
        assert!(decision.commit_policy.allowed);
        assert!(decision.commit_policy.requires_anchor_append);
        assert!(decision.commit_policy.requires_shadow_hash_match);
    }

    #[test]
    fn test_unanimous_one_deny() {
        let mut votes = all_heads(GateDecision::Allow);
        votes[1] = vote(HeadKind::Capability, GateDecision::Deny);

        let decision = engine(QuorumPolicy::Unanimous).decide(&rid(), &votes);
        assert_eq!(decision.final_decision, GateDecision::Deny);
        assert!(!decision.quorum.achieved);
        assert_eq!(decision.severity, Severity::High);
        assert!(!decision.commit_policy.allowed);
        assert!(decision.reasons.iter().any(|r| r.code == "TEST_DENY"));
    }

    #[test]
    fn test_two_of_three_tolerates_one_deny() {
        let mut votes = all_heads(GateDecision::Allow);
        votes[0] = vote(HeadKind::Identity, GateDecision::Deny);

        let decision = engine(QuorumPolicy::TwoOfThree).decide(&rid(), &votes);
        // Quorum is met, but the baseline is still the most restrictive vote.
        assert!(decision.quorum.achieved);
        assert_eq!(decision.final_decision, GateDecision::Deny);
    }

    #[test]
    fn test_two_of_three_all_deny() {
        let decision = engine(QuorumPolicy::TwoOfThree).decide(&rid(), &all_heads(GateDecision::Deny));
        assert!(!decision.quorum.achieved);
        assert_eq!(decision.final_decision, GateDecision::Deny);
    }

    #[test]
    fn test_weighted_invariant_outweighs() {
        // Identity + capability allow (2.0) vs invariant deny (1.5):
        // 2.0 > 3.5/2, so the weighted quorum is met, but the most
        // restrictive baseline still denies, and invariant deny is critical.
        let mut votes = all_heads(GateDecision::Allow);
        votes[2] = vote(HeadKind::Invariant, GateDecision::Deny);

        let decision = engine(QuorumPolicy::WeightedMajority).decide(&rid(), &votes);
        assert!(decision.quorum.achieved);
        assert_eq!(decision.final_decision, GateDecision::Deny);
        assert_eq!(decision.severity, Severity::Critical);
    }

    #[test]
    fn test_bft_threshold() {
        // Invariant alone allows: 1.5 of 3.5 total is under 2/3.
        let mut votes = all_heads(GateDecision::Deny);
        votes[2] = vote(HeadKind::Invariant, GateDecision::Allow);
        let decision = engine(QuorumPolicy::Bft).decide(&rid(), &votes);
        assert!(!decision.quorum.achieved);

        // All three allow: 3.5 of 3.5 clears 2/3.
        let decision = engine(QuorumPolicy::Bft).decide(&rid(), &all_heads(GateDecision::Allow));
        assert!(decision.quorum.achieved);
        assert_eq!(decision.final_decision, GateDecision::Allow);
    }

    #[test]
    fn test_quarantine_baseline() {
        let mut votes = all_heads(GateDecision::Allow);
        votes[1] = vote(HeadKind::Capability, GateDecision::Quarantine);

        let decision = engine(QuorumPolicy::TwoOfThree).decide(&rid(), &votes);
        assert_eq!(decision.final_decision, GateDecision::Quarantine);
        assert_eq!(decision.severity, Severity::Medium);
        assert!(!decision.commit_policy.allowed);
    }

    #[test]
    fn test_missed_quorum_downgrades_allow() {
        // Single allow vote under unanimous-of-three expectations is fine,
        // but under 2of3 a lone allow misses quorum and fails closed.
        let votes = vec![vote(HeadKind::Identity, GateDecision::Allow)];
        let decision = engine(QuorumPolicy::TwoOfThree).decide(&rid(), &votes);
        assert!(!decision.quorum.achieved);
        assert_eq!(decision.final_decision, GateDecision::Deny);
        assert!(decision.reasons.iter().any(|r| r.code == "QUORUM_NOT_ACHIEVED"));
    }

    #[test]
    fn test_zero_votes_denies_critical() {
        let decision = engine(QuorumPolicy::Unanimous).decide(&rid(), &[]);
        assert_eq!(decision.final_decision, GateDecision::Deny);
        assert_eq!(decision.severity, Severity::Critical);
        assert!(!decision.quorum.achieved);
        assert!(decision.quorum.voters.is_empty());
        assert!(decision.reasons.iter().any(|r| r.code == "QUORUM_NO_VOTES"));
    }

    #[test]
    fn test_constraints_merged_strictest() {
        let mut votes = all_heads(GateDecision::Allow);
        votes[0].constraints = ConstraintsApplied {
            rate_limit_per_min: Some(60),
            require_shadow: false,
        };
        votes[1].constraints = ConstraintsApplied {
            rate_limit_per_min: Some(10),
            require_shadow: true,
        };

        let decision = engine(QuorumPolicy::Unanimous).decide(&rid(), &votes);
        assert_eq!(decision.constraints.rate_limit_per_min, Some(10));
        assert!(decision.constraints.require_shadow);
    }

    #[test]
    fn test_deployment_profiles() {
        let bft = engine(QuorumPolicy::Bft);
        assert_eq!(bft.profile(3), DeploymentProfile::BftReady);
        assert_eq!(bft.profile(4), DeploymentProfile::BftDeployed);
        assert_eq!(engine(QuorumPolicy::Unanimous).profile(3), DeploymentProfile::CrashSafe);
    }

    #[test]
    fn test_signatures_collected_per_voter() {
        let mut votes = all_heads(GateDecision::Allow);
        votes[0].signature = Some(cerberus_types::ComponentSignature {
            component: "identity-head".to_string(),
            alg: "ed25519".to_string(),
            bytes: vec![1; 64],
        });

        let decision = engine(QuorumPolicy::Unanimous).decide(&rid(), &votes);
        assert_eq!(decision.signatures.len(), 1);
        assert_eq!(decision.signatures[0].component, "identity-head");
    }
}
