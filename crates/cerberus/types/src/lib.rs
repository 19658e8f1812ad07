//! Cerberus Types - shared value types for the admission gate
//!
//! Every proposed mutation travels through the gate as a `RequestEnvelope`,
//! each voting head answers with a `CerberusVote`, and the quorum engine
//! folds the votes into a single `CerberusDecision`. These types are the
//! vocabulary the rest of the workspace speaks.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an admission request
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an execution record in the ledger
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("rec-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a capability token
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("cap-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decentralized identifier naming an actor or subject.
///
/// Well-formed DIDs look like `did:<method>:<segment>[:<segment>...]` with a
/// non-empty method and at least one namespace segment after it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Did(pub String);

impl Did {
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    /// Structural check only; resolution is a separate concern.
    pub fn is_wellformed(&self) -> bool {
        let mut parts = self.0.split(':');
        if parts.next() != Some("did") {
            return false;
        }
        let method = match parts.next() {
            Some(m) if !m.is_empty() => m,
            _ => return false,
        };
        if !method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return false;
        }
        let mut segments = 0;
        for seg in parts {
            if seg.is_empty() {
                return false;
            }
            segments += 1;
        }
        segments >= 1
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the actor wants to do, and to what
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Intent {
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl Intent {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            parameters: serde_json::Value::Null,
        }
    }
}

/// Ambient request context carried alongside the intent
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub trace_id: Option<String>,
    /// Device fingerprint presented by the caller, if any.
    pub device_attestation: Option<String>,
    #[serde(default)]
    pub risk_hints: Vec<String>,
}

/// The immutable envelope submitted to the gate.
///
/// Heads receive shared references; nothing in the pipeline mutates an
/// envelope after submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    /// Who is asking.
    pub actor: Did,
    /// Who the action is on behalf of (often the actor itself).
    pub subject: Did,
    pub capability_token_id: Option<TokenId>,
    pub intent: Intent,
    #[serde(default)]
    pub context: RequestContext,
    pub created_at: DateTime<Utc>,
}

impl RequestEnvelope {
    pub fn new(actor: Did, intent: Intent) -> Self {
        let subject = actor.clone();
        Self {
            request_id: RequestId::generate(),
            actor,
            subject,
            capability_token_id: None,
            intent,
            context: RequestContext::default(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a vote or a final decision.
///
/// Ordered by restrictiveness: `Allow < Quarantine < Deny`, so the most
/// restrictive of a set of decisions is simply their maximum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDecision {
    Allow,
    Quarantine,
    Deny,
}

impl GateDecision {
    pub fn most_restrictive(self, other: GateDecision) -> GateDecision {
        self.max(other)
    }

    pub fn allows_execution(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::Allow => write!(f, "allow"),
            GateDecision::Quarantine => write!(f, "quarantine"),
            GateDecision::Deny => write!(f, "deny"),
        }
    }
}

/// Severity attached to votes and final decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A coded reason explaining a deny or quarantine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyReason {
    /// Stable machine-readable code, e.g. `IDENTITY_REVOKED`.
    pub code: String,
    /// Human-readable detail for operators.
    pub detail: String,
}

impl DenyReason {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

/// Execution constraints a head attaches to an otherwise-allowed request.
///
/// Merging picks the strictest of each field: the lowest rate limit wins and
/// shadow-execution requirements are sticky.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintsApplied {
    /// Requests per minute ceiling, if any head imposed one.
    pub rate_limit_per_min: Option<u32>,
    /// Whether execution must run in shadow mode first.
    pub require_shadow: bool,
}

impl ConstraintsApplied {
    pub fn merge(&self, other: &ConstraintsApplied) -> ConstraintsApplied {
        let rate_limit_per_min = match (self.rate_limit_per_min, other.rate_limit_per_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        ConstraintsApplied {
            rate_limit_per_min,
            require_shadow: self.require_shadow || other.require_shadow,
        }
    }
}

/// The independent voting heads of the gate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadKind {
    Identity,
    Capability,
    Invariant,
}

impl fmt::Display for HeadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadKind::Identity => write!(f, "identity"),
            HeadKind::Capability => write!(f, "capability"),
            HeadKind::Invariant => write!(f, "invariant"),
        }
    }
}

/// A detached signature produced by a named component key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSignature {
    /// Name of the signing component in the key store.
    pub component: String,
    /// Signature algorithm; always `ed25519` today.
    pub alg: String,
    /// Raw signature bytes.
    pub bytes: Vec<u8>,
}

/// One head's verdict on a request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CerberusVote {
    pub request_id: RequestId,
    pub head: HeadKind,
    pub decision: GateDecision,
    /// Every reason the head found; heads never short-circuit.
    pub reasons: Vec<DenyReason>,
    #[serde(default)]
    pub constraints: ConstraintsApplied,
    pub severity: Severity,
    pub signature: Option<ComponentSignature>,
    pub voted_at: DateTime<Utc>,
}

impl CerberusVote {
    /// A clean allow with no reasons or constraints.
    pub fn allow(request_id: RequestId, head: HeadKind) -> Self {
        Self {
            request_id,
            head,
            decision: GateDecision::Allow,
            reasons: Vec::new(),
            constraints: ConstraintsApplied::default(),
            severity: Severity::Low,
            signature: None,
            voted_at: Utc::now(),
        }
    }

    /// Canonical bytes a head signs: the vote with its signature slot empty.
    pub fn signable_content(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        canonical_json(&unsigned)
    }

    pub fn deny(
        request_id: RequestId,
        head: HeadKind,
        reasons: Vec<DenyReason>,
        severity: Severity,
    ) -> Self {
        Self {
            request_id,
            head,
            decision: GateDecision::Deny,
            reasons,
            constraints: ConstraintsApplied::default(),
            severity,
            signature: None,
            voted_at: Utc::now(),
        }
    }
}

/// Quorum policies the engine understands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Every vote must be allow.
    Unanimous,
    /// At least two allow votes.
    TwoOfThree,
    /// Weighted allow total strictly above half the total weight.
    WeightedMajority,
    /// Weighted allow total strictly above two thirds of the total weight.
    Bft,
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumPolicy::Unanimous => write!(f, "unanimous"),
            QuorumPolicy::TwoOfThree => write!(f, "2of3"),
            QuorumPolicy::WeightedMajority => write!(f, "weighted_majority"),
            QuorumPolicy::Bft => write!(f, "bft"),
        }
    }
}

/// How the current head population classifies for fault tolerance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentProfile {
    /// Tolerates crash faults only.
    CrashSafe,
    /// BFT policy configured but fewer than four voters present.
    BftReady,
    /// BFT policy with enough voters to tolerate one Byzantine head.
    BftDeployed,
}

/// How the quorum turned out for one decision
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuorumOutcome {
    pub policy: QuorumPolicy,
    pub achieved: bool,
    /// Heads whose votes were counted.
    pub voters: Vec<HeadKind>,
    pub profile: DeploymentProfile,
}

/// What the executor is permitted to do after the decision
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPolicy {
    pub allowed: bool,
    /// Sealed block containing the record must be anchored externally.
    pub requires_anchor_append: bool,
    /// Shadow-run hash must match before the commit lands.
    pub requires_shadow_hash_match: bool,
}

impl CommitPolicy {
    pub fn denied() -> Self {
        Self {
            allowed: false,
            requires_anchor_append: false,
            requires_shadow_hash_match: false,
        }
    }
}

/// The gate's final, signed answer for one request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CerberusDecision {
    pub request_id: RequestId,
    pub final_decision: GateDecision,
    pub severity: Severity,
    pub quorum: QuorumOutcome,
    /// Union of the votes' reasons, in head order.
    pub reasons: Vec<DenyReason>,
    pub constraints: ConstraintsApplied,
    pub commit_policy: CommitPolicy,
    /// One signature per voting head that signed its vote.
    pub signatures: Vec<ComponentSignature>,
    pub decided_at: DateTime<Utc>,
}

impl CerberusDecision {
    pub fn is_allowed(&self) -> bool {
        self.final_decision.allows_execution()
    }
}

/// Per-stage outcome recorded alongside an execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub passed: bool,
}

/// What actually happened, written to the durable ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub record_id: RecordId,
    pub request_id: RequestId,
    pub actor: Did,
    pub action: String,
    pub resource: String,
    pub decision: GateDecision,
    /// Commit identifier assigned by the canonical store, when one landed.
    pub commit_id: Option<String>,
    /// Hash of the state diff the execution produced.
    pub diff_hash: Option<String>,
    #[serde(default)]
    pub stage_results: Vec<StageOutcome>,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn from_decision(envelope: &RequestEnvelope, decision: &CerberusDecision) -> Self {
        Self {
            record_id: RecordId::generate(),
            request_id: envelope.request_id.clone(),
            actor: envelope.actor.clone(),
            action: envelope.intent.action.clone(),
            resource: envelope.intent.resource.clone(),
            decision: decision.final_decision,
            commit_id: None,
            diff_hash: None,
            stage_results: decision
                .quorum
                .voters
                .iter()
                .map(|head| StageOutcome {
                    stage: head.to_string(),
                    passed: decision.final_decision.allows_execution(),
                })
                .collect(),
            recorded_at: Utc::now(),
        }
    }
}

/// Serialize a value to canonical bytes: JSON with lexicographically sorted
/// object keys. All signed and hashed content in the workspace goes through
/// here so signatures stay stable across field reordering.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    // Round-trip through Value: serde_json's map is a BTreeMap, so object
    // keys come out sorted.
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}
