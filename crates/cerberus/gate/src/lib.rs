//! Cerberus Gate - the admission boundary for canonical state
//!
//! `CerberusGate::submit` evaluates every registered head in parallel under
//! the liveness monitor's deadlines, folds the votes through the quorum
//! engine, and always returns a decision. Executions are recorded in the
//! durable ledger; sealed blocks can be anchored through the timestamp
//! authority.

#![deny(unsafe_code)]

pub mod mocks;

use chrono::Utc;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

use cerberus_ledger::{AppendReceipt, DurableLedger, LedgerBlock, LedgerError};
use cerberus_monitor::{
    DeadlockConfig, DeadlockDetector, FailureDetector, FailureDetectorConfig, HeadHealth,
    InflightSnapshot, LivenessConfig, LivenessMonitor,
};
use cerberus_quorum::{QuorumConfig, QuorumEngine, VotingHead};
use cerberus_types::{
    CerberusDecision, CerberusVote, CommitPolicy, ConstraintsApplied, DenyReason,
    ExecutionRecord, GateDecision, QuorumOutcome, RequestEnvelope, RequestId, Severity,
};

/// Gate errors
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Lock error")]
    LockError,
}

/// Gate configuration
#[derive(Clone, Debug, Default)]
pub struct GateConfig {
    pub quorum: QuorumConfig,
    pub liveness: LivenessConfig,
    pub deadlock: DeadlockConfig,
    pub failure: FailureDetectorConfig,
    /// Records per sealed ledger block.
    pub ledger_block_size: usize,
}

/// Ledger counters surfaced by the gate
#[derive(Clone, Copy, Debug)]
pub struct LedgerStats {
    pub total_records: usize,
    pub pending_records: usize,
    pub sealed_blocks: usize,
}

// Ties a tracked submission to the future driving it: a submission dropped
// mid-flight is marked orphaned so `abort_stuck` can claim it without racing
// a live `submit`.
struct TrackingGuard<'a> {
    deadlock: &'a DeadlockDetector,
    request_id: RequestId,
    completed: bool,
}

impl TrackingGuard<'_> {
    fn finish(mut self) {
        self.completed = true;
        self.deadlock.complete(&self.request_id);
    }
}

impl Drop for TrackingGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.deadlock.mark_orphaned(&self.request_id);
        }
    }
}

/// The multi-head admission gate.
pub struct CerberusGate {
    heads: Vec<Arc<dyn VotingHead>>,
    engine: QuorumEngine,
    liveness: LivenessMonitor,
    deadlock: DeadlockDetector,
    failure: FailureDetector,
    // Single-writer ledger; every append goes through this lock.
    ledger: Mutex<DurableLedger>,
}

impl CerberusGate {
    pub fn new(config: GateConfig) -> Self {
        let block_size = if config.ledger_block_size == 0 {
            16
        } else {
            config.ledger_block_size
        };
        Self {
            heads: Vec::new(),
            engine: QuorumEngine::new(config.quorum),
            liveness: LivenessMonitor::new(config.liveness),
            deadlock: DeadlockDetector::new(config.deadlock),
            failure: FailureDetector::new(config.failure),
            ledger: Mutex::new(DurableLedger::new(block_size)),
        }
    }

    pub fn with_head(mut self, head: Arc<dyn VotingHead>) -> Self {
        self.heads.push(head);
        self
    }

    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    /// Evaluate a request. Heads run in parallel, each under the liveness
    /// deadline; the quorum engine folds whatever votes come back. Always
    /// returns a decision, even with zero heads registered.
    pub async fn submit(&self, envelope: RequestEnvelope) -> CerberusDecision {
        let request_id = envelope.request_id.clone();
        info!(
            request_id = %request_id,
            actor = %envelope.actor,
            action = %envelope.intent.action,
            resource = %envelope.intent.resource,
            "Gate submission"
        );

        self.deadlock.begin(&request_id);
        let tracking = TrackingGuard {
            deadlock: &self.deadlock,
            request_id: request_id.clone(),
            completed: false,
        };
        self.deadlock.enter_stage(&request_id, "heads");

        let evaluations = self
            .heads
            .iter()
            .map(|head| self.liveness.evaluate(head.clone(), envelope.clone()));
        let votes: Vec<CerberusVote> = futures::future::join_all(evaluations).await;

        self.record_head_outcomes(&votes);

        self.deadlock.enter_stage(&request_id, "quorum");
        let decision = self.engine.decide(&request_id, &votes);
        tracking.finish();

        info!(
            request_id = %request_id,
            decision = %decision.final_decision,
            severity = %decision.severity,
            quorum_achieved = decision.quorum.achieved,
            "Gate decided"
        );
        decision
    }

    fn record_head_outcomes(&self, votes: &[CerberusVote]) {
        for vote in votes {
            let component = format!("{}-head", vote.head);
            let synthesized = vote
                .reasons
                .iter()
                .any(|r| r.code == "HEAD_TIMEOUT" || r.code == "HEAD_FAILED");
            if synthesized {
                self.failure.record_failure(&component);
            } else {
                self.failure.record_success(&component);
            }
        }
    }

    /// Append an execution record to the durable ledger.
    pub fn record_execution(&self, record: ExecutionRecord) -> Result<AppendReceipt, GateError> {
        let mut ledger = self.ledger.lock().map_err(|_| GateError::LockError)?;
        Ok(ledger.append(record)?)
    }

    /// Convenience: record the outcome of a decided envelope.
    pub fn record_outcome(
        &self,
        envelope: &RequestEnvelope,
        decision: &CerberusDecision,
    ) -> Result<AppendReceipt, GateError> {
        self.record_execution(ExecutionRecord::from_decision(envelope, decision))
    }

    pub fn force_seal(&self) -> Result<Option<LedgerBlock>, GateError> {
        let mut ledger = self.ledger.lock().map_err(|_| GateError::LockError)?;
        Ok(ledger.force_seal())
    }

    pub fn anchor_block(&self, block_id: u64, anchor_hash: &str) -> Result<bool, GateError> {
        let mut ledger = self.ledger.lock().map_err(|_| GateError::LockError)?;
        Ok(ledger.anchor_block(block_id, anchor_hash))
    }

    pub fn verify_ledger(&self) -> Result<bool, GateError> {
        let ledger = self.ledger.lock().map_err(|_| GateError::LockError)?;
        Ok(ledger.verify_chain())
    }

    pub fn ledger_stats(&self) -> Result<LedgerStats, GateError> {
        let ledger = self.ledger.lock().map_err(|_| GateError::LockError)?;
        Ok(LedgerStats {
            total_records: ledger.total_records(),
            pending_records: ledger.pending_record_count(),
            sealed_blocks: ledger.sealed_block_count(),
        })
    }

    pub fn head_health(&self) -> Vec<HeadHealth> {
        self.liveness.snapshot()
    }

    pub fn failure_detector(&self) -> &FailureDetector {
        &self.failure
    }

    pub fn stuck_requests(&self) -> Vec<InflightSnapshot> {
        self.deadlock.stuck()
    }

    /// Deny every orphaned request past its pipeline ceilings and stop
    /// tracking it. A request whose `submit` future is still running is left
    /// alone: that future delivers the one decision for its request id.
    pub fn abort_stuck(&self) -> Vec<CerberusDecision> {
        self.stuck_requests()
            .into_iter()
            .filter(|snapshot| snapshot.orphaned)
            .filter_map(|snapshot| {
                let aborted = self.deadlock.force_abort(&snapshot.request_id)?;
                warn!(request_id = %aborted.request_id, stage = %aborted.stage, "Denying stuck request");
                Some(self.stuck_denial(&aborted))
            })
            .collect()
    }

    fn stuck_denial(&self, snapshot: &InflightSnapshot) -> CerberusDecision {
        CerberusDecision {
            request_id: snapshot.request_id.clone(),
            final_decision: GateDecision::Deny,
            severity: Severity::High,
            quorum: QuorumOutcome {
                policy: self.engine.policy(),
                achieved: false,
                voters: Vec::new(),
                profile: self.engine.profile(0),
            },
            reasons: vec![DenyReason::new(
                "PIPELINE_STUCK",
                format!(
                    "request exceeded pipeline ceilings in stage {} after {}ms",
                    snapshot.stage,
                    snapshot.total.as_millis()
                ),
            )],
            constraints: ConstraintsApplied::default(),
            commit_policy: CommitPolicy::denied(),
            signatures: Vec::new(),
            decided_at: Utc::now(),
        }
    }

    /// Synthesize a denial for a request id outside the normal pipeline.
    /// Used when a submission cannot even be dispatched.
    pub fn administrative_denial(&self, request_id: &RequestId, code: &str, detail: &str) -> CerberusDecision {
        CerberusDecision {
            request_id: request_id.clone(),
            final_decision: GateDecision::Deny,
            severity: Severity::High,
            quorum: QuorumOutcome {
                policy: self.engine.policy(),
                achieved: false,
                voters: Vec::new(),
                profile: self.engine.profile(0),
            },
            reasons: vec![DenyReason::new(code, detail)],
            constraints: ConstraintsApplied::default(),
            commit_policy: CommitPolicy::denied(),
            signatures: Vec::new(),
            decided_at: Utc::now(),
        }
    }
}
