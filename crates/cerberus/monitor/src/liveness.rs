//! Per-head deadlines and health tracking.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use cerberus_quorum::VotingHead;
use cerberus_types::{
    CerberusVote, ConstraintsApplied, DenyReason, GateDecision, HeadKind, RequestEnvelope,
    Severity,
};

/// Liveness status of a head
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadStatus {
    Alive,
    Degraded,
    Failed,
}

impl std::fmt::Display for HeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeadStatus::Alive => write!(f, "alive"),
            HeadStatus::Degraded => write!(f, "degraded"),
            HeadStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Health snapshot for one head
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeadHealth {
    pub head: HeadKind,
    pub status: HeadStatus,
    pub consecutive_timeouts: u32,
    pub evaluations: u64,
    pub timeouts: u64,
    pub last_latency_ms: Option<u64>,
}

impl HeadHealth {
    fn new(head: HeadKind) -> Self {
        Self {
            head,
            status: HeadStatus::Alive,
            consecutive_timeouts: 0,
            evaluations: 0,
            timeouts: 0,
            last_latency_ms: None,
        }
    }
}

/// Liveness monitor configuration
#[derive(Clone, Debug)]
pub struct LivenessConfig {
    /// Hard deadline per head evaluation.
    pub head_timeout: Duration,
    /// Consecutive timeouts before a head is reported degraded.
    pub degraded_after: u32,
    /// Consecutive timeouts before a head is reported failed.
    pub failed_after: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            head_timeout: Duration::from_secs(2),
            degraded_after: 1,
            failed_after: 3,
        }
    }
}

/// Runs head evaluations under a hard deadline.
///
/// A head that misses its deadline gets a deny vote synthesized on its
/// behalf, so one hung head slows a request by at most the timeout and
/// fails closed. The abandoned evaluation keeps running on its blocking
/// thread; its eventual result is discarded.
pub struct LivenessMonitor {
    config: LivenessConfig,
    health: RwLock<HashMap<HeadKind, HeadHealth>>,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate a head against an envelope, enforcing the deadline.
    pub async fn evaluate(&self, head: Arc<dyn VotingHead>, envelope: RequestEnvelope) -> CerberusVote {
        let kind = head.kind();
        let request_id = envelope.request_id.clone();
        let started = Instant::now();

        let handle = tokio::task::spawn_blocking(move || head.evaluate(&envelope));

        match tokio::time::timeout(self.config.head_timeout, handle).await {
            Ok(Ok(vote)) => {
                self.record_success(kind, started.elapsed());
                vote
            }
            Ok(Err(join_error)) => {
                warn!(head = %kind, request_id = %request_id, error = %join_error, "Head evaluation aborted");
                self.record_timeout(kind);
                self.default_vote(kind, &request_id, "HEAD_FAILED", "head evaluation aborted before producing a vote")
            }
            Err(_) => {
                warn!(
                    head = %kind,
                    request_id = %request_id,
                    timeout_ms = self.config.head_timeout.as_millis() as u64,
                    "Head evaluation timed out; voting deny on its behalf"
                );
                self.record_timeout(kind);
                self.default_vote(kind, &request_id, "HEAD_TIMEOUT", "head missed its evaluation deadline")
            }
        }
    }

    fn default_vote(
        &self,
        kind: HeadKind,
        request_id: &cerberus_types::RequestId,
        code: &str,
        detail: &str,
    ) -> CerberusVote {
        CerberusVote {
            request_id: request_id.clone(),
            head: kind,
            decision: GateDecision::Deny,
            reasons: vec![DenyReason::new(code, detail)],
            constraints: ConstraintsApplied::default(),
            severity: Severity::High,
            signature: None,
            voted_at: Utc::now(),
        }
    }

    fn record_success(&self, kind: HeadKind, latency: Duration) {
        let Ok(mut health) = self.health.write() else {
            return;
        };
        let entry = health.entry(kind).or_insert_with(|| HeadHealth::new(kind));
        entry.evaluations += 1;
        entry.consecutive_timeouts = 0;
        entry.status = HeadStatus::Alive;
        entry.last_latency_ms = Some(latency.as_millis() as u64);
        debug!(head = %kind, latency_ms = latency.as_millis() as u64, "Head evaluation completed");
    }

    fn record_timeout(&self, kind: HeadKind) {
        let Ok(mut health) = self.health.write() else {
            return;
        };
        let entry = health.entry(kind).or_insert_with(|| HeadHealth::new(kind));
        entry.evaluations += 1;
        entry.timeouts += 1;
        entry.consecutive_timeouts += 1;
        entry.status = if entry.consecutive_timeouts >= self.config.failed_after {
            HeadStatus::Failed
        } else if entry.consecutive_timeouts >= self.config.degraded_after {
            HeadStatus::Degraded
        } else {
            HeadStatus::Alive
        };
    }

    pub fn head_health(&self, kind: HeadKind) -> Option<HeadHealth> {
        self.health.read().ok()?.get(&kind).cloned()
    }

    pub fn snapshot(&self) -> Vec<HeadHealth> {
        self.health
            .read()
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerberus_types::{Did, Intent};

    struct PromptHead;

    impl VotingHead for PromptHead {
        fn kind(&self) -> HeadKind {
            HeadKind::Identity
        }

        fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
            CerberusVote::allow(envelope.request_id.clone(), HeadKind::Identity)
        }
    }

    struct HangingHead {
        sleep: Duration,
    }

    impl VotingHead for HangingHead {
        fn kind(&self) -> HeadKind {
            HeadKind::Capability
        }

        fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
            std::thread::sleep(self.sleep);
            CerberusVote::allow(envelope.request_id.clone(), HeadKind::Capability)
        }
    }

    fn envelope() -> RequestEnvelope {
        RequestEnvelope::new(
            Did::new("did:cerberus:test:alice"),
            Intent::new("write", "state://profile/alice"),
        )
    }

    fn fast_monitor() -> LivenessMonitor {
        LivenessMonitor::new(LivenessConfig {
            head_timeout: Duration::from_millis(50),
            degraded_after: 1,
            failed_after: 3,
        })
    }

    #[tokio::test]
    async fn test_prompt_head_passes_through() {
        let monitor = fast_monitor();
        let vote = monitor.evaluate(Arc::new(PromptHead), envelope()).await;
        assert_eq!(vote.decision, GateDecision::Allow);

        let health = monitor.head_health(HeadKind::Identity).unwrap();
        assert_eq!(health.status, HeadStatus::Alive);
        assert_eq!(health.evaluations, 1);
        assert!(health.last_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_deny() {
        let monitor = fast_monitor();
        let head = Arc::new(HangingHead {
            sleep: Duration::from_millis(300),
        });

        let vote = monitor.evaluate(head, envelope()).await;
        assert_eq!(vote.decision, GateDecision::Deny);
        assert_eq!(vote.head, HeadKind::Capability);
        assert_eq!(vote.reasons[0].code, "HEAD_TIMEOUT");
        assert_eq!(vote.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_consecutive_timeouts_demote() {
        let monitor = fast_monitor();
        let head = Arc::new(HangingHead {
            sleep: Duration::from_millis(300),
        });

        monitor.evaluate(head.clone(), envelope()).await;
        let health = monitor.head_health(HeadKind::Capability).unwrap();
        assert_eq!(health.status, HeadStatus::Degraded);

        monitor.evaluate(head.clone(), envelope()).await;
        monitor.evaluate(head, envelope()).await;
        let health = monitor.head_health(HeadKind::Capability).unwrap();
        assert_eq!(health.status, HeadStatus::Failed);
        assert_eq!(health.consecutive_timeouts, 3);
        assert_eq!(health.timeouts, 3);
    }

    #[tokio::test]
    async fn test_success_resets_status() {
        let monitor = fast_monitor();
        let slow = Arc::new(HangingHead {
            sleep: Duration::from_millis(300),
        });

        monitor.evaluate(slow, envelope()).await;

        // The same head kind recovering.
        struct PromptCapability;
        impl VotingHead for PromptCapability {
            fn kind(&self) -> HeadKind {
                HeadKind::Capability
            }
            fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
                CerberusVote::allow(envelope.request_id.clone(), HeadKind::Capability)
            }
        }
        monitor.evaluate(Arc::new(PromptCapability), envelope()).await;

        let health = monitor.head_health(HeadKind::Capability).unwrap();
        assert_eq!(health.status, HeadStatus::Alive);
        assert_eq!(health.consecutive_timeouts, 0);
        assert_eq!(health.timeouts, 1);
    }
}
