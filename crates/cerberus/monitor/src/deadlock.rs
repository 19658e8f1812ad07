//! Pipeline watchdog: times requests through the gate and flags the stuck.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::warn;

use cerberus_types::RequestId;

/// Deadlock detector configuration
#[derive(Clone, Debug)]
pub struct DeadlockConfig {
    /// Longest a request may sit in any single stage.
    pub stage_ceiling: Duration,
    /// Longest a request may spend in the pipeline overall.
    pub pipeline_ceiling: Duration,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            stage_ceiling: Duration::from_secs(5),
            pipeline_ceiling: Duration::from_secs(15),
        }
    }
}

struct Inflight {
    stage: String,
    started: Instant,
    stage_entered: Instant,
    orphaned: bool,
}

/// A stuck or in-flight request as seen by the detector
#[derive(Clone, Debug)]
pub struct InflightSnapshot {
    pub request_id: RequestId,
    pub stage: String,
    pub in_stage: Duration,
    pub total: Duration,
    /// True once the submission that began tracking no longer owns the
    /// entry, so nothing else will ever complete it.
    pub orphaned: bool,
}

/// Tracks requests through the pipeline and reports the ones that exceed
/// their stage or total ceilings. Aborting a stuck request removes it from
/// tracking; the caller synthesizes the deny.
pub struct DeadlockDetector {
    config: DeadlockConfig,
    inflight: RwLock<HashMap<String, Inflight>>,
}

impl DeadlockDetector {
    pub fn new(config: DeadlockConfig) -> Self {
        Self {
            config,
            inflight: RwLock::new(HashMap::new()),
        }
    }

    pub fn begin(&self, request_id: &RequestId) {
        let Ok(mut inflight) = self.inflight.write() else {
            return;
        };
        let now = Instant::now();
        inflight.insert(
            request_id.0.clone(),
            Inflight {
                stage: "submitted".to_string(),
                started: now,
                stage_entered: now,
                orphaned: false,
            },
        );
    }

    pub fn enter_stage(&self, request_id: &RequestId, stage: &str) {
        let Ok(mut inflight) = self.inflight.write() else {
            return;
        };
        if let Some(entry) = inflight.get_mut(&request_id.0) {
            entry.stage = stage.to_string();
            entry.stage_entered = Instant::now();
        }
    }

    /// Finish tracking a request; returns its total pipeline time.
    pub fn complete(&self, request_id: &RequestId) -> Option<Duration> {
        let mut inflight = self.inflight.write().ok()?;
        inflight
            .remove(&request_id.0)
            .map(|entry| entry.started.elapsed())
    }

    /// Mark a request as abandoned by its submission: nothing else will
    /// complete it, so it is safe to force-abort once stuck.
    pub fn mark_orphaned(&self, request_id: &RequestId) {
        let Ok(mut inflight) = self.inflight.write() else {
            return;
        };
        if let Some(entry) = inflight.get_mut(&request_id.0) {
            entry.orphaned = true;
        }
    }

    /// Requests past either ceiling.
    pub fn stuck(&self) -> Vec<InflightSnapshot> {
        let Ok(inflight) = self.inflight.read() else {
            return Vec::new();
        };
        inflight
            .iter()
            .filter_map(|(id, entry)| {
                let in_stage = entry.stage_entered.elapsed();
                let total = entry.started.elapsed();
                if in_stage >= self.config.stage_ceiling || total >= self.config.pipeline_ceiling {
                    Some(InflightSnapshot {
                        request_id: RequestId::new(id.clone()),
                        stage: entry.stage.clone(),
                        in_stage,
                        total,
                        orphaned: entry.orphaned,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Remove a request from tracking so the caller can deny it.
    pub fn force_abort(&self, request_id: &RequestId) -> Option<InflightSnapshot> {
        let mut inflight = self.inflight.write().ok()?;
        let entry = inflight.remove(&request_id.0)?;
        let snapshot = InflightSnapshot {
            request_id: request_id.clone(),
            stage: entry.stage.clone(),
            in_stage: entry.stage_entered.elapsed(),
            total: entry.started.elapsed(),
            orphaned: entry.orphaned,
        };
        warn!(
            request_id = %request_id,
            stage = %snapshot.stage,
            total_ms = snapshot.total.as_millis() as u64,
            "Force-aborted stuck request"
        );
        Some(snapshot)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.read().map(|i| i.len()).unwrap_or(0)
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new(DeadlockConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_detector() -> DeadlockDetector {
        DeadlockDetector::new(DeadlockConfig {
            stage_ceiling: Duration::from_millis(20),
            pipeline_ceiling: Duration::from_millis(50),
        })
    }

    #[test]
    fn test_begin_and_complete() {
        let detector = tight_detector();
        let id = RequestId::new("req-1");

        detector.begin(&id);
        assert_eq!(detector.inflight_count(), 1);

        let total = detector.complete(&id).expect("tracked request completes");
        assert!(total < Duration::from_secs(1));
        assert_eq!(detector.inflight_count(), 0);

        assert!(detector.complete(&id).is_none());
    }

    #[test]
    fn test_fresh_request_not_stuck() {
        let detector = tight_detector();
        let id = RequestId::new("req-1");
        detector.begin(&id);
        assert!(detector.stuck().is_empty());
    }

    #[test]
    fn test_stage_ceiling_flags_stuck() {
        let detector = tight_detector();
        let id = RequestId::new("req-1");
        detector.begin(&id);
        detector.enter_stage(&id, "quorum");

        std::thread::sleep(Duration::from_millis(30));

        let stuck = detector.stuck();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].request_id, id);
        assert_eq!(stuck[0].stage, "quorum");
    }

    #[test]
    fn test_stage_transition_resets_stage_timer() {
        let detector = DeadlockDetector::new(DeadlockConfig {
            stage_ceiling: Duration::from_millis(30),
            pipeline_ceiling: Duration::from_secs(10),
        });
        let id = RequestId::new("req-1");
        detector.begin(&id);

        std::thread::sleep(Duration::from_millis(20));
        detector.enter_stage(&id, "ledger");
        std::thread::sleep(Duration::from_millis(20));

        // Neither stage exceeded its ceiling, total is under the pipeline
        // ceiling.
        assert!(detector.stuck().is_empty());
    }

    #[test]
    fn test_mark_orphaned_reflected_in_snapshots() {
        let detector = tight_detector();
        let id = RequestId::new("req-1");
        detector.begin(&id);
        std::thread::sleep(Duration::from_millis(30));

        assert!(!detector.stuck()[0].orphaned);

        detector.mark_orphaned(&id);
        assert!(detector.stuck()[0].orphaned);
        assert!(detector.force_abort(&id).expect("still tracked").orphaned);
    }

    #[test]
    fn test_force_abort_removes() {
        let detector = tight_detector();
        let id = RequestId::new("req-1");
        detector.begin(&id);
        detector.enter_stage(&id, "quorum");
        std::thread::sleep(Duration::from_millis(30));

        let snapshot = detector.force_abort(&id).expect("stuck request aborts");
        assert_eq!(snapshot.stage, "quorum");
        assert_eq!(detector.inflight_count(), 0);
        assert!(detector.force_abort(&id).is_none());
    }
}
