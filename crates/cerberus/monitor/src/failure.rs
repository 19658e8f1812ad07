//! Per-component failure detection behind a circuit breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// State of a component's circuit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Failure rate tripped the breaker.
    Open,
    /// Probing whether the component recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Failure detector configuration
#[derive(Clone, Debug)]
pub struct FailureDetectorConfig {
    /// Sliding window length, in samples.
    pub window: usize,
    /// Samples needed before the failure rate is trusted.
    pub min_samples: usize,
    /// Failure rate that opens the circuit.
    pub failure_threshold: f64,
    /// How long a circuit stays open before a recovery probe.
    pub recovery_timeout: Duration,
    /// Open circuits that together constitute a cascade.
    pub cascade_threshold: usize,
    /// Z-score above which a failure rate counts as anomalous.
    pub zscore_threshold: f64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 3,
            failure_threshold: 0.5,
            recovery_timeout: Duration::from_secs(30),
            cascade_threshold: 2,
            zscore_threshold: 3.0,
        }
    }
}

/// Recommendation attached to a cascade alert
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeRecommendation {
    Investigate,
    Halt,
}

/// Raised when open circuits reach the cascade threshold
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CascadeAlert {
    pub open_components: Vec<String>,
    pub open_count: usize,
    pub threshold: usize,
    pub recommendation: CascadeRecommendation,
    pub raised_at: DateTime<Utc>,
}

/// Health snapshot for one tracked component
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub state: CircuitState,
    pub failure_rate: f64,
    pub samples: usize,
    pub total_failures: u64,
    pub total_successes: u64,
}

struct Tracker {
    state: CircuitState,
    window: VecDeque<bool>,
    rate_history: Vec<f64>,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            rate_history: Vec::new(),
            opened_at: None,
            total_failures: 0,
            total_successes: 0,
        }
    }

    fn push_sample(&mut self, failed: bool, window: usize, history_cap: usize) {
        self.window.push_back(failed);
        while self.window.len() > window {
            self.window.pop_front();
        }
        if self.rate_history.len() >= history_cap {
            self.rate_history.remove(0);
        }
        self.rate_history.push(self.failure_rate());
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / self.window.len() as f64
    }
}

type CascadeHook = Box<dyn Fn(&CascadeAlert) + Send + Sync>;

/// Tracks component failure rates over sliding windows and trips a circuit
/// breaker per component. Advisory by design: the gate keeps deciding while
/// circuits are open; callers that want to shed load consult
/// `allow_request`.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    components: RwLock<HashMap<String, Tracker>>,
    alerts: RwLock<Vec<CascadeAlert>>,
    on_cascade: RwLock<Option<CascadeHook>>,
}

const RATE_HISTORY_CAP: usize = 100;

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            components: RwLock::new(HashMap::new()),
            alerts: RwLock::new(Vec::new()),
            on_cascade: RwLock::new(None),
        }
    }

    /// Install a hook invoked whenever a cascade alert is raised.
    pub fn on_cascade<F>(&self, hook: F)
    where
        F: Fn(&CascadeAlert) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.on_cascade.write() {
            *slot = Some(Box::new(hook));
        }
    }

    pub fn record_success(&self, component: &str) {
        let Ok(mut components) = self.components.write() else {
            return;
        };
        let tracker = components
            .entry(component.to_string())
            .or_insert_with(Tracker::new);
        tracker.total_successes += 1;
        tracker.push_sample(false, self.config.window, RATE_HISTORY_CAP);

        if tracker.state == CircuitState::HalfOpen {
            info!(component = component, "Circuit closing after successful probe");
            tracker.state = CircuitState::Closed;
            tracker.opened_at = None;
            tracker.window.clear();
        }
    }

    pub fn record_failure(&self, component: &str) {
        let mut cascade = None;
        {
            let Ok(mut components) = self.components.write() else {
                return;
            };
            let tracker = components
                .entry(component.to_string())
                .or_insert_with(Tracker::new);
            tracker.total_failures += 1;
            tracker.push_sample(true, self.config.window, RATE_HISTORY_CAP);

            let opened = match tracker.state {
                CircuitState::Closed => {
                    let rate = tracker.failure_rate();
                    if tracker.window.len() >= self.config.min_samples
                        && rate > self.config.failure_threshold
                    {
                        warn!(component = component, rate = rate, "Circuit opening");
                        tracker.state = CircuitState::Open;
                        tracker.opened_at = Some(Instant::now());
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    warn!(component = component, "Circuit re-opening after failed probe");
                    tracker.state = CircuitState::Open;
                    tracker.opened_at = Some(Instant::now());
                    false
                }
                CircuitState::Open => false,
            };

            if opened {
                let open_components: Vec<String> = components
                    .iter()
                    .filter(|(_, t)| t.state == CircuitState::Open)
                    .map(|(name, _)| name.clone())
                    .collect();
                if open_components.len() >= self.config.cascade_threshold {
                    cascade = Some(self.build_alert(open_components));
                }
            }
        }

        if let Some(alert) = cascade {
            self.raise_cascade(alert);
        }
    }

    fn build_alert(&self, mut open_components: Vec<String>) -> CascadeAlert {
        open_components.sort();
        let open_count = open_components.len();
        let recommendation = if open_count > self.config.cascade_threshold {
            CascadeRecommendation::Halt
        } else {
            CascadeRecommendation::Investigate
        };
        CascadeAlert {
            open_components,
            open_count,
            threshold: self.config.cascade_threshold,
            recommendation,
            raised_at: Utc::now(),
        }
    }

    fn raise_cascade(&self, alert: CascadeAlert) {
        warn!(
            open_count = alert.open_count,
            recommendation = ?alert.recommendation,
            "Cascade alert raised"
        );
        if let Ok(hook) = self.on_cascade.read() {
            if let Some(hook) = hook.as_ref() {
                hook(&alert);
            }
        }
        if let Ok(mut alerts) = self.alerts.write() {
            alerts.push(alert);
        }
    }

    /// Current circuit state, advancing open circuits to half-open once the
    /// recovery timeout has elapsed.
    pub fn check_circuit(&self, component: &str) -> CircuitState {
        let Ok(mut components) = self.components.write() else {
            return CircuitState::Closed;
        };
        let Some(tracker) = components.get_mut(component) else {
            return CircuitState::Closed;
        };
        if tracker.state == CircuitState::Open {
            if let Some(opened_at) = tracker.opened_at {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    info!(component = component, "Circuit half-open for recovery probe");
                    tracker.state = CircuitState::HalfOpen;
                }
            }
        }
        tracker.state
    }

    /// Advisory: callers that shed load skip components with open circuits.
    pub fn allow_request(&self, component: &str) -> bool {
        self.check_circuit(component) != CircuitState::Open
    }

    pub fn failure_rate(&self, component: &str) -> Option<f64> {
        let components = self.components.read().ok()?;
        components.get(component).map(|t| t.failure_rate())
    }

    /// Z-score of the current failure rate against the component's rate
    /// history. `None` until the history carries enough variance to score
    /// against.
    pub fn zscore(&self, component: &str) -> Option<f64> {
        let components = self.components.read().ok()?;
        let tracker = components.get(component)?;
        let history = &tracker.rate_history;
        if history.len() < self.config.min_samples {
            return None;
        }
        let mean = history.iter().sum::<f64>() / history.len() as f64;
        let variance =
            history.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / history.len() as f64;
        let std = variance.sqrt();
        if std <= f64::EPSILON {
            return None;
        }
        Some((tracker.failure_rate() - mean) / std)
    }

    pub fn is_anomalous(&self, component: &str) -> bool {
        self.zscore(component)
            .map(|z| z > self.config.zscore_threshold)
            .unwrap_or(false)
    }

    pub fn open_circuit_count(&self) -> usize {
        self.components
            .read()
            .map(|c| c.values().filter(|t| t.state == CircuitState::Open).count())
            .unwrap_or(0)
    }

    pub fn component_health(&self, component: &str) -> Option<ComponentHealth> {
        let components = self.components.read().ok()?;
        let tracker = components.get(component)?;
        Some(ComponentHealth {
            component: component.to_string(),
            state: tracker.state,
            failure_rate: tracker.failure_rate(),
            samples: tracker.window.len(),
            total_failures: tracker.total_failures,
            total_successes: tracker.total_successes,
        })
    }

    pub fn alerts(&self) -> Vec<CascadeAlert> {
        self.alerts.read().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::new(FailureDetectorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn detector() -> FailureDetector {
        FailureDetector::new(FailureDetectorConfig {
            recovery_timeout: Duration::from_millis(50),
            ..FailureDetectorConfig::default()
        })
    }

    #[test]
    fn test_circuit_opens_after_failures() {
        let detector = detector();
        assert_eq!(detector.check_circuit("ledger"), CircuitState::Closed);

        detector.record_failure("ledger");
        detector.record_failure("ledger");
        assert_eq!(detector.check_circuit("ledger"), CircuitState::Closed);

        detector.record_failure("ledger");
        assert_eq!(detector.check_circuit("ledger"), CircuitState::Open);
        assert!(!detector.allow_request("ledger"));
    }

    #[test]
    fn test_successes_keep_circuit_closed() {
        let detector = detector();
        for _ in 0..10 {
            detector.record_success("tsa");
        }
        detector.record_failure("tsa");
        detector.record_failure("tsa");
        // 2 of 12 is well under the threshold.
        assert_eq!(detector.check_circuit("tsa"), CircuitState::Closed);
        assert!(detector.allow_request("tsa"));
    }

    #[test]
    fn test_recovery_probe_closes_circuit() {
        let detector = detector();
        for _ in 0..3 {
            detector.record_failure("ledger");
        }
        assert_eq!(detector.check_circuit("ledger"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(detector.check_circuit("ledger"), CircuitState::HalfOpen);

        detector.record_success("ledger");
        assert_eq!(detector.check_circuit("ledger"), CircuitState::Closed);
        assert!(detector.allow_request("ledger"));
    }

    #[test]
    fn test_failed_probe_reopens_circuit() {
        let detector = detector();
        for _ in 0..3 {
            detector.record_failure("ledger");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(detector.check_circuit("ledger"), CircuitState::HalfOpen);

        detector.record_failure("ledger");
        assert_eq!(detector.check_circuit("ledger"), CircuitState::Open);
    }

    #[test]
    fn test_cascade_alert_raised_once_threshold_met() {
        let detector = detector();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        detector.on_cascade(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            detector.record_failure("canonical");
        }
        assert!(detector.alerts().is_empty());

        for _ in 0..3 {
            detector.record_failure("ledger");
        }
        let alerts = detector.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].open_count, 2);
        assert_eq!(alerts[0].recommendation, CascadeRecommendation::Investigate);
        assert_eq!(
            alerts[0].open_components,
            vec!["canonical".to_string(), "ledger".to_string()]
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(detector.open_circuit_count(), 2);
    }

    #[test]
    fn test_zscore_flags_rate_spike() {
        let detector = detector();

        // Steady state: all successes, no variance, nothing to score.
        for _ in 0..30 {
            detector.record_success("tsa");
        }
        assert!(detector.zscore("tsa").is_none());
        assert!(!detector.is_anomalous("tsa"));

        // A burst of failures spikes the rate far above the history.
        for _ in 0..5 {
            detector.record_failure("tsa");
        }
        let z = detector.zscore("tsa").expect("variance exists now");
        assert!(z > 3.0, "z = {z}");
        assert!(detector.is_anomalous("tsa"));
    }

    #[test]
    fn test_component_health_snapshot() {
        let detector = detector();
        detector.record_success("ledger");
        detector.record_failure("ledger");

        let health = detector.component_health("ledger").unwrap();
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.samples, 2);
        assert_eq!(health.total_failures, 1);
        assert_eq!(health.total_successes, 1);
        assert!((health.failure_rate - 0.5).abs() < 1e-9);

        assert!(detector.component_health("ghost").is_none());
    }
}
