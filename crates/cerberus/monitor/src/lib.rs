//! Cerberus Monitor - keeping the gate honest about its own health
//!
//! Three watchdogs: the liveness monitor puts a hard deadline on every head
//! evaluation and votes deny on the head's behalf when it misses; the
//! deadlock detector times requests through the pipeline and flags the
//! stuck ones; the failure detector tracks per-component failure rates
//! behind a circuit breaker and raises cascade alerts when too many
//! circuits open at once.

#![deny(unsafe_code)]

mod deadlock;
mod failure;
mod liveness;

pub use deadlock::{DeadlockConfig, DeadlockDetector, InflightSnapshot};
pub use failure::{
    CascadeAlert, CascadeRecommendation, CircuitState, ComponentHealth, FailureDetector,
    FailureDetectorConfig,
};
pub use liveness::{HeadHealth, HeadStatus, LivenessConfig, LivenessMonitor};
