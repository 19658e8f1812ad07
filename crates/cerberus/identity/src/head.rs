//! The identity voting head.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use cerberus_crypto::{ComponentKeyStore, CryptoError};
use cerberus_quorum::VotingHead;
use cerberus_types::{
    CerberusVote, ConstraintsApplied, DenyReason, GateDecision, HeadKind, RequestEnvelope,
    Severity,
};

use crate::document::{DeviceAttestationRegistry, IdentityDocumentStore, RiskTier};

/// Component name the head signs votes under.
pub const IDENTITY_HEAD_COMPONENT: &str = "identity-head";

/// Identity head configuration
#[derive(Clone, Debug)]
pub struct IdentityHeadConfig {
    /// When set, requests must present a device fingerprint trusted for the
    /// actor.
    pub require_device_attestation: bool,
    /// Rate limit attached to allows from unattested devices while
    /// attestation is optional.
    pub degraded_rate_limit_per_min: u32,
    /// Documents above this tier are denied.
    pub max_risk_tier: RiskTier,
}

impl Default for IdentityHeadConfig {
    fn default() -> Self {
        Self {
            require_device_attestation: false,
            degraded_rate_limit_per_min: 60,
            max_risk_tier: RiskTier::High,
        }
    }
}

/// The identity head.
///
/// Runs seven checks on every request: DID well-formedness, document
/// resolution, revocation, key validity, device attestation, subject
/// resolution, and risk tier. All checks always run; the vote carries
/// every failure found. While the document store is empty the head is in
/// open enrollment and resolution checks are waived. Unattested devices
/// deny only under mandatory attestation; otherwise the allow is degraded
/// with a rate-limit constraint.
pub struct IdentityHead {
    store: Arc<IdentityDocumentStore>,
    devices: Arc<DeviceAttestationRegistry>,
    config: IdentityHeadConfig,
    signer: Option<Arc<ComponentKeyStore>>,
}

impl IdentityHead {
    pub fn new(store: Arc<IdentityDocumentStore>) -> Self {
        Self {
            store,
            devices: Arc::new(DeviceAttestationRegistry::new()),
            config: IdentityHeadConfig::default(),
            signer: None,
        }
    }

    pub fn with_devices(mut self, devices: Arc<DeviceAttestationRegistry>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_config(mut self, config: IdentityHeadConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the head's signing key and sign every vote with it.
    pub fn with_signer(mut self, keystore: Arc<ComponentKeyStore>) -> Result<Self, CryptoError> {
        keystore.register(IDENTITY_HEAD_COMPONENT)?;
        self.signer = Some(keystore);
        Ok(self)
    }
}

impl VotingHead for IdentityHead {
    fn kind(&self) -> HeadKind {
        HeadKind::Identity
    }

    fn evaluate(&self, envelope: &RequestEnvelope) -> CerberusVote {
        let now = Utc::now();
        let mut reasons = Vec::new();
        let mut escalate = false;

        // 1. DID well-formedness.
        if !envelope.actor.is_wellformed() {
            reasons.push(DenyReason::new(
                "IDENTITY_INVALID_DID_FORMAT",
                format!("actor DID is malformed: {}", envelope.actor),
            ));
        }

        // Open enrollment: with no documents registered, resolution-based
        // checks are waived so the system can bootstrap.
        let open_enrollment = self.store.is_empty();
        let document = self.store.resolve(&envelope.actor);

        // 2. Document resolution.
        if !open_enrollment && document.is_none() {
            reasons.push(DenyReason::new(
                "IDENTITY_NOT_FOUND",
                format!("no identity document for {}", envelope.actor),
            ));
        }

        if let Some(document) = &document {
            // 3. Revocation.
            if document.is_revoked() {
                escalate = true;
                reasons.push(DenyReason::new(
                    "IDENTITY_REVOKED",
                    format!("identity document for {} is revoked", envelope.actor),
                ));
            }

            // 4. At least one key inside its validity window.
            if !document.has_current_key(now) {
                reasons.push(DenyReason::new(
                    "IDENTITY_NO_VALID_KEY",
                    format!("no currently valid public key for {}", envelope.actor),
                ));
            }

            // 7. Risk tier ceiling.
            if document.attributes.risk_tier > self.config.max_risk_tier {
                escalate = true;
                reasons.push(DenyReason::new(
                    "IDENTITY_RISK_TIER_EXCEEDED",
                    format!(
                        "risk tier {:?} exceeds the configured ceiling",
                        document.attributes.risk_tier
                    ),
                ));
            }
        }

        // 5. Device attestation. An unattested device denies under mandatory
        // attestation; otherwise the request stays admissible but the vote
        // carries a rate limit.
        let mut constraints = ConstraintsApplied::default();
        let device_trusted = envelope
            .context
            .device_attestation
            .as_deref()
            .map(|fp| self.devices.is_trusted(&envelope.actor, fp))
            .unwrap_or(false);
        if !device_trusted {
            if self.config.require_device_attestation {
                reasons.push(DenyReason::new(
                    "IDENTITY_DEVICE_UNTRUSTED",
                    "request device is missing or not trusted for the actor",
                ));
            } else {
                constraints.rate_limit_per_min = Some(self.config.degraded_rate_limit_per_min);
            }
        }

        // 6. Subject resolution, when acting on behalf of someone else.
        if envelope.subject != envelope.actor
            && !open_enrollment
            && self.store.resolve(&envelope.subject).is_none()
        {
            reasons.push(DenyReason::new(
                "IDENTITY_SUBJECT_NOT_FOUND",
                format!("no identity document for subject {}", envelope.subject),
            ));
        }

        let decision = if reasons.is_empty() {
            GateDecision::Allow
        } else {
            GateDecision::Deny
        };
        let severity = if escalate {
            Severity::Critical
        } else if decision == GateDecision::Deny {
            Severity::High
        } else {
            Severity::Low
        };

        debug!(
            request_id = %envelope.request_id,
            actor = %envelope.actor,
            decision = %decision,
            reason_count = reasons.len(),
            "Identity head voted"
        );

        let mut vote = CerberusVote {
            request_id: envelope.request_id.clone(),
            head: HeadKind::Identity,
            decision,
            reasons,
            constraints,
            severity,
            signature: None,
            voted_at: now,
        };

        if let Some(keystore) = &self.signer {
            if let Ok(content) = vote.signable_content() {
                vote.signature = keystore.sign_as(IDENTITY_HEAD_COMPONENT, &content).ok();
            }
        }

        vote
    }
}
