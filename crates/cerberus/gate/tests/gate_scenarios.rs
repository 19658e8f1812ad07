//! End-to-end scenarios through a fully assembled gate: real heads, real
//! authority, real ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cerberus_capability::{
    CapabilityAuthority, CapabilityHead, CapabilityScope, IssueOptions,
};
use cerberus_crypto::ComponentKeyStore;
use cerberus_gate::{CerberusGate, GateConfig};
use cerberus_identity::{IdentityDocument, IdentityDocumentStore, IdentityHead, PublicKeyEntry};
use cerberus_invariant::{InvariantHead, InvariantRegistry};
use cerberus_monitor::LivenessConfig;
use cerberus_quorum::QuorumConfig;
use cerberus_tsa::{verify_token, TimestampAuthority};
use cerberus_types::{
    Did, GateDecision, HeadKind, Intent, QuorumPolicy, RequestEnvelope, Severity, TokenId,
};
use chrono::Utc;

struct Fixture {
    keystore: Arc<ComponentKeyStore>,
    identities: Arc<IdentityDocumentStore>,
    authority: Arc<CapabilityAuthority>,
    gate: CerberusGate,
}

fn alice() -> Did {
    Did::new("did:cerberus:test:alice")
}

fn current_key() -> PublicKeyEntry {
    PublicKeyEntry {
        kid: "key-1".to_string(),
        kty: "ed25519".to_string(),
        public_key: "ab".repeat(32),
        created: Utc::now() - chrono::Duration::hours(1),
        expires: Utc::now() + chrono::Duration::hours(1),
    }
}

fn setup(policy: QuorumPolicy) -> Fixture {
    let keystore = Arc::new(ComponentKeyStore::new());

    let identities = Arc::new(IdentityDocumentStore::new());
    identities
        .register(IdentityDocument::new(alice()).with_key(current_key()))
        .unwrap();

    let authority = Arc::new(
        CapabilityAuthority::new(Did::new("did:cerberus:authority"), keystore.clone()).unwrap(),
    );

    let identity_head = IdentityHead::new(identities.clone())
        .with_signer(keystore.clone())
        .unwrap();
    let capability_head = CapabilityHead::new(authority.clone())
        .with_signer(keystore.clone())
        .unwrap();
    let invariant_head = InvariantHead::new(Arc::new(InvariantRegistry::default()))
        .with_signer(keystore.clone())
        .unwrap();

    let gate = CerberusGate::new(GateConfig {
        quorum: QuorumConfig {
            policy,
            ..QuorumConfig::default()
        },
        liveness: LivenessConfig {
            head_timeout: Duration::from_millis(100),
            ..LivenessConfig::default()
        },
        ledger_block_size: 2,
        ..GateConfig::default()
    })
    .with_head(Arc::new(identity_head))
    .with_head(Arc::new(capability_head))
    .with_head(Arc::new(invariant_head));

    Fixture {
        keystore,
        identities,
        authority,
        gate,
    }
}

fn issue_profile_token(authority: &CapabilityAuthority) -> TokenId {
    authority
        .issue(
            &alice(),
            vec![CapabilityScope::new("state://profile/*", vec!["read", "write"])],
            IssueOptions::default(),
        )
        .unwrap()
        .token_id
}

fn envelope(action: &str, resource: &str, token: Option<TokenId>) -> RequestEnvelope {
    let mut envelope = RequestEnvelope::new(alice(), Intent::new(action, resource));
    envelope.capability_token_id = token;
    envelope
}

#[tokio::test]
async fn scenario_authorized_mutation_lands_in_anchored_ledger() {
    let fixture = setup(QuorumPolicy::Unanimous);
    let token = issue_profile_token(&fixture.authority);

    let envelope = envelope("write", "state://profile/alice", Some(token));
    let decision = fixture.gate.submit(envelope.clone()).await;

    assert!(decision.is_allowed());
    assert_eq!(decision.severity, Severity::Low);
    assert!(decision.quorum.achieved);
    assert_eq!(decision.quorum.voters.len(), 3);
    // All three heads signed their votes.
    assert_eq!(decision.signatures.len(), 3);
    assert!(decision.commit_policy.allowed);
    assert!(decision.commit_policy.requires_anchor_append);
    assert!(decision.commit_policy.requires_shadow_hash_match);
    // No device was attested, so the identity head's degrade rate limit
    // survives the constraint merge.
    assert_eq!(decision.constraints.rate_limit_per_min, Some(60));

    fixture.gate.record_outcome(&envelope, &decision).unwrap();
    let block = fixture.gate.force_seal().unwrap().expect("pending record seals");

    // Anchor the sealed block's Merkle root through the TSA.
    let tsa = TimestampAuthority::new(fixture.keystore.clone()).unwrap();
    let stamp = tsa
        .request_timestamp(&block.merkle_root, &format!("anchor-{}", block.block_id))
        .unwrap();
    assert!(verify_token(&tsa.public_key(), &stamp));
    assert!(fixture.gate.anchor_block(block.block_id, &stamp.data_hash).unwrap());

    assert!(fixture.gate.verify_ledger().unwrap());
}

#[tokio::test]
async fn scenario_revoked_identity_is_denied_high() {
    let fixture = setup(QuorumPolicy::Unanimous);
    let token = issue_profile_token(&fixture.authority);
    fixture.identities.revoke(&alice(), "offboarded").unwrap();

    let decision = fixture
        .gate
        .submit(envelope("write", "state://profile/alice", Some(token)))
        .await;

    assert_eq!(decision.final_decision, GateDecision::Deny);
    assert_eq!(decision.severity, Severity::High);
    assert!(decision.reasons.iter().any(|r| r.code == "IDENTITY_REVOKED"));
    assert!(!decision.commit_policy.allowed);
}

#[tokio::test]
async fn scenario_root_protection_is_critical() {
    let fixture = setup(QuorumPolicy::Unanimous);
    let token = fixture
        .authority
        .issue(
            &alice(),
            vec![CapabilityScope::new("state://*", vec!["*"])],
            IssueOptions::default(),
        )
        .unwrap()
        .token_id;

    let decision = fixture
        .gate
        .submit(envelope("delete", "state://ledger/blocks/0", Some(token)))
        .await;

    assert_eq!(decision.final_decision, GateDecision::Deny);
    assert_eq!(decision.severity, Severity::Critical);
    assert!(decision.reasons.iter().any(|r| r.code == "INV_ROOT_009"));
}

#[tokio::test]
async fn scenario_hung_head_fails_closed_within_deadline() {
    let keystore = Arc::new(ComponentKeyStore::new());
    let identities = Arc::new(IdentityDocumentStore::new());
    identities
        .register(IdentityDocument::new(alice()).with_key(current_key()))
        .unwrap();

    let gate = CerberusGate::new(GateConfig {
        liveness: LivenessConfig {
            head_timeout: Duration::from_millis(50),
            ..LivenessConfig::default()
        },
        ..GateConfig::default()
    })
    .with_head(Arc::new(
        IdentityHead::new(identities).with_signer(keystore).unwrap(),
    ))
    .with_head(Arc::new(cerberus_gate::mocks::HangingHead::new(
        HeadKind::Capability,
        Duration::from_millis(500),
    )));

    let started = Instant::now();
    let decision = gate.submit(envelope("write", "state://profile/alice", None)).await;

    // The gate answered without waiting out the hung head.
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(decision.final_decision, GateDecision::Deny);
    assert!(decision.reasons.iter().any(|r| r.code == "HEAD_TIMEOUT"));
}

#[tokio::test]
async fn scenario_missed_quorum_downgrades_lone_allow() {
    let keystore = Arc::new(ComponentKeyStore::new());
    let identities = Arc::new(IdentityDocumentStore::new());
    identities
        .register(IdentityDocument::new(alice()).with_key(current_key()))
        .unwrap();

    // Only one head registered while the policy wants two allows.
    let gate = CerberusGate::new(GateConfig {
        quorum: QuorumConfig {
            policy: QuorumPolicy::TwoOfThree,
            ..QuorumConfig::default()
        },
        ..GateConfig::default()
    })
    .with_head(Arc::new(
        IdentityHead::new(identities).with_signer(keystore).unwrap(),
    ));

    let decision = gate.submit(envelope("write", "state://profile/alice", None)).await;

    assert!(!decision.quorum.achieved);
    assert_eq!(decision.final_decision, GateDecision::Deny);
    assert!(decision.reasons.iter().any(|r| r.code == "QUORUM_NOT_ACHIEVED"));
}

#[tokio::test]
async fn scenario_duplicate_record_rejected() {
    let fixture = setup(QuorumPolicy::Unanimous);
    let token = issue_profile_token(&fixture.authority);

    let envelope = envelope("write", "state://profile/alice", Some(token));
    let decision = fixture.gate.submit(envelope.clone()).await;

    let record = cerberus_types::ExecutionRecord::from_decision(&envelope, &decision);
    fixture.gate.record_execution(record.clone()).unwrap();
    assert!(fixture.gate.record_execution(record).is_err());

    let stats = fixture.gate.ledger_stats().unwrap();
    assert_eq!(stats.total_records, 1);
}
