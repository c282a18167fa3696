//! Property-based tests for revision ordering and replay idempotence
//!
//! This module drives the sled-backed store with randomized provider event
//! sequences. Out-of-order and duplicate delivery is the normal case for
//! webhook traffic, so the monotonic-revision discipline and the
//! recompute-from-signers rule have to hold for every interleaving, not
//! just the handful a human would think to write down.

use std::sync::Arc;

use proptest::prelude::*;

use contract_lifecycle::{
    contract::{ContractStatus, CustomerRef, SignerRole, SignerSpec, SignerStatus},
    error::EngineError,
    store::{ContractStore, OrderPolicy},
};
use tempfile::tempdir;

// These property tests cover:
//
// 1. Watermark monotonicity - the applied revision never moves backwards
// 2. Replay idempotence - re-delivering a whole event history is inert
// 3. Aggregate consistency - stored status always equals the derivation
//
// Each case opens its own sled database under a tempdir; the case count is
// reduced accordingly.
//

#[derive(Debug, Clone)]
struct ProviderEvent {
    signer: usize,
    status: SignerStatus,
    revision: u64,
}

fn event_strategy() -> impl Strategy<Value = ProviderEvent> {
    (
        0..3usize,
        prop_oneof![Just(SignerStatus::Signed), Just(SignerStatus::Declined)],
        1..10u64,
    )
        .prop_map(|(signer, status, revision)| ProviderEvent {
            signer,
            status,
            revision,
        })
}

fn event_sequence_strategy() -> impl Strategy<Value = Vec<ProviderEvent>> {
    prop::collection::vec(event_strategy(), 1..=12)
}

const ACCOUNTS: [&str; 3] = ["13800000001", "13800000002", "13800000003"];

fn seeded_store(name: &str) -> (tempfile::TempDir, ContractStore) {
    let dir = tempdir().expect("tempdir");
    let db = Arc::new(sled::open(dir.path().join(name)).expect("open sled"));
    let store = ContractStore::open(&db).expect("open store");

    let customer = CustomerRef {
        name: "prop customer".to_string(),
        phone: "13800000000".to_string(),
        id_number: None,
    };
    store.create("CON12345678901", customer).expect("create");

    let specs: Vec<SignerSpec> = ACCOUNTS
        .iter()
        .enumerate()
        .map(|(i, account)| SignerSpec {
            name: format!("signer {i}"),
            account: account.to_string(),
            role: SignerRole::Customer,
            sign_order: (i + 1) as u32,
        })
        .collect();
    store
        .register_signers("CON12345678901", &specs)
        .expect("register");

    (dir, store)
}

/// Deliver one event, treating the discards the reconciler tolerates as
/// non-fatal. Anything else is a real failure.
fn deliver(store: &ContractStore, event: &ProviderEvent) {
    match store.apply_signer_status(
        "CON12345678901",
        ACCOUNTS[event.signer],
        event.status,
        event.revision,
        OrderPolicy::Unordered,
    ) {
        Ok(_)
        | Err(EngineError::StaleRevision { .. })
        | Err(EngineError::TerminalState { .. })
        | Err(EngineError::SignerTerminal { .. }) => {}
        Err(err) => panic!("unexpected store error: {err}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: the revision watermark never moves backwards, whatever
    /// order events arrive in.
    #[test]
    fn prop_watermark_is_monotone(events in event_sequence_strategy()) {
        let (_dir, store) = seeded_store("watermark.db");

        let mut watermark = 0u64;
        for event in &events {
            deliver(&store, event);
            let current = store.get("CON12345678901").unwrap().last_provider_revision;
            prop_assert!(current >= watermark, "watermark regressed: {} -> {}", watermark, current);
            watermark = current;
        }
    }

    /// Property: replaying an entire event history against the resulting
    /// state changes nothing observable.
    #[test]
    fn prop_replay_is_idempotent(events in event_sequence_strategy()) {
        let (_dir, store) = seeded_store("replay.db");

        for event in &events {
            deliver(&store, event);
        }
        let after_first = store.get("CON12345678901").unwrap();

        for event in &events {
            deliver(&store, event);
        }
        let after_second = store.get("CON12345678901").unwrap();

        prop_assert_eq!(after_first, after_second);
    }

    /// Property: the stored aggregate always equals the derivation from the
    /// signer states - the two can never drift apart.
    #[test]
    fn prop_aggregate_never_drifts(events in event_sequence_strategy()) {
        let (_dir, store) = seeded_store("drift.db");

        for event in &events {
            deliver(&store, event);
            let contract = store.get("CON12345678901").unwrap();
            prop_assert_eq!(contract.status, contract.derived_status());
        }
    }

    /// Property: an event carrying a revision older than the watermark is
    /// discarded without effect, matching the out-of-order delivery rule.
    #[test]
    fn prop_stale_events_have_no_effect(revisions in prop::collection::vec(1..10u64, 2..=6)) {
        let (_dir, store) = seeded_store("stale.db");

        let newest = *revisions.iter().max().unwrap();
        store
            .apply_signer_status(
                "CON12345678901",
                ACCOUNTS[0],
                SignerStatus::Signed,
                newest,
                OrderPolicy::Unordered,
            )
            .unwrap();
        let baseline = store.get("CON12345678901").unwrap();

        for revision in revisions {
            if revision >= newest {
                continue;
            }
            let result = store.apply_signer_status(
                "CON12345678901",
                ACCOUNTS[1],
                SignerStatus::Declined,
                revision,
                OrderPolicy::Unordered,
            );
            let is_stale = matches!(result, Err(EngineError::StaleRevision { .. }));
            prop_assert!(is_stale);
        }

        prop_assert_eq!(store.get("CON12345678901").unwrap(), baseline);
    }
}
