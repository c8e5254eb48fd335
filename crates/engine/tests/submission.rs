mod common;

use std::collections::HashSet;

use alloy_primitives::U256;
use bundler_audit::{BundlerEvent, DropReason};
use bundler_chain::BroadcastError;
use bundler_core::test_utils::{TEST_CHAIN_ID, TEST_ENTRY_POINT, sender, user_op_v06, user_op_v07};
use bundler_core::{
    TransactionStatus, UserOperationRecord, UserOperationRequest, UserOperationStatus,
};
use bundler_datastore::{Repository, WriteBatch};
use bundler_engine::MAX_ESTIMATE_FAILURES;
use bundler_user_op_pool::PoolError;
use common::{Harness, chain_config, request};

#[tokio::test]
async fn bundles_admitted_operations_into_one_transaction() {
    let harness = Harness::new(chain_config(1)).await;
    let hashes = [
        harness.admit(1, 0).await,
        harness.admit(2, 0).await,
        harness.admit(3, 0).await,
    ];

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(harness.client.broadcast_count(), 1);

    let pending = harness.transactions(TransactionStatus::Pending).await;
    assert_eq!(pending.len(), 1);
    let tx = &pending[0];
    assert_eq!(tx.from, harness.signer(0));
    assert_eq!(tx.nonce, 0);
    assert_eq!(tx.user_operation_hashes.len(), 3);
    assert!(tx.latest_sent_at.is_some());

    for hash in hashes {
        let record = harness.repository.get_user_operation(hash).await.unwrap().unwrap();
        assert_eq!(record.status, UserOperationStatus::Pending);
        assert_eq!(record.transaction_id, Some(tx.id));
    }
    assert_eq!(harness.bundler.allocator().pending_count(&tx.from), 1);
}

#[tokio::test]
async fn identical_resubmission_does_not_create_second_transaction() {
    let harness = Harness::new(chain_config(1)).await;
    harness.admit(1, 0).await;
    harness.bundler.bundle_once().await.unwrap();

    let err = harness
        .pool
        .admit(harness.bundler.chain(), request(1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::DuplicateOperation(_)));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 0);
    assert_eq!(harness.transactions(TransactionStatus::Pending).await.len(), 1);
    assert_eq!(harness.client.broadcast_count(), 1);
}

#[tokio::test]
async fn overlapping_rounds_never_share_an_operation() {
    let mut settings = common::settings();
    settings.development = true;
    let harness = Harness::with_settings(chain_config(3), settings).await;
    for sender in 1..=6 {
        harness.admit(sender, 0).await;
    }

    let (first, second) = tokio::join!(harness.bundler.bundle_once(), harness.bundler.bundle_once());
    first.unwrap();
    second.unwrap();

    let pending = harness.transactions(TransactionStatus::Pending).await;
    let mut seen = HashSet::new();
    for tx in &pending {
        for hash in &tx.user_operation_hashes {
            assert!(seen.insert(*hash), "operation {hash} is in two transactions");
            let record = harness.repository.get_user_operation(*hash).await.unwrap().unwrap();
            assert_eq!(record.transaction_id, Some(tx.id));
        }
    }
    assert_eq!(seen.len(), 6);
}

#[tokio::test]
async fn signer_budget_is_never_exceeded() {
    let mut chain = chain_config(1);
    chain.pending_transaction_signer_handle_limit = 2;
    chain.max_user_op_pack_count = 1;
    let harness = Harness::new(chain).await;
    for sender in 1..=5 {
        harness.admit(sender, 0).await;
    }

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 2);
    assert_eq!(report.unused, 3);

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 0);

    let signer = harness.signer(0);
    assert_eq!(harness.bundler.allocator().pending_count(&signer), 2);
    let pending = harness.transactions(TransactionStatus::Pending).await;
    assert_eq!(pending.len(), 2);
    let nonces: HashSet<u64> = pending.iter().map(|tx| tx.nonce).collect();
    assert_eq!(nonces, HashSet::from([0, 1]));
}

#[tokio::test]
async fn oversized_operation_is_discarded() {
    let mut chain = chain_config(1);
    chain.max_bundle_gas = 500_000;
    let harness = Harness::new(chain).await;
    let small = harness.admit(1, 0).await;
    let big = harness
        .pool
        .admit(
            harness.bundler.chain(),
            UserOperationRequest::new(
                user_op_v06(sender(2), U256::ZERO, 1_000_000),
                TEST_ENTRY_POINT,
            ),
        )
        .await
        .unwrap();

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.discarded, 1);
    assert_eq!(report.submitted, 1);
    assert!(harness.repository.get_user_operation(big).await.unwrap().is_none());
    assert_eq!(
        harness.repository.get_user_operation(small).await.unwrap().unwrap().status,
        UserOperationStatus::Pending
    );
}

#[tokio::test]
async fn insufficient_funds_blocks_signer_until_topped_up() {
    let mut harness = Harness::new(chain_config(1)).await;
    let signer = harness.signer(0);
    let hash = harness.admit(1, 0).await;
    harness
        .client
        .fail_next_broadcast(BroadcastError::InsufficientFunds("insufficient funds for gas".into()));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 0);
    assert!(harness.bundler.allocator().is_blocked(&signer));

    let local = harness.transactions(TransactionStatus::Local).await;
    assert_eq!(local.len(), 1);
    let record = harness.repository.get_user_operation(hash).await.unwrap().unwrap();
    assert_eq!(record.transaction_id, Some(local[0].id));

    // still unfunded: stays blocked and nothing is re-sent
    harness.bundler.tick().await.unwrap();
    assert!(harness.bundler.allocator().is_blocked(&signer));
    assert_eq!(harness.client.broadcast_count(), 1);

    harness
        .client
        .set_balance(signer, U256::from(1_000_000_000_000_000_000u128));
    harness.bundler.tick().await.unwrap();

    assert!(!harness.bundler.allocator().is_blocked(&signer));
    assert_eq!(harness.client.broadcast_count(), 2);
    let tx = harness.transaction(local[0].id).await;
    assert_eq!(tx.status, TransactionStatus::Pending);

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(e, BundlerEvent::SignerBlocked { .. })));
    assert!(events.iter().any(|e| matches!(e, BundlerEvent::SignerUnblocked { .. })));
}

#[tokio::test]
async fn lost_nonce_returns_operations_to_the_pool() {
    let harness = Harness::new(chain_config(1)).await;
    let signer = harness.signer(0);
    let hashes = [harness.admit(1, 0).await, harness.admit(2, 0).await];
    harness
        .client
        .fail_next_broadcast(BroadcastError::NonceTooLow("nonce too low".into()));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 0);
    assert!(harness.transactions(TransactionStatus::Local).await.is_empty());
    assert_eq!(harness.bundler.allocator().pending_count(&signer), 0);
    for hash in hashes {
        let record = harness.repository.get_user_operation(hash).await.unwrap().unwrap();
        assert_eq!(record.status, UserOperationStatus::Local);
        assert_eq!(record.transaction_id, None);
    }

    harness.client.set_nonce(signer, 3);
    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    let pending = harness.transactions(TransactionStatus::Pending).await;
    assert_eq!(pending[0].nonce, 3);
}

#[tokio::test]
async fn rejected_broadcast_stays_local_and_is_resent() {
    let mut harness = Harness::new(chain_config(1)).await;
    harness.admit(1, 0).await;
    harness
        .client
        .fail_next_broadcast(BroadcastError::Rpc("upstream timeout".into()));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 0);
    assert_eq!(harness.transactions(TransactionStatus::Local).await.len(), 1);
    assert!(
        harness
            .drain_events()
            .iter()
            .any(|e| matches!(e, BundlerEvent::Alert { .. }))
    );

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.resent, 1);
    assert_eq!(harness.transactions(TransactionStatus::Pending).await.len(), 1);
}

#[tokio::test]
async fn already_known_counts_as_sent() {
    let harness = Harness::new(chain_config(1)).await;
    harness.admit(1, 0).await;
    harness
        .client
        .fail_next_broadcast(BroadcastError::AlreadyKnown("already known".into()));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(harness.transactions(TransactionStatus::Pending).await.len(), 1);
}

#[tokio::test]
async fn gas_estimate_raises_the_heuristic_limit() {
    let mut chain = chain_config(1);
    chain.requires_gas_estimate = true;
    let harness = Harness::new(chain).await;
    harness.admit(1, 0).await;

    harness.bundler.bundle_once().await.unwrap();
    let pending = harness.transactions(TransactionStatus::Pending).await;
    // the mock estimates 500k, above the heuristic for one small operation
    assert_eq!(pending[0].gas_limit, 500_000);
}

#[tokio::test]
async fn stray_version_is_discarded_without_starving_the_chain() {
    let mut harness = Harness::new(chain_config(1)).await;
    let valid = harness.admit(1, 0).await;

    // a v0.7 payload stored against the v0.6 entry point, as an older process could leave it
    let stray = UserOperationRecord::new_local(
        TEST_CHAIN_ID,
        TEST_ENTRY_POINT,
        user_op_v07(sender(2), U256::ZERO, 200_000),
        Vec::new(),
    );
    let stray_hash = stray.user_op_hash;
    let mut batch = WriteBatch::new();
    batch.upsert_user_operation(stray);
    harness.repository.commit(batch).await.unwrap();

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(report.discarded, 1);

    let record = harness.repository.get_user_operation(valid).await.unwrap().unwrap();
    assert_eq!(record.status, UserOperationStatus::Pending);
    assert!(harness.repository.get_user_operation(stray_hash).await.unwrap().is_none());
    assert!(harness.drain_events().iter().any(|e| matches!(
        e,
        BundlerEvent::UserOperationDropped { user_op_hash, reason: DropReason::Unbundleable, .. }
            if *user_op_hash == stray_hash
    )));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 0);
    assert_eq!(report.discarded, 0);
}

#[tokio::test]
async fn reverting_operation_is_split_out_then_dropped() {
    let mut chain = chain_config(1);
    chain.requires_gas_estimate = true;
    let mut harness = Harness::new(chain).await;
    let good = harness.admit(1, 0).await;
    let bad = harness.admit(2, 0).await;
    harness.client.revert_estimates_for(sender(2));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(report.discarded, 0);

    let pending = harness.transactions(TransactionStatus::Pending).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].user_operation_hashes, vec![good]);
    let record = harness.repository.get_user_operation(bad).await.unwrap().unwrap();
    assert_eq!(record.status, UserOperationStatus::Local);
    assert!(record.estimate_failures <= 1);

    let mut discarded = 0;
    for _ in 0..MAX_ESTIMATE_FAILURES {
        let report = harness.bundler.bundle_once().await.unwrap();
        assert_eq!(report.submitted, 0);
        discarded += report.discarded;
        if discarded > 0 {
            break;
        }
    }
    assert_eq!(discarded, 1);
    assert!(harness.repository.get_user_operation(bad).await.unwrap().is_none());
    assert_eq!(harness.transactions(TransactionStatus::Pending).await.len(), 1);
    assert!(harness.drain_events().iter().any(|e| matches!(
        e,
        BundlerEvent::UserOperationDropped { user_op_hash, reason: DropReason::Unbundleable, .. }
            if *user_op_hash == bad
    )));
}

#[tokio::test]
async fn split_bundles_never_exceed_the_signer_budget() {
    let mut chain = chain_config(1);
    chain.requires_gas_estimate = true;
    chain.pending_transaction_signer_handle_limit = 1;
    let harness = Harness::new(chain).await;
    for sender_byte in 1..=4 {
        harness.admit(sender_byte, 0).await;
    }
    harness.client.revert_estimates_for(sender(4));

    let report = harness.bundler.bundle_once().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(harness.client.broadcast_count(), 1);
    assert_eq!(harness.transactions(TransactionStatus::Pending).await.len(), 1);
    assert_eq!(harness.transactions(TransactionStatus::Local).await.len(), 0);
}
