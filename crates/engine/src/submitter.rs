use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use anyhow::{Result, anyhow};
use bundler_audit::{BundlerEvent, DropReason, Notifier};
use bundler_chain::{BroadcastError, ChainClient, TransactionSigner};
use bundler_core::entry_point::encode_handle_ops;
use bundler_core::{
    ChainConfig, GasFees, TransactionRecord, TransactionStatus, UnsignedTransaction,
    UserOperationRecord, UserOperationStatus,
};
use bundler_datastore::{Repository, TransactionOrder, TransactionQuery, WriteBatch};
use tracing::{debug, info, warn};

use crate::fees::initial_fees;
use crate::metrics::Metrics;
use crate::packer::Bundle;
use crate::signer::SignerAllocator;

/// What became of one broadcast attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted by the node; the transaction is Pending.
    Sent(B256),
    /// The signer ran out of funds and is blocked; the transaction stays Local.
    SignerBlocked,
    /// The nonce slot was lost; the transaction is deleted and its operations
    /// are back in the pool.
    Invalidated,
    /// Rejected for another reason; the transaction stays Local for a later attempt.
    Deferred,
}

/// Rounds a lone operation may fail gas estimation before it is dropped.
pub const MAX_ESTIMATE_FAILURES: u32 = 3;

/// Result of submitting one signer's bundles.
#[derive(Debug, Default)]
pub struct SubmitReport {
    /// One entry per transaction created, in nonce order.
    pub outcomes: Vec<SubmitOutcome>,
    /// Operations that can never be bundled and should leave the pool.
    pub rejected: Vec<(UserOperationRecord, DropReason)>,
}

#[derive(Debug, thiserror::Error)]
enum BuildError {
    /// The payloads cannot be sent to the bundle's entry point.
    #[error("{0}")]
    Unencodable(String),
    #[error("bundle gas estimation failed: {0:#}")]
    Estimate(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Builds, persists and broadcasts bundle transactions for one chain.
#[derive(Clone)]
pub struct Submitter {
    chain: Arc<ChainConfig>,
    client: Arc<dyn ChainClient>,
    repository: Arc<dyn Repository>,
    allocator: Arc<SignerAllocator>,
    notifier: Notifier,
    metrics: Metrics,
}

impl Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("chain_id", &self.chain.chain_id)
            .finish()
    }
}

impl Submitter {
    pub fn new(
        chain: Arc<ChainConfig>,
        client: Arc<dyn ChainClient>,
        repository: Arc<dyn Repository>,
        allocator: Arc<SignerAllocator>,
        notifier: Notifier,
        metrics: Metrics,
    ) -> Self {
        Self {
            chain,
            client,
            repository,
            allocator,
            notifier,
            metrics,
        }
    }

    /// First nonce this signer can use: past its last local transaction, the
    /// node's pending count, and any nonce known to be consumed.
    pub async fn next_nonce(&self, signer: Address) -> Result<u64> {
        let local = self
            .repository
            .latest_transaction_for_signer(self.chain.chain_id, signer)
            .await?
            .map_or(0, |tx| tx.nonce + 1);
        let remote = self.client.get_transaction_count(signer).await?;
        let hinted = self
            .allocator
            .done_max_nonce(&signer)
            .map_or(0, |nonce| nonce + 1);
        Ok(local.max(remote).max(hinted))
    }

    /// Submits `bundles` from `signer` on consecutive nonces.
    ///
    /// At most `bundles.len()` transactions are created. A bundle whose gas
    /// estimate fails is split in halves and retried; a lone operation that
    /// keeps failing, or payloads the entry point cannot take, are reported as
    /// rejected. Stops early when the signer gets blocked, loses its nonce
    /// slot, or a transaction cannot be persisted; untouched bundles stay in
    /// the pool.
    pub async fn submit(&self, signer: Address, bundles: Vec<Bundle>) -> Result<SubmitReport> {
        let key = self
            .allocator
            .signer(&signer)
            .ok_or_else(|| anyhow!("unknown signer {signer}"))?;
        let mut nonce = self.next_nonce(signer).await?;
        let fees = initial_fees(&self.chain, &self.client.get_fee_data().await?);

        let allowed = bundles.len();
        let mut created = 0;
        let mut report = SubmitReport::default();
        let mut queue = VecDeque::from(bundles);
        while let Some(bundle) = queue.pop_front() {
            if created >= allowed {
                break;
            }
            let tx = match self.build(key, nonce, fees, &bundle).await {
                Ok(tx) => tx,
                Err(BuildError::Unencodable(reason)) => {
                    warn!(
                        chain_id = self.chain.chain_id,
                        entry_point = %bundle.entry_point,
                        user_ops = bundle.records.len(),
                        reason,
                        "Rejecting bundle the entry point cannot take"
                    );
                    report.rejected.extend(
                        bundle
                            .records
                            .into_iter()
                            .map(|record| (record, DropReason::Unbundleable)),
                    );
                    continue;
                }
                Err(BuildError::Estimate(e)) => {
                    match bundle.bisect(&self.chain.gas) {
                        Ok((first, second)) => {
                            debug!(
                                chain_id = self.chain.chain_id,
                                error = %e,
                                "Gas estimation failed, splitting bundle"
                            );
                            queue.push_front(second);
                            queue.push_front(first);
                        }
                        Err(lone) => {
                            if let Some(record) = self.record_estimate_failure(lone, &e).await? {
                                report.rejected.push((record, DropReason::Unbundleable));
                            }
                        }
                    }
                    continue;
                }
                Err(e) => {
                    warn!(
                        chain_id = self.chain.chain_id,
                        %signer,
                        error = %e,
                        "Skipping bundle that could not be built"
                    );
                    continue;
                }
            };

            match self.persist(&tx).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.notifier.alert(
                        Some(self.chain.chain_id),
                        format!("failed to persist bundle transaction from {signer}: {e:#}"),
                    );
                    break;
                }
            }
            self.allocator.increment_pending(signer);
            self.metrics.user_ops_bundled.increment(tx.user_operation_hashes.len() as u64);
            created += 1;
            nonce += 1;

            let outcome = self.broadcast(tx).await?;
            report.outcomes.push(outcome);
            if matches!(outcome, SubmitOutcome::SignerBlocked | SubmitOutcome::Invalidated) {
                break;
            }
        }
        Ok(report)
    }

    async fn build(
        &self,
        key: &TransactionSigner,
        nonce: u64,
        fees: GasFees,
        bundle: &Bundle,
    ) -> Result<TransactionRecord, BuildError> {
        let served = self.chain.entry_point_version(&bundle.entry_point);
        if served != Some(bundle.version) {
            return Err(BuildError::Unencodable(format!(
                "{:?} payloads sent to entry point serving {served:?}",
                bundle.version
            )));
        }

        let signer = key.address();
        let (hashes, ops): (Vec<B256>, Vec<_>) = bundle.flattened().into_iter().unzip();
        let beneficiary = self.chain.beneficiary.unwrap_or(signer);
        let call_data = encode_handle_ops(&ops, beneficiary).ok_or_else(|| {
            BuildError::Unencodable("bundle is empty or mixes entry point versions".into())
        })?;

        let mut unsigned = UnsignedTransaction {
            chain_id: self.chain.chain_id,
            from: signer,
            to: bundle.entry_point,
            nonce,
            call_data,
            gas_limit: self.chain.gas.bundle_gas_limit(bundle.gas),
            fees,
        };
        if self.chain.requires_gas_estimate {
            let estimate = self
                .client
                .estimate_gas(&unsigned)
                .await
                .map_err(BuildError::Estimate)?;
            unsigned.gas_limit = unsigned.gas_limit.max(estimate);
        }

        let signed = key.sign(&unsigned)?;
        Ok(TransactionRecord::new_local(unsigned, hashes, signed))
    }

    /// Counts a failed estimate against the bundle's only operation.
    ///
    /// Returns the record once it has failed [`MAX_ESTIMATE_FAILURES`] times.
    async fn record_estimate_failure(
        &self,
        bundle: Bundle,
        error: &anyhow::Error,
    ) -> Result<Option<UserOperationRecord>> {
        let Some(picked) = bundle.records.into_iter().next() else {
            return Ok(None);
        };
        let Some(mut record) = self.repository.get_user_operation(picked.user_op_hash).await? else {
            return Ok(None);
        };
        if record.status != UserOperationStatus::Local || record.transaction_id.is_some() {
            return Ok(None);
        }

        record.estimate_failures += 1;
        warn!(
            chain_id = self.chain.chain_id,
            user_op_hash = %record.user_op_hash,
            failures = record.estimate_failures,
            error = %error,
            "User operation failed gas estimation"
        );
        if record.estimate_failures >= MAX_ESTIMATE_FAILURES {
            return Ok(Some(record));
        }
        let mut batch = WriteBatch::new();
        batch.upsert_user_operation(record);
        self.repository.commit(batch).await?;
        Ok(None)
    }

    /// Stores the transaction as Local and its members as Pending in one commit.
    ///
    /// Returns `false` when a member changed since it was picked.
    async fn persist(&self, tx: &TransactionRecord) -> Result<bool> {
        let members = self
            .repository
            .get_user_operations(&tx.user_operation_hashes)
            .await?;
        let intact = members.len() == tx.user_operation_hashes.len()
            && members.iter().all(|record| {
                record.transaction_id.is_none()
                    && matches!(
                        record.status,
                        UserOperationStatus::Local | UserOperationStatus::Associated
                    )
            });
        if !intact {
            debug!(transaction_id = %tx.id, "Bundle members changed since picked");
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        batch.insert_transaction(tx.clone());
        for mut record in members {
            record.mark_pending(tx.id);
            batch.upsert_user_operation(record);
        }
        self.repository.commit(batch).await?;
        Ok(true)
    }

    /// Hands the latest signed payload of a Local transaction to the node.
    pub async fn broadcast(&self, mut tx: TransactionRecord) -> Result<SubmitOutcome> {
        let (Some(tx_hash), Some(raw)) = (tx.latest_tx_hash(), tx.latest_signed_tx().cloned()) else {
            return Err(anyhow!("transaction {} has no signed payload", tx.id));
        };

        match self.client.broadcast_transaction(&raw).await {
            Ok(_) | Err(BroadcastError::AlreadyKnown(_)) => {
                tx.mark_sent();
                let mut batch = WriteBatch::new();
                batch.update_transaction(tx.clone());
                self.repository.commit(batch).await?;

                info!(
                    chain_id = self.chain.chain_id,
                    transaction_id = %tx.id,
                    signer = %tx.from,
                    nonce = tx.nonce,
                    %tx_hash,
                    user_ops = tx.user_operation_hashes.len(),
                    "Submitted bundle transaction"
                );
                self.metrics.bundles_submitted.increment(1);
                self.notifier.emit(BundlerEvent::TransactionSubmitted {
                    chain_id: self.chain.chain_id,
                    transaction_id: tx.id,
                    signer: tx.from,
                    nonce: tx.nonce,
                    tx_hash,
                    user_op_hashes: tx.user_operation_hashes,
                });
                Ok(SubmitOutcome::Sent(tx_hash))
            }
            Err(BroadcastError::InsufficientFunds(message)) => {
                self.metrics.broadcast_failures.increment(1);
                self.allocator.block(tx.from, &message);
                self.metrics.blocked_signers.set(self.allocator.blocked().len() as f64);
                Ok(SubmitOutcome::SignerBlocked)
            }
            Err(e) if e.invalidates_transaction() => {
                self.metrics.broadcast_failures.increment(1);
                self.invalidate(&tx, &e.to_string()).await?;
                Ok(SubmitOutcome::Invalidated)
            }
            Err(e) => {
                self.metrics.broadcast_failures.increment(1);
                self.notifier.alert(
                    Some(self.chain.chain_id),
                    format!("broadcast of transaction {} failed: {e}", tx.id),
                );
                Ok(SubmitOutcome::Deferred)
            }
        }
    }

    /// Deletes the transaction and returns its members to the pool.
    async fn invalidate(&self, tx: &TransactionRecord, reason: &str) -> Result<()> {
        let members = self
            .repository
            .get_user_operations(&tx.user_operation_hashes)
            .await?;

        let mut batch = WriteBatch::new();
        batch.delete_transaction(tx.id);
        for mut record in members {
            if record.transaction_id == Some(tx.id) {
                record.revert_to_local();
                batch.upsert_user_operation(record);
            }
        }
        self.repository.commit(batch).await?;
        self.allocator.decrement_pending(tx.from);

        warn!(
            chain_id = self.chain.chain_id,
            transaction_id = %tx.id,
            signer = %tx.from,
            nonce = tx.nonce,
            reason,
            "Invalidated bundle transaction"
        );
        self.notifier.emit(BundlerEvent::TransactionInvalidated {
            chain_id: self.chain.chain_id,
            transaction_id: tx.id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Re-attempts every Local transaction of unblocked signers, lowest nonce first.
    pub async fn resend_local(&self) -> Result<usize> {
        let query = TransactionQuery::chain(self.chain.chain_id)
            .with_status(TransactionStatus::Local)
            .ordered_by(TransactionOrder::Id);
        let mut by_signer: BTreeMap<Address, Vec<TransactionRecord>> = BTreeMap::new();
        for tx in self.repository.list_transactions(&query).await? {
            by_signer.entry(tx.from).or_default().push(tx);
        }

        let mut sent = 0;
        for (signer, mut transactions) in by_signer {
            if self.allocator.is_blocked(&signer) {
                continue;
            }
            let Some(_guard) = self.allocator.try_lock(signer) else {
                continue;
            };
            transactions.sort_by_key(|tx| tx.nonce);
            for tx in transactions {
                match self.broadcast(tx).await? {
                    SubmitOutcome::Sent(_) => sent += 1,
                    SubmitOutcome::SignerBlocked => break,
                    SubmitOutcome::Invalidated | SubmitOutcome::Deferred => {}
                }
            }
        }
        Ok(sent)
    }
}
