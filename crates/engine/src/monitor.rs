use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::B256;
use anyhow::{Context, Result, anyhow};
use bundler_audit::{BundlerEvent, Hint, Notifier};
use bundler_chain::{BroadcastError, ChainClient, LogFilter};
use bundler_core::entry_point::{USER_OPERATION_EVENT_TOPIC, user_op_hash_from_topics};
use bundler_core::{
    BundlerSettings, ChainConfig, TransactionId, TransactionReceipt, TransactionRecord,
    TransactionStatus, TtlLockSet,
};
use bundler_datastore::{Repository, TransactionOrder, TransactionQuery, WriteBatch};
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::fees::{escalate_fees, initial_fees};
use crate::hints::ReceiptCache;
use crate::metrics::Metrics;
use crate::signer::SignerAllocator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub pending_timeout: Duration,
    pub old_pending_threshold: Duration,
    pub recent_window: Duration,
    pub batch_size: usize,
    pub long_pending_batch_size: usize,
    pub lock_ttl: Duration,
}

impl From<&BundlerSettings> for MonitorSettings {
    fn from(settings: &BundlerSettings) -> Self {
        Self {
            pending_timeout: settings.pending_timeout,
            old_pending_threshold: settings.old_pending_threshold,
            recent_window: settings.recent_window,
            batch_size: settings.monitor_batch_size,
            long_pending_batch_size: settings.long_pending_batch_size,
            lock_ttl: settings.lock_ttl,
        }
    }
}

/// What one pass did to a single Pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Finalized against a receipt.
    Finalized { success: bool, mev_preempted: bool },
    /// Force-finalized without a receipt; the signer's nonce moved past it.
    Dropped,
    /// Included but still short of the required confirmations.
    Confirming(u64),
    /// Replaced with higher fees.
    Escalated(B256),
    /// Last payload sent again unchanged.
    Rebroadcast,
    /// Nothing to do yet.
    Waiting,
    /// Another pass holds this transaction.
    Skipped,
}

/// Drives Pending transactions to Done.
#[derive(Clone)]
pub struct PendingMonitor {
    chain: Arc<ChainConfig>,
    client: Arc<dyn ChainClient>,
    repository: Arc<dyn Repository>,
    allocator: Arc<SignerAllocator>,
    receipts: Arc<ReceiptCache>,
    notifier: Notifier,
    metrics: Metrics,
    settings: MonitorSettings,
    locks: TtlLockSet<TransactionId>,
    round: Arc<AtomicU64>,
}

impl Debug for PendingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMonitor")
            .field("chain_id", &self.chain.chain_id)
            .field("settings", &self.settings)
            .finish()
    }
}

impl PendingMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<ChainConfig>,
        client: Arc<dyn ChainClient>,
        repository: Arc<dyn Repository>,
        allocator: Arc<SignerAllocator>,
        receipts: Arc<ReceiptCache>,
        notifier: Notifier,
        metrics: Metrics,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            locks: TtlLockSet::new(settings.lock_ttl),
            chain,
            client,
            repository,
            allocator,
            receipts,
            notifier,
            metrics,
            settings,
            round: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Pending transactions to look at this pass.
    ///
    /// Recent transactions alternate between fewest-confirmations-first and
    /// oldest-first so neither class starves; long-pending ones get their own
    /// batch.
    pub async fn select(&self) -> Result<Vec<TransactionRecord>> {
        let round = self.round.fetch_add(1, Ordering::Relaxed);
        let order = if round % 2 == 0 {
            TransactionOrder::Confirmations
        } else {
            TransactionOrder::Id
        };
        let window = TimeDelta::from_std(self.settings.recent_window).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pending = TransactionQuery::chain(self.chain.chain_id).with_status(TransactionStatus::Pending);

        let recent = self
            .repository
            .list_transactions(&pending.clone().sent_after(cutoff).ordered_by(order).limit(self.settings.batch_size))
            .await?;
        let long_pending = self
            .repository
            .list_transactions(
                &pending
                    .sent_before(cutoff)
                    .ordered_by(TransactionOrder::Id)
                    .limit(self.settings.long_pending_batch_size),
            )
            .await?;

        let mut seen = HashSet::new();
        Ok(recent
            .into_iter()
            .chain(long_pending)
            .filter(|tx| seen.insert(tx.id))
            .collect())
    }

    /// Handles every selected transaction concurrently.
    pub async fn run_once(&self) -> Result<Vec<(TransactionId, Resolution)>> {
        let selected = self.select().await?;
        let results = join_all(selected.into_iter().map(|tx| async move {
            let id = tx.id;
            (id, self.handle(tx).await)
        }))
        .await;

        let mut resolutions = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(resolution) => resolutions.push((id, resolution)),
                Err(e) => warn!(
                    chain_id = self.chain.chain_id,
                    transaction_id = %id,
                    error = %e,
                    "Failed to handle pending transaction"
                ),
            }
        }
        Ok(resolutions)
    }

    pub async fn handle(&self, tx: TransactionRecord) -> Result<Resolution> {
        let Some(_guard) = self.locks.try_lock(tx.id) else {
            return Ok(Resolution::Skipped);
        };
        // another handler may have moved it on since selection
        let Some(tx) = self.repository.get_transaction(tx.id).await? else {
            return Ok(Resolution::Skipped);
        };
        if tx.status != TransactionStatus::Pending {
            return Ok(Resolution::Skipped);
        }

        match self.find_receipt(&tx).await? {
            Some(receipt) => self.resolve_receipt(tx, receipt).await,
            None => self.handle_missing_receipt(tx).await,
        }
    }

    /// The first receipt found for any hash in the replacement history.
    ///
    /// Fails when no receipt was found and any lookup failed, so an RPC outage
    /// is never mistaken for a missing receipt.
    async fn find_receipt(&self, tx: &TransactionRecord) -> Result<Option<TransactionReceipt>> {
        let lookups = tx.tx_hashes.iter().map(|hash| async move {
            if let Some(receipt) = self.receipts.get(hash) {
                return Ok(Some(receipt));
            }
            self.client
                .get_transaction_receipt(*hash)
                .await
                .with_context(|| format!("receipt lookup for {hash} failed"))
        });

        let mut failure = None;
        for result in join_all(lookups).await {
            match result {
                Ok(Some(receipt)) => return Ok(Some(receipt)),
                Ok(None) => {}
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn resolve_receipt(
        &self,
        mut tx: TransactionRecord,
        receipt: TransactionReceipt,
    ) -> Result<Resolution> {
        let required = self.chain.required_confirmations.max(1);
        if required > 1 {
            if let Some(block_number) = receipt.block_number {
                let head = self.client.get_block_number().await?;
                let confirmations = head.saturating_sub(block_number) + 1;
                if confirmations < required {
                    if tx.confirmations != confirmations {
                        tx.confirmations = confirmations;
                        tx.updated_at = Utc::now();
                        let mut batch = WriteBatch::new();
                        batch.update_transaction(tx);
                        self.repository.commit(batch).await?;
                    }
                    return Ok(Resolution::Confirming(confirmations));
                }
                tx.confirmations = confirmations;
            }
        } else {
            tx.confirmations = 1;
        }

        if receipt.success || !self.chain.mev_check {
            let resolved = tx
                .user_operation_hashes
                .iter()
                .map(|hash| (*hash, receipt.clone()))
                .collect();
            let success = receipt.success;
            self.finalize(tx, resolved, false).await?;
            return Ok(Resolution::Finalized { success, mev_preempted: false });
        }

        let competing = self.competing_receipts(&tx, &receipt).await?;
        let mev_preempted = !competing.is_empty();
        let resolved = tx
            .user_operation_hashes
            .iter()
            .map(|hash| {
                let landed = competing.get(hash).cloned().unwrap_or_else(|| receipt.clone());
                (*hash, landed)
            })
            .collect();
        self.finalize(tx, resolved, mev_preempted).await?;
        Ok(Resolution::Finalized { success: false, mev_preempted })
    }

    /// Receipts of other transactions that executed this transaction's
    /// operations within the lookback window, keyed by operation hash.
    async fn competing_receipts(
        &self,
        tx: &TransactionRecord,
        failed: &TransactionReceipt,
    ) -> Result<HashMap<B256, TransactionReceipt>> {
        let head = self.client.get_block_number().await?;
        let filter = LogFilter {
            addresses: vec![tx.to],
            topic0: USER_OPERATION_EVENT_TOPIC,
            from_block: head.saturating_sub(self.chain.mev_check_lookback_blocks),
            to_block: head,
        };
        let members: HashSet<B256> = tx.user_operation_hashes.iter().copied().collect();
        let own: HashSet<B256> = tx.tx_hashes.iter().copied().collect();

        let mut landed_in: HashMap<B256, B256> = HashMap::new();
        for log in self.client.get_logs(&filter).await? {
            let (Some(user_op_hash), Some(tx_hash)) =
                (user_op_hash_from_topics(&log.topics), log.transaction_hash)
            else {
                continue;
            };
            if members.contains(&user_op_hash) && tx_hash != failed.transaction_hash && !own.contains(&tx_hash) {
                landed_in.insert(user_op_hash, tx_hash);
            }
        }

        let mut receipts: HashMap<B256, TransactionReceipt> = HashMap::new();
        let mut competing = HashMap::new();
        for (user_op_hash, tx_hash) in landed_in {
            if !receipts.contains_key(&tx_hash) {
                let receipt = self
                    .client
                    .get_transaction_receipt(tx_hash)
                    .await?
                    .ok_or_else(|| anyhow!("competing transaction {tx_hash} has no receipt yet"))?;
                receipts.insert(tx_hash, receipt);
            }
            if let Some(receipt) = receipts.get(&tx_hash) {
                competing.insert(user_op_hash, receipt.clone());
            }
        }

        if !competing.is_empty() {
            info!(
                chain_id = self.chain.chain_id,
                transaction_id = %tx.id,
                preempted = competing.len(),
                "User operations landed through a competing transaction"
            );
        }
        Ok(competing)
    }

    async fn handle_missing_receipt(&self, tx: TransactionRecord) -> Result<Resolution> {
        if self
            .allocator
            .done_max_nonce(&tx.from)
            .is_some_and(|done| done > tx.nonce)
        {
            self.finalize(tx, HashMap::new(), false).await?;
            return Ok(Resolution::Dropped);
        }

        let pending_for = tx.pending_for(Utc::now()).to_std().unwrap_or_default();
        let can_escalate = self.chain.can_incr_gas_price_retry
            && tx.retry_count < self.chain.can_incr_gas_price_retry_max_count;
        if pending_for > self.settings.pending_timeout && can_escalate {
            return self.escalate(tx).await;
        }
        if pending_for > self.settings.old_pending_threshold {
            return self.rebroadcast(tx).await;
        }
        Ok(Resolution::Waiting)
    }

    /// Marks the transaction and its operations Done.
    ///
    /// Operations missing from `resolved` finish with empty receipt fields.
    async fn finalize(
        &self,
        mut tx: TransactionRecord,
        resolved: HashMap<B256, TransactionReceipt>,
        mev_preempted: bool,
    ) -> Result<()> {
        let members = self
            .repository
            .get_user_operations(&tx.user_operation_hashes)
            .await?;
        let mut batch = WriteBatch::new();
        for mut record in members {
            if record.transaction_id == Some(tx.id) {
                record.mark_done(resolved.get(&record.user_op_hash));
                batch.upsert_user_operation(record);
            }
        }

        let landed = resolved
            .values()
            .find(|receipt| tx.tx_hashes.contains(&receipt.transaction_hash))
            .cloned();
        let dropped = resolved.is_empty();
        tx.finalize(resolved);
        batch.update_transaction(tx.clone());
        self.repository.commit(batch).await?;

        self.allocator.decrement_pending(tx.from);
        self.allocator.record_done_nonce(tx.from, tx.nonce);

        if dropped {
            warn!(
                chain_id = self.chain.chain_id,
                transaction_id = %tx.id,
                signer = %tx.from,
                nonce = tx.nonce,
                "Force-finalized transaction without receipt"
            );
            self.metrics.transactions_dropped.increment(1);
        } else {
            info!(
                chain_id = self.chain.chain_id,
                transaction_id = %tx.id,
                signer = %tx.from,
                nonce = tx.nonce,
                mev_preempted,
                "Finalized transaction"
            );
            self.metrics.transactions_finalized.increment(1);
        }
        if mev_preempted {
            self.metrics.mev_preempted.increment(1);
        }

        self.notifier.emit(BundlerEvent::TransactionFinalized {
            chain_id: self.chain.chain_id,
            transaction_id: tx.id,
            tx_hash: landed.as_ref().map(|receipt| receipt.transaction_hash),
            success: landed.as_ref().is_some_and(|receipt| receipt.success),
            mev_preempted,
        });
        self.notifier.emit(BundlerEvent::Hint(Hint::DoneNonce {
            chain_id: self.chain.chain_id,
            signer: tx.from,
            nonce: tx.nonce,
        }));
        if let Some(receipt) = landed {
            self.notifier.emit(BundlerEvent::Hint(Hint::Receipt {
                chain_id: self.chain.chain_id,
                receipt,
            }));
        }
        Ok(())
    }

    /// Re-signs with escalated fees, records the new hash, then broadcasts it.
    async fn escalate(&self, mut tx: TransactionRecord) -> Result<Resolution> {
        let key = self
            .allocator
            .signer(&tx.from)
            .ok_or_else(|| anyhow!("unknown signer {}", tx.from))?;
        let network = initial_fees(&self.chain, &self.client.get_fee_data().await?);
        let fees = escalate_fees(&tx.fees, &network, self.chain.fee_increase_percent);

        let mut unsigned = tx.unsigned();
        unsigned.fees = fees;
        let signed = key.sign(&unsigned)?;
        let (tx_hash, raw) = (signed.hash, signed.raw.clone());

        tx.record_replacement(signed, fees);
        let mut batch = WriteBatch::new();
        batch.update_transaction(tx.clone());
        self.repository.commit(batch).await?;

        match self.client.broadcast_transaction(&raw).await {
            Ok(_) | Err(BroadcastError::AlreadyKnown(_)) => {}
            Err(BroadcastError::InsufficientFunds(message)) => {
                self.allocator.block(tx.from, &message);
            }
            Err(e) => {
                // a nonce-too-low here means an earlier version landed; receipts will show it
                debug!(transaction_id = %tx.id, error = %e, "Replacement rejected");
            }
        }

        info!(
            chain_id = self.chain.chain_id,
            transaction_id = %tx.id,
            %tx_hash,
            retry_count = tx.retry_count,
            max_fee_per_gas = fees.max_fee_per_gas(),
            "Escalated transaction fees"
        );
        self.metrics.replacements.increment(1);
        self.notifier.emit(BundlerEvent::TransactionReplaced {
            chain_id: self.chain.chain_id,
            transaction_id: tx.id,
            tx_hash,
            retry_count: tx.retry_count,
        });
        Ok(Resolution::Escalated(tx_hash))
    }

    /// Sends the last signed payload again, for nodes that evicted it.
    async fn rebroadcast(&self, mut tx: TransactionRecord) -> Result<Resolution> {
        let raw = tx
            .latest_signed_tx()
            .cloned()
            .ok_or_else(|| anyhow!("transaction {} has no signed payload", tx.id))?;
        if let Err(e) = self.client.broadcast_transaction(&raw).await {
            debug!(transaction_id = %tx.id, error = %e, "Rebroadcast rejected");
        }

        let now = Utc::now();
        tx.latest_sent_at = Some(now);
        tx.updated_at = now;
        let mut batch = WriteBatch::new();
        batch.update_transaction(tx);
        self.repository.commit(batch).await?;
        self.metrics.rebroadcasts.increment(1);
        Ok(Resolution::Rebroadcast)
    }
}
