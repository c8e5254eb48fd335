use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use alloy_primitives::B256;
use anyhow::Result;
use bundler_audit::{Hint, Notifier};
use bundler_chain::{ChainClient, subscribe_user_operation_events};
use bundler_core::{BundlerSettings, ChainConfig, UserOperationRecord, UserOperationRequest};
use bundler_datastore::{DatastoreError, Repository};
use bundler_user_op_pool::{LockedOperation, OperationPool, PoolError};
use futures_util::future::join_all;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::hints::ReceiptCache;
use crate::metrics::Metrics;
use crate::monitor::{MonitorSettings, PendingMonitor};
use crate::packer::{SignerBudget, pack_bundles};
use crate::signer::{AllocatedSigner, SignerAllocator};
use crate::submitter::{SubmitOutcome, Submitter};
use crate::subscription::LogSubscription;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("chain {0} is not configured")]
    UnknownChain(u64),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Counts from one bundling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleReport {
    /// Transactions accepted by the node this pass.
    pub submitted: usize,
    /// Operations removed because they can never be bundled.
    pub discarded: usize,
    /// Operations picked but left in the pool for lack of signer budget.
    pub unused: usize,
    /// Local transactions successfully re-sent.
    pub resent: usize,
}

/// Everything that runs on one chain's tick.
pub struct ChainBundler {
    chain: Arc<ChainConfig>,
    settings: BundlerSettings,
    client: Arc<dyn ChainClient>,
    pool: Arc<OperationPool>,
    allocator: Arc<SignerAllocator>,
    submitter: Submitter,
    monitor: PendingMonitor,
    receipts: Arc<ReceiptCache>,
    auto_bundling: AtomicBool,
    wake: Arc<Notify>,
    metrics: Metrics,
}

impl std::fmt::Debug for ChainBundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainBundler")
            .field("chain_id", &self.chain.chain_id)
            .field("auto_bundling", &self.auto_bundling.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChainBundler {
    pub async fn new(
        chain: ChainConfig,
        settings: BundlerSettings,
        client: Arc<dyn ChainClient>,
        pool: Arc<OperationPool>,
        notifier: Notifier,
    ) -> Result<Self> {
        let chain = Arc::new(chain);
        let repository = Arc::clone(pool.repository());
        let metrics = Metrics::for_chain(chain.chain_id);
        let allocator = Arc::new(SignerAllocator::new(
            &chain,
            settings.development,
            settings.lock_ttl,
            notifier.clone(),
        )?);
        allocator.sync_pending_counts(repository.as_ref()).await?;

        let receipts = Arc::new(ReceiptCache::default());
        let submitter = Submitter::new(
            Arc::clone(&chain),
            Arc::clone(&client),
            Arc::clone(&repository),
            Arc::clone(&allocator),
            notifier.clone(),
            metrics.clone(),
        );
        let monitor = PendingMonitor::new(
            Arc::clone(&chain),
            Arc::clone(&client),
            repository,
            Arc::clone(&allocator),
            Arc::clone(&receipts),
            notifier,
            metrics.clone(),
            MonitorSettings::from(&settings),
        );

        info!(
            chain_id = chain.chain_id,
            signers = allocator.addresses().len(),
            entry_points = chain.entry_points.len(),
            "Chain bundler ready"
        );
        Ok(Self {
            chain,
            settings,
            client,
            pool,
            allocator,
            submitter,
            monitor,
            receipts,
            auto_bundling: AtomicBool::new(true),
            wake: Arc::new(Notify::new()),
            metrics,
        })
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    pub fn allocator(&self) -> &Arc<SignerAllocator> {
        &self.allocator
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub fn monitor(&self) -> &PendingMonitor {
        &self.monitor
    }

    /// Wakes the tick loop ahead of its interval.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn set_auto_bundling(&self, enabled: bool) {
        self.auto_bundling.store(enabled, Ordering::Relaxed);
        info!(chain_id = self.chain.chain_id, enabled, "Auto bundling toggled");
    }

    pub fn auto_bundling(&self) -> bool {
        self.auto_bundling.load(Ordering::Relaxed)
    }

    /// Picks, packs and submits one round of operations.
    ///
    /// Signer and operation locks are held until the round's submissions
    /// have all returned.
    pub async fn bundle_once(&self) -> Result<BundleReport> {
        let started = Instant::now();
        let chain_id = self.chain.chain_id;
        let mut report = BundleReport::default();

        self.pool.evict(chain_id).await?;
        report.resent = self.submitter.resend_local().await?;

        let signers = self.allocator.available_signers();
        if signers.is_empty() {
            debug!(chain_id, "No signer with budget available");
            return Ok(report);
        }
        let picked = self
            .pool
            .pick_batch(chain_id, self.settings.pick_batch_size)
            .await?;
        if picked.is_empty() {
            return Ok(report);
        }

        let (records, _op_guards): (Vec<_>, Vec<_>) =
            picked.into_iter().map(LockedOperation::into_parts).unzip();
        let budgets: Vec<SignerBudget> = signers.iter().map(AllocatedSigner::budget).collect();
        let packed = pack_bundles(
            records,
            &budgets,
            self.chain.max_bundle_gas,
            self.chain.max_user_op_pack_count,
            &self.chain.gas,
        );

        if !packed.discarded.is_empty() {
            report.discarded = self.pool.discard(packed.discarded).await?;
            self.metrics.user_ops_discarded.increment(report.discarded as u64);
        }
        report.unused = packed.unused.len();

        let submissions = packed
            .assignments
            .into_iter()
            .map(|(signer, bundles)| async move { (signer, self.submitter.submit(signer, bundles).await) });
        let mut rejected = Vec::new();
        for (signer, result) in join_all(submissions).await {
            match result {
                Ok(submitted) => {
                    report.submitted += submitted
                        .outcomes
                        .iter()
                        .filter(|outcome| matches!(outcome, SubmitOutcome::Sent(_)))
                        .count();
                    rejected.extend(submitted.rejected);
                }
                Err(e) => warn!(chain_id, %signer, error = %e, "Bundle submission failed"),
            }
        }
        if !rejected.is_empty() {
            let removed = self.pool.discard(rejected).await?;
            self.metrics.user_ops_discarded.increment(removed as u64);
            report.discarded += removed;
        }
        drop(signers);

        self.metrics.bundle_duration.record(started.elapsed().as_secs_f64());
        if report.submitted > 0 || report.discarded > 0 {
            info!(
                chain_id,
                submitted = report.submitted,
                discarded = report.discarded,
                unused = report.unused,
                resent = report.resent,
                "Bundling pass complete"
            );
        }
        Ok(report)
    }

    /// One full pass: unblock funded signers, monitor, then bundle.
    pub async fn tick(&self) -> Result<()> {
        let unblocked = self.allocator.check_blocked_balances(self.client.as_ref()).await;
        if !unblocked.is_empty() {
            self.metrics.blocked_signers.set(self.allocator.blocked().len() as f64);
            self.submitter.resend_local().await?;
        }

        let started = Instant::now();
        self.monitor.run_once().await?;
        self.metrics.monitor_duration.record(started.elapsed().as_secs_f64());

        if self.auto_bundling() {
            self.bundle_once().await?;
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.tick().await {
                warn!(chain_id = self.chain.chain_id, error = %e, "Tick failed");
            }
        }
    }

    /// Folds a sibling process's hint into the local caches.
    pub fn apply_hint(&self, hint: Hint) {
        match hint {
            Hint::DoneNonce { signer, nonce, .. } => {
                self.allocator.record_done_nonce(signer, nonce);
            }
            Hint::Receipt { receipt, .. } => self.receipts.insert(receipt),
        }
        self.wake.notify_one();
    }
}

/// Multi-chain facade: one [`ChainBundler`] per configured chain over a shared pool.
#[derive(Debug)]
pub struct BundlerService {
    pool: Arc<OperationPool>,
    chains: HashMap<u64, Arc<ChainBundler>>,
}

impl BundlerService {
    pub fn new(pool: Arc<OperationPool>, chains: impl IntoIterator<Item = ChainBundler>) -> Self {
        let chains = chains
            .into_iter()
            .map(|bundler| (bundler.chain.chain_id, Arc::new(bundler)))
            .collect();
        Self { pool, chains }
    }

    pub fn chain(&self, chain_id: u64) -> Result<&Arc<ChainBundler>, ServiceError> {
        self.chains
            .get(&chain_id)
            .ok_or(ServiceError::UnknownChain(chain_id))
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.chains.keys().copied().collect()
    }

    fn repository(&self) -> &Arc<dyn Repository> {
        self.pool.repository()
    }

    pub async fn submit_user_operation(
        &self,
        chain_id: u64,
        request: UserOperationRequest,
    ) -> Result<B256, ServiceError> {
        let bundler = self.chain(chain_id)?;
        Ok(self.pool.admit(bundler.chain(), request).await?)
    }

    pub async fn get_user_operation_status(
        &self,
        user_op_hash: B256,
    ) -> Result<Option<UserOperationRecord>, ServiceError> {
        Ok(self.repository().get_user_operation(user_op_hash).await?)
    }

    pub async fn get_pending_count(&self, chain_id: u64) -> Result<usize, ServiceError> {
        self.chain(chain_id)?;
        Ok(self.pool.pending_count(chain_id).await?)
    }

    /// Runs a bundling pass now, whether or not auto bundling is on.
    pub async fn force_bundle(&self, chain_id: u64) -> Result<BundleReport, ServiceError> {
        Ok(self.chain(chain_id)?.bundle_once().await?)
    }

    pub fn set_auto_bundling(&self, chain_id: u64, enabled: bool) -> Result<(), ServiceError> {
        self.chain(chain_id)?.set_auto_bundling(enabled);
        Ok(())
    }

    pub async fn clear_local_pool(&self, chain_id: u64) -> Result<usize, ServiceError> {
        self.chain(chain_id)?;
        Ok(self.pool.clear_local(chain_id).await?)
    }

    pub fn apply_hint(&self, hint: Hint) {
        match self.chains.get(&hint.chain_id()) {
            Some(bundler) => bundler.apply_hint(hint),
            None => debug!(chain_id = hint.chain_id(), "Ignoring hint for unknown chain"),
        }
    }

    /// Routes hints arriving on `hint_rx` until every sender is gone.
    pub fn connect_hints(self: &Arc<Self>, mut hint_rx: mpsc::UnboundedReceiver<Hint>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(hint) = hint_rx.recv().await {
                service.apply_hint(hint);
            }
        })
    }

    /// Spawns every chain's tick loop, plus a log subscription for chains
    /// with a websocket endpoint.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.chains.len());
        for bundler in self.chains.values() {
            if let Some(ws_url) = bundler.chain.ws_url.clone() {
                let entry_points = bundler.chain.entry_points.clone();
                let subscription = LogSubscription::new(
                    bundler.chain.chain_id,
                    move || {
                        let ws_url = ws_url.clone();
                        let entry_points = entry_points.clone();
                        async move { subscribe_user_operation_events(&ws_url, &entry_points).await }
                    },
                    bundler.wake_handle(),
                );
                handles.push(tokio::spawn(async move { subscription.run().await }));
            }
            handles.push(tokio::spawn(Arc::clone(bundler).run()));
        }
        handles
    }
}
