//! Per-chain bundling engine: signer allocation, bundle packing, transaction
//! submission and the pending-transaction monitor, tied together by
//! [`BundlerService`].
pub mod fees;
pub mod hints;
pub mod metrics;
pub mod monitor;
pub mod packer;
pub mod service;
pub mod signer;
pub mod submitter;
pub mod subscription;

pub use hints::ReceiptCache;
pub use metrics::{Metrics, init_prometheus_exporter};
pub use monitor::{MonitorSettings, PendingMonitor, Resolution};
pub use packer::{Bundle, PackResult, SignerBudget, pack_bundles};
pub use service::{BundleReport, BundlerService, ChainBundler, ServiceError};
pub use signer::{AllocatedSigner, SignerAllocator};
pub use submitter::{MAX_ESTIMATE_FAILURES, SubmitOutcome, SubmitReport, Submitter};
pub use subscription::{LogSubscription, SubscriptionState};
