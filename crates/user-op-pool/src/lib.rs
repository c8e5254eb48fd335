pub mod pool;
pub mod source;

use std::collections::HashMap;
use std::sync::Arc;

use bundler_core::ChainConfig;
use source::UserOpSource;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub use pool::{LockedOperation, OperationPool, PoolError, PoolSettings};
pub use source::{KafkaUserOpSource, UserOpSubmission};

/// Spawns every source and admits what they deliver into the pool.
///
/// Submissions for chains missing from `chains` are dropped with a warning.
pub fn connect_sources_to_pool<S>(
    sources: Vec<S>,
    mut submission_rx: mpsc::UnboundedReceiver<UserOpSubmission>,
    pool: Arc<OperationPool>,
    chains: Arc<HashMap<u64, ChainConfig>>,
) -> JoinHandle<()>
where
    S: UserOpSource + Send + Sync + 'static,
{
    for source in sources {
        tokio::spawn(async move {
            if let Err(e) = source.run().await {
                error!(error = %e, "User operation source failed");
            }
        });
    }

    tokio::spawn(async move {
        while let Some(submission) = submission_rx.recv().await {
            let Some(chain) = chains.get(&submission.chain_id) else {
                warn!(chain_id = submission.chain_id, "Dropping submission for unknown chain");
                continue;
            };
            if let Err(e) = pool.admit(chain, submission.request).await {
                debug!(chain_id = chain.chain_id, error = %e, "Rejected user operation");
            }
        }
    })
}
