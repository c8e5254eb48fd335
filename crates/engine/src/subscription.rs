//! Optional websocket feed of `UserOperationEvent` logs.
//!
//! The feed only shortens the wait until the next monitor pass; polling stays
//! the source of truth, so losing the connection costs latency and nothing else.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backon::{ExponentialBuilder, Retryable};
use bundler_chain::LogStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Keeps a log subscription alive and pokes `wake` for every event seen.
pub struct LogSubscription<C> {
    chain_id: u64,
    connect: C,
    wake: Arc<Notify>,
    state: Arc<Mutex<SubscriptionState>>,
    reconnect_delay: Duration,
}

impl<C> std::fmt::Debug for LogSubscription<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSubscription")
            .field("chain_id", &self.chain_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl<C, Fut> LogSubscription<C>
where
    C: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<LogStream>> + Send,
{
    pub fn new(chain_id: u64, connect: C, wake: Arc<Notify>) -> Self {
        Self {
            chain_id,
            connect,
            wake,
            state: Arc::new(Mutex::new(SubscriptionState::Disconnected)),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Shared view of the current state.
    pub fn state_handle(&self) -> Arc<Mutex<SubscriptionState>> {
        Arc::clone(&self.state)
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    fn transition(&self, next: SubscriptionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(chain_id = self.chain_id, from = ?*state, to = ?next, "Log subscription state change");
            *state = next;
        }
    }

    /// Connects, drains the stream, and reconnects forever.
    pub async fn run(&self) {
        loop {
            self.run_once().await;
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// One connect-and-drain cycle; returns once the stream ends or connecting gives up.
    pub async fn run_once(&self) {
        self.transition(SubscriptionState::Connecting);
        let connected = (|| (self.connect)())
            .retry(
                &ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_delay(self.reconnect_delay)
                    .with_max_times(5),
            )
            .notify(|err: &anyhow::Error, dur: Duration| {
                info!(chain_id = self.chain_id, "Retrying log subscription {:?} after {:?}", err, dur);
            })
            .await;

        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!(chain_id = self.chain_id, error = %e, "Log subscription unavailable");
                self.transition(SubscriptionState::Disconnected);
                return;
            }
        };

        self.transition(SubscriptionState::Subscribed);
        info!(chain_id = self.chain_id, "Subscribed to user operation events");
        while let Some(log) = stream.next().await {
            debug!(
                chain_id = self.chain_id,
                tx_hash = ?log.transaction_hash,
                "User operation event observed"
            );
            self.wake.notify_one();
        }

        warn!(chain_id = self.chain_id, "Log subscription ended");
        self.transition(SubscriptionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy_primitives::{Address, B256};
    use anyhow::anyhow;
    use bundler_chain::ChainLog;
    use bundler_core::entry_point::USER_OPERATION_EVENT_TOPIC;
    use futures_util::stream;

    fn log() -> ChainLog {
        ChainLog {
            address: Address::ZERO,
            topics: vec![USER_OPERATION_EVENT_TOPIC, B256::repeat_byte(1)],
            transaction_hash: Some(B256::repeat_byte(2)),
            block_number: Some(1),
        }
    }

    #[tokio::test]
    async fn events_wake_the_monitor_and_end_disconnected() {
        let wake = Arc::new(Notify::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let connect = {
            let attempts = Arc::clone(&attempts);
            move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        return Err(anyhow!("connection refused"));
                    }
                    Ok(Box::pin(stream::iter(vec![log()])) as LogStream)
                }
            }
        };
        let subscription = LogSubscription::new(8453, connect, Arc::clone(&wake))
            .with_reconnect_delay(Duration::from_millis(1));
        assert_eq!(subscription.state(), SubscriptionState::Disconnected);

        subscription.run_once().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(subscription.state(), SubscriptionState::Disconnected);
        // the stored permit from notify_one resolves immediately
        tokio::time::timeout(Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_repeated_failures() {
        let subscription = LogSubscription::new(
            1,
            || async { Err::<LogStream, _>(anyhow!("no websocket endpoint")) },
            Arc::new(Notify::new()),
        )
        .with_reconnect_delay(Duration::from_millis(1));

        subscription.run_once().await;
        assert_eq!(subscription.state(), SubscriptionState::Disconnected);
    }
}
