use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::publisher::EventPublisher;
use crate::types::BundlerEvent;

/// Fire-and-forget event sink. Never blocks and never fails the caller.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    event_tx: Option<mpsc::UnboundedSender<BundlerEvent>>,
}

impl Notifier {
    pub const fn new(event_tx: mpsc::UnboundedSender<BundlerEvent>) -> Self {
        Self { event_tx: Some(event_tx) }
    }

    /// A notifier plus the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BundlerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self::new(event_tx), event_rx)
    }

    /// Drops every event.
    pub const fn disabled() -> Self {
        Self { event_tx: None }
    }

    pub fn emit(&self, event: BundlerEvent) {
        if let Some(event_tx) = &self.event_tx {
            if let Err(e) = event_tx.send(event) {
                warn!(error = %e, "Failed to emit bundler event");
            }
        }
    }

    pub fn alert(&self, chain_id: Option<u64>, message: impl Into<String>) {
        let message = message.into();
        warn!(chain_id = ?chain_id, message = %message, "Raising alert");
        self.emit(BundlerEvent::Alert { chain_id, message });
    }
}

/// Drains `event_rx` into `publisher` until every sender is gone.
pub fn connect_events_to_publisher<P>(
    mut event_rx: mpsc::UnboundedReceiver<BundlerEvent>,
    publisher: Arc<P>,
) -> tokio::task::JoinHandle<()>
where
    P: EventPublisher + ?Sized + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = publisher.publish(event).await {
                error!(error = %e, "Failed to publish bundler event");
            }
        }
    })
}
