use std::sync::Arc;

use alloy_primitives::{Address, B256};
use bundler_audit::{
    BundlerEvent, DropReason, EventPublisher, InMemoryEventPublisher, Notifier,
    connect_events_to_publisher,
};

#[tokio::test]
async fn notifier_events_reach_publisher_in_order() {
    let (notifier, event_rx) = Notifier::channel();
    let publisher = Arc::new(InMemoryEventPublisher::new());
    let handle = connect_events_to_publisher(event_rx, publisher.clone());

    notifier.emit(BundlerEvent::UserOperationDropped {
        chain_id: 1,
        user_op_hash: B256::ZERO,
        reason: DropReason::ExceedsBundleGas,
    });
    notifier.alert(Some(2), "commit failed");
    notifier.emit(BundlerEvent::SignerBlocked {
        chain_id: 1,
        signer: Address::ZERO,
        reason: "insufficient funds".into(),
    });
    drop(notifier);
    handle.await.unwrap();

    let events = publisher.events().await;
    assert_eq!(events.len(), 3);
    assert!(matches!(events[1], BundlerEvent::Alert { chain_id: Some(2), .. }));
    assert_eq!(publisher.events_for_chain(1).await.len(), 2);
}

#[tokio::test]
async fn disabled_notifier_never_fails() {
    let notifier = Notifier::disabled();
    notifier.alert(None, "nobody listens");
    notifier.emit(BundlerEvent::SignerUnblocked {
        chain_id: 1,
        signer: Address::ZERO,
    });
}

#[tokio::test]
async fn closed_channel_is_tolerated() {
    let (notifier, event_rx) = Notifier::channel();
    drop(event_rx);
    notifier.alert(Some(1), "receiver gone");
}

#[tokio::test]
async fn in_memory_publisher_publish_all() {
    let publisher = InMemoryEventPublisher::new();
    publisher
        .publish_all(vec![
            BundlerEvent::Alert { chain_id: None, message: "a".into() },
            BundlerEvent::Alert { chain_id: None, message: "b".into() },
        ])
        .await
        .unwrap();
    assert_eq!(publisher.len().await, 2);
    publisher.reset().await;
    assert!(publisher.is_empty().await);
}
