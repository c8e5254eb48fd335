use std::pin::Pin;

use alloy_primitives::Address;
use alloy_provider::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy_rpc_types::Filter;
use anyhow::{Context, Result};
use bundler_core::entry_point::USER_OPERATION_EVENT_TOPIC;
use futures_util::{Stream, StreamExt};

use crate::client::ChainLog;

pub type LogStream = Pin<Box<dyn Stream<Item = ChainLog> + Send>>;

/// Opens a websocket `eth_subscribe("logs")` for `UserOperationEvent`s of the
/// given entry points. The stream ends when the connection drops.
pub async fn subscribe_user_operation_events(
    ws_url: &str,
    entry_points: &[Address],
) -> Result<LogStream> {
    let provider: RootProvider = ProviderBuilder::default()
        .connect_ws(WsConnect::new(ws_url))
        .await
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    let filter = Filter::new()
        .address(entry_points.to_vec())
        .event_signature(USER_OPERATION_EVENT_TOPIC);
    let subscription = provider
        .subscribe_logs(&filter)
        .await
        .context("eth_subscribe logs rejected")?;

    let stream = subscription.into_stream().map(move |log| {
        // the pubsub service lives as long as its provider
        let _ = &provider;
        ChainLog::from(&log)
    });
    Ok(Box::pin(stream))
}
