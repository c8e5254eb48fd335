pub mod client;
pub mod error;
pub mod signer;
pub mod subscription;

pub use client::{AlloyChainClient, ChainClient, ChainLog, FeeData, LogFilter};
pub use error::BroadcastError;
pub use signer::TransactionSigner;
pub use subscription::{LogStream, subscribe_user_operation_events};
