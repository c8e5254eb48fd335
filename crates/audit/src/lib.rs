pub mod kafka;
pub mod notifier;
pub mod publisher;
pub mod source;
pub mod types;

pub use kafka::load_kafka_config_from_file;
pub use notifier::{Notifier, connect_events_to_publisher};
pub use publisher::{
    EventPublisher, InMemoryEventPublisher, KafkaEventPublisher, LoggingEventPublisher,
};
pub use source::{HintSource, KafkaHintSource, decode_hint};
pub use types::{BundlerEvent, DropReason, Hint};
