//! rdkafka を使用した BrokerClient / BrokerConnector 実装。

pub mod client;
pub mod context;

pub use client::{KafkaConnector, KafkaConnectorConfig, KafkaGroupClient};
pub use context::GroupContext;
