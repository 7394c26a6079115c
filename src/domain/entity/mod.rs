pub mod asset_event;
pub mod consumed_message;

pub use asset_event::{AssetEvent, DeletePayload};
pub use consumed_message::{ConsumedMessage, TopicPartition};
