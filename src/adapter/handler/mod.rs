pub mod asset_event_handler;
pub mod forward_handler;

pub use asset_event_handler::AssetEventClaimHandler;
pub use forward_handler::ForwardClaimHandler;

use crate::domain::entity::ConsumedMessage;

/// クレームしたメッセージを 1 行ログに出力する。
pub(crate) fn log_claimed(message: &ConsumedMessage) {
    tracing::info!(
        value = %message.value_lossy(),
        timestamp = ?message.timestamp,
        topic = %message.topic,
        partition = message.partition,
        offset = message.offset,
        "message claimed"
    );
}
