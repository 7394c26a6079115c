use rdkafka::client::ClientContext;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::TopicPartitionList;
use tokio::sync::watch;

/// GroupContext は librdkafka のリバランスコールバックを世代番号のウォッチに変換する。
pub struct GroupContext {
    member_id: String,
    generation: watch::Sender<u64>,
}

impl GroupContext {
    pub fn new(member_id: impl Into<String>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            member_id: member_id.into(),
            generation,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            tracing::info!(
                member_id = %self.member_id,
                partitions = tpl.count(),
                "partitions revoked"
            );
        }
    }

    fn post_rebalance(&self, _base: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                tracing::info!(
                    member_id = %self.member_id,
                    partitions = tpl.count(),
                    "partitions assigned"
                );
                self.bump();
            }
            Rebalance::Revoke(_) => self.bump(),
            Rebalance::Error(e) => {
                tracing::error!(member_id = %self.member_id, error = %e, "rebalance error");
                self.bump();
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => tracing::debug!(member_id = %self.member_id, partitions = offsets.count(), "offsets committed"),
            Err(e) => tracing::warn!(member_id = %self.member_id, error = %e, "offset commit failed"),
        }
    }
}
