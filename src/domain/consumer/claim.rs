use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::entity::{ConsumedMessage, TopicPartition};
use crate::error::ConsumerError;

/// GroupSession は 1 つのリバランス世代の間だけ有効なセッション。
pub trait GroupSession: Send + Sync {
    fn member_id(&self) -> &str;

    /// リバランス世代番号。
    fn generation(&self) -> u64;

    /// この世代で割り当てられたパーティション。
    fn claims(&self) -> &[TopicPartition];

    /// 世代の終了または Worker の停止でキャンセルされるトークン。
    fn context(&self) -> &CancellationToken;

    /// メッセージを処理済みとして記録する。処理が成功した後にのみ呼び出すこと。
    fn mark_message(&self, message: &ConsumedMessage) -> Result<(), ConsumerError>;
}

/// PartitionClaim は 1 パーティション分のメッセージ列。
///
/// メッセージはブローカーのログ順に届く。世代が終わると `next` は `None` を返す。
pub struct PartitionClaim {
    topic_partition: TopicPartition,
    messages: mpsc::Receiver<ConsumedMessage>,
    done: CancellationToken,
}

impl PartitionClaim {
    pub fn new(
        topic_partition: TopicPartition,
        messages: mpsc::Receiver<ConsumedMessage>,
        done: CancellationToken,
    ) -> Self {
        Self {
            topic_partition,
            messages,
            done,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic_partition.topic
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// 次のメッセージを待つ。世代が終了した場合は `None` を返す。
    pub async fn next(&mut self) -> Option<ConsumedMessage> {
        if self.done.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.done.cancelled() => None,
            msg = self.messages.recv() => msg,
        }
    }
}

/// ClaimHandler は割り当てられたパーティションのメッセージを処理する。
///
/// 1 世代の中で複数パーティションに対して並行に呼び出されるため、
/// 実装はスレッドセーフでなければならない。
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    /// 世代の開始時、メッセージ配信前に 1 度呼び出される。
    async fn setup(&self, _session: &dyn GroupSession) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// 世代の終了時、全クレームの処理が終わった後に 1 度呼び出される。
    async fn cleanup(&self, _session: &dyn GroupSession) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// クレームのメッセージを順に処理する。エラーを返すとクレームは中断される。
    async fn handle_claim(
        &self,
        session: &dyn GroupSession,
        claim: PartitionClaim,
    ) -> Result<(), ConsumerError>;
}
