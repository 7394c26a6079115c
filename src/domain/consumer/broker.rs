use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::entity::{ConsumedMessage, TopicPartition};
use crate::error::ConsumerError;

/// BrokerClient はコンシューマーグループに参加する 1 接続分のブローカークライアント。
///
/// 1 つの Worker が排他的に所有し、Worker 間で共有されることはない。
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// グループ内でこのクライアントを識別するメンバー ID を返す。
    fn member_id(&self) -> &str;

    /// トピックを購読してグループに参加する。購読済みの場合は何もしない。
    fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError>;

    /// リバランス世代のウォッチを返す。割り当てが変わるたびに値が増加する。
    fn rebalances(&self) -> watch::Receiver<u64>;

    /// 現在割り当てられているパーティションを返す。
    fn assignment(&self) -> Result<Vec<TopicPartition>, ConsumerError>;

    /// 割り当て済みパーティションから次のメッセージを受信する。
    ///
    /// 返却前に future が破棄されてもメッセージは失われない。
    async fn recv(&self) -> Result<ConsumedMessage, ConsumerError>;

    /// パーティションの処理済み位置を記録する。`next_offset` は次に読むべきオフセット。
    fn mark(&self, tp: &TopicPartition, next_offset: i64) -> Result<(), ConsumerError>;

    /// パーティションの読み出し位置を `offset` に戻す。
    fn rewind(&self, tp: &TopicPartition, offset: i64) -> Result<(), ConsumerError>;

    /// グループから離脱して接続を閉じる。
    async fn close(&self) -> Result<(), ConsumerError>;
}

/// BrokerConnector は Worker ごとに BrokerClient を生成する。
///
/// 生成時にブローカーへの疎通を確認し、失敗した場合はエラーを返す。
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Client: BrokerClient + 'static;

    async fn connect(&self, worker_id: usize) -> Result<Self::Client, ConsumerError>;
}
