use std::fmt;

use chrono::{DateTime, Utc};

/// TopicPartition はトピック名とパーティション番号の組を表す。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// ConsumedMessage はブローカーから受信したメッセージを表す。
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    /// トピック名
    pub topic: String,
    /// パーティション番号
    pub partition: i32,
    /// オフセット
    pub offset: i64,
    /// メッセージキー
    pub key: Option<Vec<u8>>,
    /// メッセージ本体
    pub value: Vec<u8>,
    /// ブローカーが付与したタイムスタンプ（取得できない場合は None）
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumedMessage {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// ログ出力用にメッセージ本体を UTF-8 として解釈する（不正なバイト列は置換される）。
    pub fn value_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}
