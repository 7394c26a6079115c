use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;

use crate::domain::assignor::AssignorStrategy;
use crate::domain::consumer::{BrokerClient, BrokerConnector};
use crate::domain::entity::{ConsumedMessage, TopicPartition};
use crate::error::ConsumerError;
use crate::infrastructure::config::RuntimeSettings;
use crate::infrastructure::kafka::context::GroupContext;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

type GroupConsumer = StreamConsumer<GroupContext>;

/// KafkaConnectorConfig は rdkafka クライアント生成に必要な設定。
#[derive(Debug, Clone)]
pub struct KafkaConnectorConfig {
    pub brokers: Vec<String>,
    pub version: String,
    pub group: String,
    pub assignor: AssignorStrategy,
    pub auto_offset_reset: &'static str,
}

impl From<&RuntimeSettings> for KafkaConnectorConfig {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            brokers: settings.brokers.clone(),
            version: settings.version.to_string(),
            group: settings.group.clone(),
            assignor: settings.assignor,
            auto_offset_reset: settings.initial_offset.as_auto_offset_reset(),
        }
    }
}

/// librdkafka の `partition.assignment.strategy` 値。
pub fn assignment_strategy(assignor: AssignorStrategy) -> &'static str {
    match assignor {
        AssignorStrategy::Range => "range",
        AssignorStrategy::RoundRobin => "roundrobin",
        AssignorStrategy::Sticky => "cooperative-sticky",
    }
}

impl KafkaConnectorConfig {
    /// Worker 用の rdkafka クライアント設定を組み立てる。
    pub fn client_config(&self, client_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", &self.group)
            .set("client.id", client_id)
            .set("api.version.request", "true")
            .set("broker.version.fallback", &self.version)
            .set("partition.assignment.strategy", assignment_strategy(self.assignor))
            .set("auto.offset.reset", self.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", "30000");
        config
    }
}

/// KafkaConnector は Worker ごとに rdkafka コンシューマーを生成する。
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    config: KafkaConnectorConfig,
}

impl KafkaConnector {
    pub fn new(config: KafkaConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    type Client = KafkaGroupClient;

    async fn connect(&self, worker_id: usize) -> Result<Self::Client, ConsumerError> {
        let member_id = format!("{}-worker-{worker_id}", self.config.group);
        let context = GroupContext::new(member_id.clone());
        let rebalances = context.subscribe();
        let consumer: GroupConsumer = self
            .config
            .client_config(&member_id)
            .create_with_context(context)
            .map_err(|e| ConsumerError::Configuration(e.to_string()))?;
        let consumer = Arc::new(consumer);

        // メタデータ取得でブローカーへの疎通を確認する
        let probe = consumer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|m| m.brokers().len())
        })
        .await
        .map_err(|e| ConsumerError::Connection(format!("metadata probe task failed: {e}")))?
        .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        tracing::info!(worker_id, member_id = %member_id, brokers = metadata, "kafka client connected");

        Ok(KafkaGroupClient {
            consumer,
            member_id,
            rebalances,
        })
    }
}

/// KafkaGroupClient は rdkafka の StreamConsumer を使った BrokerClient 実装。
pub struct KafkaGroupClient {
    consumer: Arc<GroupConsumer>,
    member_id: String,
    rebalances: watch::Receiver<u64>,
}

fn classify(e: KafkaError) -> ConsumerError {
    match &e {
        KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => {
            ConsumerError::Configuration(e.to_string())
        }
        _ => match e.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::UnsupportedVersion
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed,
            ) => ConsumerError::Protocol(e.to_string()),
            _ => ConsumerError::Connection(e.to_string()),
        },
    }
}

fn to_consumed(msg: &BorrowedMessage<'_>) -> ConsumedMessage {
    ConsumedMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        value: msg.payload().unwrap_or_default().to_vec(),
        timestamp: msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

#[async_trait]
impl BrokerClient for KafkaGroupClient {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError> {
        let current = self.consumer.subscription().map_err(classify)?;
        let already = topics.len() == current.count()
            && topics
                .iter()
                .all(|t| current.elements().iter().any(|e| e.topic() == t.as_str()));
        if already {
            return Ok(());
        }
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(classify)
    }

    fn rebalances(&self) -> watch::Receiver<u64> {
        self.rebalances.clone()
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, ConsumerError> {
        let tpl = self.consumer.assignment().map_err(classify)?;
        let mut claims: Vec<TopicPartition> = tpl
            .elements()
            .iter()
            .map(|e| TopicPartition::new(e.topic(), e.partition()))
            .collect();
        claims.sort();
        Ok(claims)
    }

    async fn recv(&self) -> Result<ConsumedMessage, ConsumerError> {
        let msg = self.consumer.recv().await.map_err(classify)?;
        Ok(to_consumed(&msg))
    }

    fn mark(&self, tp: &TopicPartition, next_offset: i64) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next_offset))
            .map_err(classify)?;
        match self.consumer.store_offsets(&tpl) {
            Ok(()) => Ok(()),
            // 割り当てが外れた直後のパーティションは新しい所有者が再配信する
            Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::State) => {
                tracing::debug!(claim = %tp, next_offset, "offset store skipped for unassigned partition");
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    fn rewind(&self, tp: &TopicPartition, offset: i64) -> Result<(), ConsumerError> {
        self.consumer
            .seek(&tp.topic, tp.partition, Offset::Offset(offset), SEEK_TIMEOUT)
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => {}
            Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) => {}
            Err(e) => tracing::warn!(member_id = %self.member_id, error = %e, "final offset commit failed"),
        }
        self.consumer.unsubscribe();
        tracing::info!(member_id = %self.member_id, "left consumer group");
        Ok(())
    }
}
