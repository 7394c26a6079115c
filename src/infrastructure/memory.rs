//! プロセス内で完結するインメモリブローカー。
//!
//! パーティションログ・グループメンバーシップ・割り当て戦略によるリバランス・
//! コミット済みオフセットを保持し、`BrokerClient` / `BrokerConnector` を実装する。
//! テストと `--in-memory` 起動で使用する。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Notify};

use crate::domain::assignor::{AssignorStrategy, GroupMember};
use crate::domain::consumer::{BrokerClient, BrokerConnector};
use crate::domain::entity::{ConsumedMessage, TopicPartition};
use crate::error::ConsumerError;
use crate::infrastructure::config::InitialOffset;

#[derive(Debug, Clone)]
struct StoredRecord {
    value: Vec<u8>,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemberState {
    subscriptions: Vec<String>,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    /// 次に読み出しを試みるパーティションの添字
    cursor: usize,
}

#[derive(Debug)]
struct GroupState {
    strategy: AssignorStrategy,
    members: BTreeMap<String, MemberState>,
    committed: HashMap<TopicPartition, i64>,
    generation: watch::Sender<u64>,
}

impl GroupState {
    fn new(strategy: AssignorStrategy) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            strategy,
            members: BTreeMap::new(),
            committed: HashMap::new(),
            generation,
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    default_strategy: AssignorStrategy,
    initial_offset: InitialOffset,
    topics: BTreeMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupState>,
    failures: VecDeque<ConsumerError>,
    next_member: u64,
}

impl BrokerState {
    fn log_end(&self, tp: &TopicPartition) -> i64 {
        self.topics
            .get(&tp.topic)
            .and_then(|partitions| usize::try_from(tp.partition).ok().and_then(|p| partitions.get(p)))
            .map_or(0, |log| i64::try_from(log.len()).unwrap_or(i64::MAX))
    }

    fn record(&self, tp: &TopicPartition, offset: i64) -> Option<&StoredRecord> {
        let partition = usize::try_from(tp.partition).ok()?;
        let index = usize::try_from(offset).ok()?;
        self.topics.get(&tp.topic)?.get(partition)?.get(index)
    }

    /// グループの割り当てを再計算し、世代を進める。
    fn rebalance(&mut self, group_id: &str) {
        let initial_offset = self.initial_offset;
        let topic_partitions: BTreeMap<String, i32> = self
            .topics
            .iter()
            .map(|(topic, partitions)| (topic.clone(), i32::try_from(partitions.len()).unwrap_or(i32::MAX)))
            .collect();

        let mut log_ends: HashMap<TopicPartition, i64> = HashMap::new();
        for (topic, &count) in &topic_partitions {
            for p in 0..count {
                let tp = TopicPartition::new(topic.clone(), p);
                let end = self.log_end(&tp);
                log_ends.insert(tp, end);
            }
        }

        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };

        let members: Vec<GroupMember> = group
            .members
            .iter()
            .map(|(id, m)| GroupMember {
                member_id: id.clone(),
                subscriptions: m.subscriptions.clone(),
                owned: m.assignment.clone(),
            })
            .collect();
        let assignment = group.strategy.assignor().assign(&members, &topic_partitions);

        for (member_id, member) in &mut group.members {
            let claims = assignment.get(member_id).cloned().unwrap_or_default();
            let mut positions = HashMap::new();
            for tp in &claims {
                let kept = member
                    .assignment
                    .contains(tp)
                    .then(|| member.positions.get(tp).copied())
                    .flatten();
                let start = kept.or_else(|| group.committed.get(tp).copied()).unwrap_or_else(|| {
                    match initial_offset {
                        InitialOffset::Oldest => 0,
                        InitialOffset::Newest => log_ends.get(tp).copied().unwrap_or(0),
                    }
                });
                positions.insert(tp.clone(), start);
            }
            member.assignment = claims;
            member.positions = positions;
            member.cursor = 0;
        }

        group.generation.send_modify(|g| *g += 1);
        tracing::debug!(
            group = group_id,
            generation = *group.generation.borrow(),
            members = group.members.len(),
            "in-memory group rebalanced"
        );
    }
}

/// InMemoryBroker は複製して共有できるインメモリブローカー。
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                default_strategy: AssignorStrategy::Range,
                initial_offset: InitialOffset::Oldest,
                topics: BTreeMap::new(),
                groups: HashMap::new(),
                failures: VecDeque::new(),
                next_member: 0,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_assignor(self, strategy: AssignorStrategy) -> Self {
        self.lock().default_strategy = strategy;
        self
    }

    pub fn with_initial_offset(self, initial_offset: InitialOffset) -> Self {
        self.lock().initial_offset = initial_offset;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// トピックを作成する。既存の場合はパーティション数を増やすだけで、減らすことはしない。
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.lock();
        let logs = state.topics.entry(topic.to_string()).or_default();
        if logs.len() < partitions {
            logs.resize_with(partitions, Vec::new);
        }
        let affected: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, g)| g.members.values().any(|m| m.subscriptions.iter().any(|t| t == topic)))
            .map(|(id, _)| id.clone())
            .collect();
        for group_id in affected {
            state.rebalance(&group_id);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// パーティションの末尾にメッセージを追加し、そのオフセットを返す。
    pub fn produce(&self, topic: &str, partition: i32, value: Vec<u8>) -> i64 {
        let mut state = self.lock();
        let logs = state.topics.entry(topic.to_string()).or_default();
        let index = usize::try_from(partition).unwrap_or(0);
        if logs.len() <= index {
            logs.resize_with(index + 1, Vec::new);
        }
        let log = &mut logs[index];
        log.push(StoredRecord {
            value,
            timestamp: Utc::now(),
        });
        let offset = i64::try_from(log.len()).unwrap_or(i64::MAX) - 1;
        drop(state);
        self.notify.notify_waiters();
        offset
    }

    /// グループ用のクライアントを生成する。グループ参加は `subscribe` 時に行われる。
    pub fn client(&self, group: &str, worker_id: usize) -> InMemoryGroupClient {
        let mut state = self.lock();
        state.next_member += 1;
        let member_id = format!("{group}-{worker_id}-{:04}", state.next_member);
        let strategy = state.default_strategy;
        let generation = state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState::new(strategy))
            .generation
            .subscribe();
        InMemoryGroupClient {
            broker: self.clone(),
            group: group.to_string(),
            member_id,
            generation,
            closed: AtomicBool::new(false),
        }
    }

    /// 接続確認の成否を切り替える。
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    /// 次の `n` 回の受信を接続エラーにする。
    pub fn fail_next_receives(&self, n: usize) {
        let mut state = self.lock();
        for _ in 0..n {
            state
                .failures
                .push_back(ConsumerError::Connection("injected broker failure".to_string()));
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// 次の受信を指定したエラーにする。
    pub fn fail_next_receives_with(&self, error: ConsumerError) {
        self.lock().failures.push_back(error);
        self.notify.notify_waiters();
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.lock().groups.get(group).map_or(0, |g| g.members.len())
    }

    /// グループ内の各メンバーの現在の割り当て。
    pub fn assignments(&self, group: &str) -> BTreeMap<String, Vec<TopicPartition>> {
        self.lock()
            .groups
            .get(group)
            .map(|g| {
                g.members
                    .iter()
                    .map(|(id, m)| (id.clone(), m.assignment.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// パーティションのコミット済みオフセット（次に読むべき位置）。
    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.lock()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(tp).copied())
    }
}

/// InMemoryGroupClient はインメモリブローカー上の 1 グループメンバー。
#[derive(Debug)]
pub struct InMemoryGroupClient {
    broker: InMemoryBroker,
    group: String,
    member_id: String,
    generation: watch::Receiver<u64>,
    closed: AtomicBool,
}

impl InMemoryGroupClient {
    fn ensure_open(&self) -> Result<(), ConsumerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumerError::Closed);
        }
        Ok(())
    }

    /// 受信可能なメッセージを 1 件取り出す。なければ `None`。
    fn poll_once(&self) -> Option<Result<ConsumedMessage, ConsumerError>> {
        let mut state = self.broker.lock();
        if let Some(err) = state.failures.pop_front() {
            return Some(Err(err));
        }

        let (claims, start) = {
            let member = state.groups.get(&self.group)?.members.get(&self.member_id)?;
            (member.assignment.clone(), member.cursor)
        };
        if claims.is_empty() {
            return None;
        }

        for step in 0..claims.len() {
            let index = (start + step) % claims.len();
            let tp = &claims[index];
            let position = state
                .groups
                .get(&self.group)
                .and_then(|g| g.members.get(&self.member_id))
                .and_then(|m| m.positions.get(tp).copied())
                .unwrap_or(0);
            let Some(record) = state.record(tp, position).cloned() else {
                continue;
            };

            if let Some(member) = state
                .groups
                .get_mut(&self.group)
                .and_then(|g| g.members.get_mut(&self.member_id))
            {
                member.positions.insert(tp.clone(), position + 1);
                member.cursor = (index + 1) % claims.len();
            }

            return Some(Ok(ConsumedMessage {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: position,
                key: None,
                value: record.value,
                timestamp: Some(record.timestamp),
            }));
        }
        None
    }
}

#[async_trait]
impl BrokerClient for InMemoryGroupClient {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let strategy = state.default_strategy;
        let group = state
            .groups
            .entry(self.group.clone())
            .or_insert_with(|| GroupState::new(strategy));
        if let Some(member) = group.members.get(&self.member_id) {
            if member.subscriptions == topics {
                return Ok(());
            }
        }
        group.members.insert(
            self.member_id.clone(),
            MemberState {
                subscriptions: topics.to_vec(),
                ..MemberState::default()
            },
        );
        state.rebalance(&self.group);
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn rebalances(&self) -> watch::Receiver<u64> {
        self.generation.clone()
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, ConsumerError> {
        self.ensure_open()?;
        Ok(self
            .broker
            .lock()
            .groups
            .get(&self.group)
            .and_then(|g| g.members.get(&self.member_id))
            .map(|m| m.assignment.clone())
            .unwrap_or_default())
    }

    async fn recv(&self) -> Result<ConsumedMessage, ConsumerError> {
        loop {
            self.ensure_open()?;
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.poll_once() {
                return result;
            }
            notified.await;
        }
    }

    fn mark(&self, tp: &TopicPartition, next_offset: i64) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let Some(group) = state.groups.get_mut(&self.group) else {
            return Ok(());
        };
        let owns = group
            .members
            .get(&self.member_id)
            .is_some_and(|m| m.assignment.contains(tp));
        if owns {
            let committed = group.committed.entry(tp.clone()).or_insert(next_offset);
            *committed = (*committed).max(next_offset);
        }
        Ok(())
    }

    fn rewind(&self, tp: &TopicPartition, offset: i64) -> Result<(), ConsumerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let member = state
            .groups
            .get_mut(&self.group)
            .and_then(|g| g.members.get_mut(&self.member_id))
            .filter(|m| m.assignment.contains(tp))
            .ok_or_else(|| ConsumerError::Protocol(format!("{tp} is not assigned to {}", self.member_id)))?;
        member.positions.insert(tp.clone(), offset);
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.broker.lock();
        let left = state
            .groups
            .get_mut(&self.group)
            .and_then(|g| g.members.remove(&self.member_id))
            .is_some();
        if left {
            state.rebalance(&self.group);
        }
        drop(state);
        self.broker.notify.notify_waiters();
        tracing::debug!(member_id = %self.member_id, "in-memory client closed");
        Ok(())
    }
}

/// InMemoryConnector は Worker ごとにインメモリクライアントを払い出す。
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    group: String,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker, group: impl Into<String>) -> Self {
        Self {
            broker,
            group: group.into(),
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    type Client = InMemoryGroupClient;

    async fn connect(&self, worker_id: usize) -> Result<Self::Client, ConsumerError> {
        if !self.broker.is_available() {
            return Err(ConsumerError::Connection(
                "in-memory broker is not available".to_string(),
            ));
        }
        Ok(self.broker.client(&self.group, worker_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Vec<String> {
        vec!["asset-events".to_string()]
    }

    #[tokio::test]
    async fn test_join_assigns_all_partitions() {
        let broker = InMemoryBroker::new();
        broker.create_topic("asset-events", 3);
        let client = broker.client("g", 0);
        client.subscribe(&topics()).unwrap();

        assert_eq!(client.assignment().unwrap().len(), 3);
        assert_eq!(broker.member_count("g"), 1);
        assert_eq!(*client.rebalances().borrow(), 1);
    }

    #[tokio::test]
    async fn test_second_member_triggers_rebalance() {
        let broker = InMemoryBroker::new();
        broker.create_topic("asset-events", 2);
        let a = broker.client("g", 0);
        a.subscribe(&topics()).unwrap();
        let mut watch = a.rebalances();
        let _ = watch.borrow_and_update();

        let b = broker.client("g", 1);
        b.subscribe(&topics()).unwrap();

        assert!(watch.has_changed().unwrap());
        assert_eq!(a.assignment().unwrap().len(), 1);
        assert_eq!(b.assignment().unwrap().len(), 1);

        b.close().await.unwrap();
        assert_eq!(a.assignment().unwrap().len(), 2);
        assert_eq!(broker.member_count("g"), 1);
    }

    #[tokio::test]
    async fn test_recv_reads_in_offset_order_and_waits() {
        let broker = InMemoryBroker::new();
        broker.create_topic("asset-events", 1);
        broker.produce("asset-events", 0, b"first".to_vec());
        let client = broker.client("g", 0);
        client.subscribe(&topics()).unwrap();

        let first = client.recv().await.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.value, b"first".to_vec());

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            producer.produce("asset-events", 0, b"second".to_vec());
        });
        let second = client.recv().await.unwrap();
        assert_eq!(second.offset, 1);
    }

    #[tokio::test]
    async fn test_committed_offset_survives_member_change() {
        let broker = InMemoryBroker::new();
        broker.create_topic("asset-events", 1);
        for v in ["a", "b", "c"] {
            broker.produce("asset-events", 0, v.as_bytes().to_vec());
        }
        let tp = TopicPartition::new("asset-events", 0);

        let first = broker.client("g", 0);
        first.subscribe(&topics()).unwrap();
        let msg = first.recv().await.unwrap();
        first.mark(&tp, msg.offset + 1).unwrap();
        first.close().await.unwrap();
        assert_eq!(broker.committed("g", &tp), Some(1));

        let second = broker.client("g", 1);
        second.subscribe(&topics()).unwrap();
        assert_eq!(second.recv().await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_rewind_redelivers() {
        let broker = InMemoryBroker::new();
        broker.create_topic("asset-events", 1);
        broker.produce("asset-events", 0, b"a".to_vec());
        let client = broker.client("g", 0);
        client.subscribe(&topics()).unwrap();
        let tp = TopicPartition::new("asset-events", 0);

        assert_eq!(client.recv().await.unwrap().offset, 0);
        client.rewind(&tp, 0).unwrap();
        assert_eq!(client.recv().await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_newest_initial_offset_skips_backlog() {
        let broker = InMemoryBroker::new().with_initial_offset(InitialOffset::Newest);
        broker.create_topic("asset-events", 1);
        broker.produce("asset-events", 0, b"old".to_vec());
        let client = broker.client("g", 0);
        client.subscribe(&topics()).unwrap();
        broker.produce("asset-events", 0, b"new".to_vec());

        let msg = client.recv().await.unwrap();
        assert_eq!(msg.offset, 1);
        assert_eq!(msg.value, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let broker = InMemoryBroker::new();
        broker.create_topic("asset-events", 1);
        let client = broker.client("g", 0);
        client.subscribe(&topics()).unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(matches!(client.recv().await, Err(ConsumerError::Closed)));
        assert!(matches!(client.subscribe(&topics()), Err(ConsumerError::Closed)));
    }

    #[tokio::test]
    async fn test_connector_probe_fails_when_unavailable() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let connector = InMemoryConnector::new(broker, "g");
        assert!(matches!(
            connector.connect(0).await,
            Err(ConsumerError::Connection(_))
        ));
    }
}
