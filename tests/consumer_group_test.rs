//! Coordinator をインメモリブローカー上で動かす結合テスト。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use k1s0_storemanager::adapter::handler::{AssetEventClaimHandler, ForwardClaimHandler};
use k1s0_storemanager::domain::assignor::AssignorStrategy;
use k1s0_storemanager::domain::consumer::{
    BrokerClient, BrokerConnector, ClaimHandler, GroupSession, PartitionClaim,
};
use k1s0_storemanager::domain::entity::{DeletePayload, TopicPartition};
use k1s0_storemanager::infrastructure::memory::{InMemoryBroker, InMemoryConnector, InMemoryGroupClient};
use k1s0_storemanager::runtime::{
    handoff_channel, Coordinator, CoordinatorSettings, RetryConfig, ShutdownReport,
};
use k1s0_storemanager::usecase::{AssetCommandExecutor, DispatchAssetEventUseCase};
use k1s0_storemanager::ConsumerError;

const TOPIC: &str = "asset-events";

fn settings(group: &str, workers: usize) -> CoordinatorSettings {
    CoordinatorSettings {
        group: group.to_string(),
        topics: vec![TOPIC.to_string()],
        workers,
        shutdown_timeout: Some(Duration::from_secs(5)),
        retry: RetryConfig::default()
            .with_initial_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20))
            .with_jitter(false),
    }
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<ShutdownReport, ConsumerError>>,
}

impl Running {
    async fn shutdown(self) -> Result<ShutdownReport, ConsumerError> {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("coordinator did not stop in time")
            .expect("coordinator task panicked")
    }
}

fn start<K>(connector: K, settings: CoordinatorSettings, handler: Arc<dyn ClaimHandler>) -> Running
where
    K: BrokerConnector + 'static,
{
    let (stop, stopped) = oneshot::channel::<()>();
    let coordinator = Coordinator::new(connector, settings);
    let handle = tokio::spawn(async move {
        coordinator
            .run(move |_| handler.clone(), async {
                let _ = stopped.await;
            })
            .await
    });
    Running { stop, handle }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn balanced(broker: &InMemoryBroker, group: &str, members: usize) -> bool {
    let assignments = broker.assignments(group);
    assignments.len() == members && assignments.values().all(|claims| claims.len() == 1)
}

#[tokio::test]
async fn test_three_workers_each_claim_one_partition_for_every_strategy() {
    for strategy in [
        AssignorStrategy::Range,
        AssignorStrategy::RoundRobin,
        AssignorStrategy::Sticky,
    ] {
        let group = format!("scenario-a-{strategy}");
        let broker = InMemoryBroker::new().with_assignor(strategy);
        broker.create_topic(TOPIC, 3);

        let (tx, _rx) = handoff_channel(30);
        let running = start(
            InMemoryConnector::new(broker.clone(), group.clone()),
            settings(&group, 3),
            Arc::new(ForwardClaimHandler::new(tx)),
        );

        wait_until(|| balanced(&broker, &group, 3)).await;
        let mut claimed: Vec<TopicPartition> =
            broker.assignments(&group).into_values().flatten().collect();
        claimed.sort();
        assert_eq!(
            claimed,
            (0..3).map(|p| TopicPartition::new(TOPIC, p)).collect::<Vec<_>>(),
            "strategy {strategy}"
        );

        let report = running.shutdown().await.unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(broker.member_count(&group), 0);
    }
}

#[tokio::test]
async fn test_forwarded_messages_keep_partition_order_and_are_acknowledged() {
    let group = "ordering";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 3);

    let (tx, mut rx) = handoff_channel(30);
    let running = start(
        InMemoryConnector::new(broker.clone(), group),
        settings(group, 3),
        Arc::new(ForwardClaimHandler::new(tx)),
    );
    wait_until(|| balanced(&broker, group, 3)).await;

    for i in 0..10 {
        for p in 0..3 {
            broker.produce(TOPIC, p, format!("{p}:{i}").into_bytes());
        }
    }

    let mut per_partition: Vec<Vec<u32>> = vec![Vec::new(); 3];
    for _ in 0..30 {
        let value = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8(value).unwrap();
        let (p, i) = text.split_once(':').unwrap();
        per_partition[p.parse::<usize>().unwrap()].push(i.parse().unwrap());
    }
    for seq in &per_partition {
        assert_eq!(seq, &(0..10).collect::<Vec<u32>>());
    }

    wait_until(|| {
        (0..3).all(|p| broker.committed(group, &TopicPartition::new(TOPIC, p)) == Some(10))
    })
    .await;

    let report = running.shutdown().await.unwrap();
    assert_eq!(report.completed, 3);
}

#[derive(Default)]
struct RecordingExecutor {
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl AssetCommandExecutor for RecordingExecutor {
    async fn delete(&self, payload: &DeletePayload) -> anyhow::Result<()> {
        self.deleted.lock().unwrap().push(payload.id.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_delete_event_dispatched_and_unknown_event_skipped() {
    let group = "scenario-b";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 1);
    broker.produce(
        TOPIC,
        0,
        br#"{"event_type":"delete","payload":{"id":"x1"}}"#.to_vec(),
    );
    broker.produce(TOPIC, 0, br#"{"event_type":"archive","payload":{"id":"x2"}}"#.to_vec());

    let executor = Arc::new(RecordingExecutor::default());
    let dispatch_uc = Arc::new(DispatchAssetEventUseCase::new(executor.clone()));
    let running = start(
        InMemoryConnector::new(broker.clone(), group),
        settings(group, 1),
        Arc::new(AssetEventClaimHandler::new(dispatch_uc)),
    );

    let tp = TopicPartition::new(TOPIC, 0);
    wait_until(|| broker.committed(group, &tp) == Some(2)).await;
    assert_eq!(*executor.deleted.lock().unwrap(), vec!["x1".to_string()]);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_while_blocked_on_empty_partition_completes_promptly() {
    let group = "scenario-c";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 2);

    let (tx, _rx) = handoff_channel(30);
    let running = start(
        InMemoryConnector::new(broker.clone(), group),
        settings(group, 2),
        Arc::new(ForwardClaimHandler::new(tx)),
    );
    wait_until(|| balanced(&broker, group, 2)).await;

    let started = tokio::time::Instant::now();
    let report = running.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.completed, 2);
    assert_eq!(broker.member_count(group), 0);
}

/// 指定した Worker の接続だけ失敗させるコネクター。
struct FailingConnector {
    inner: InMemoryConnector,
    fail_at: usize,
    connected: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerConnector for FailingConnector {
    type Client = InMemoryGroupClient;

    async fn connect(&self, worker_id: usize) -> Result<Self::Client, ConsumerError> {
        if worker_id == self.fail_at {
            return Err(ConsumerError::Connection("broker unreachable".to_string()));
        }
        self.connected.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(worker_id).await
    }
}

#[tokio::test]
async fn test_startup_connection_failure_is_fatal_and_leaves_no_workers() {
    let group = "scenario-d";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 3);
    let connected = Arc::new(AtomicUsize::new(0));
    let connector = FailingConnector {
        inner: InMemoryConnector::new(broker.clone(), group),
        fail_at: 2,
        connected: connected.clone(),
    };

    let (tx, _rx) = handoff_channel(30);
    let handler: Arc<dyn ClaimHandler> = Arc::new(ForwardClaimHandler::new(tx));
    let coordinator = Coordinator::new(connector, settings(group, 3));
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        coordinator.run(move |_| handler.clone(), std::future::pending()),
    )
    .await
    .expect("startup failure must not wait for a signal");

    assert!(matches!(result, Err(ConsumerError::Connection(_))));
    assert_eq!(connected.load(Ordering::SeqCst), 2);
    assert_eq!(broker.member_count(group), 0);
}

#[tokio::test]
async fn test_completion_count_matches_worker_count() {
    for workers in [1, 2, 5] {
        let group = format!("completion-{workers}");
        let broker = InMemoryBroker::new();
        broker.create_topic(TOPIC, 3);

        let (tx, _rx) = handoff_channel(30);
        let running = start(
            InMemoryConnector::new(broker.clone(), group.clone()),
            settings(&group, workers),
            Arc::new(ForwardClaimHandler::new(tx)),
        );
        wait_until(|| broker.member_count(&group) == workers).await;

        let report = running.shutdown().await.unwrap();
        assert_eq!(report.completed, workers);
    }
}

#[tokio::test]
async fn test_handoff_never_exceeds_capacity() {
    let group = "handoff-bound";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 1);
    for i in 0..10 {
        broker.produce(TOPIC, 0, format!("v{i}").into_bytes());
    }

    let (tx, mut rx) = handoff_channel(2);
    let probe = tx.clone();
    let running = start(
        InMemoryConnector::new(broker.clone(), group),
        settings(group, 1),
        Arc::new(ForwardClaimHandler::new(tx)),
    );

    let tp = TopicPartition::new(TOPIC, 0);
    wait_until(|| probe.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.len(), 2);
    assert_eq!(broker.committed(group, &tp), Some(2));

    running.shutdown().await.unwrap();
    drop(probe);

    assert_eq!(rx.recv().await.as_deref(), Some(&b"v0"[..]));
    assert_eq!(rx.recv().await.as_deref(), Some(&b"v1"[..]));
    assert!(rx.recv().await.is_none());
}

/// セッションのライフサイクル呼び出しを数えるハンドラー。
#[derive(Default)]
struct LifecycleHandler {
    setups: AtomicUsize,
    cleanups: AtomicUsize,
    generations: Mutex<Vec<u64>>,
}

#[async_trait]
impl ClaimHandler for LifecycleHandler {
    async fn setup(&self, session: &dyn GroupSession) -> Result<(), ConsumerError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.generations.lock().unwrap().push(session.generation());
        Ok(())
    }

    async fn cleanup(&self, _session: &dyn GroupSession) -> Result<(), ConsumerError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_claim(
        &self,
        session: &dyn GroupSession,
        mut claim: PartitionClaim,
    ) -> Result<(), ConsumerError> {
        while let Some(message) = claim.next().await {
            session.mark_message(&message)?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_setup_and_cleanup_run_once_per_generation() {
    let group = "lifecycle";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 2);

    let handler = Arc::new(LifecycleHandler::default());
    let running = start(
        InMemoryConnector::new(broker.clone(), group),
        settings(group, 1),
        handler.clone(),
    );
    wait_until(|| handler.setups.load(Ordering::SeqCst) == 1).await;

    // 外部メンバーの参加でリバランスを起こす
    let outsider = broker.client(group, 99);
    outsider.subscribe(&[TOPIC.to_string()]).unwrap();
    wait_until(|| handler.setups.load(Ordering::SeqCst) == 2).await;
    assert_eq!(handler.cleanups.load(Ordering::SeqCst), 1);

    running.shutdown().await.unwrap();
    assert_eq!(
        handler.setups.load(Ordering::SeqCst),
        handler.cleanups.load(Ordering::SeqCst)
    );
    let generations = handler.generations.lock().unwrap().clone();
    assert!(generations.windows(2).all(|w| w[0] < w[1]));
    outsider.close().await.unwrap();
}

/// 最初の 1 回だけ処理に失敗するハンドラー。
#[derive(Default)]
struct FlakyHandler {
    failures_left: AtomicUsize,
    processed: Mutex<Vec<i64>>,
}

#[async_trait]
impl ClaimHandler for FlakyHandler {
    async fn handle_claim(
        &self,
        session: &dyn GroupSession,
        mut claim: PartitionClaim,
    ) -> Result<(), ConsumerError> {
        while let Some(message) = claim.next().await {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ConsumerError::Handler("downstream unavailable".to_string()));
            }
            self.processed.lock().unwrap().push(message.offset);
            session.mark_message(&message)?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_message_is_redelivered() {
    let group = "redelivery";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 1);
    broker.produce(TOPIC, 0, b"a".to_vec());
    broker.produce(TOPIC, 0, b"b".to_vec());

    let handler = Arc::new(FlakyHandler {
        failures_left: AtomicUsize::new(1),
        processed: Mutex::new(Vec::new()),
    });
    let running = start(
        InMemoryConnector::new(broker.clone(), group),
        settings(group, 1),
        handler.clone(),
    );

    let tp = TopicPartition::new(TOPIC, 0);
    wait_until(|| broker.committed(group, &tp) == Some(2)).await;
    assert_eq!(*handler.processed.lock().unwrap(), vec![0, 1]);

    let report = running.shutdown().await.unwrap();
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn test_fatal_worker_error_stops_all_workers() {
    let group = "fatal";
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC, 2);

    let (tx, _rx) = handoff_channel(30);
    let running = start(
        InMemoryConnector::new(broker.clone(), group),
        settings(group, 2),
        Arc::new(ForwardClaimHandler::new(tx)),
    );
    wait_until(|| broker.member_count(group) == 2).await;

    broker.fail_next_receives_with(ConsumerError::Protocol("unsupported version".to_string()));

    let result = tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ConsumerError::Protocol(_))));
    assert_eq!(broker.member_count(group), 0);
}
