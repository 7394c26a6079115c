use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::domain::consumer::{BrokerClient, ClaimHandler, GroupSession, PartitionClaim};
use crate::domain::entity::{ConsumedMessage, TopicPartition};
use crate::error::ConsumerError;

/// 1 クレームあたりの受信バッファ数。
pub const DEFAULT_CLAIM_BUFFER: usize = 256;

/// SessionEnd はセッションが終了した理由を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 割り当てが変わった。新しい世代で再度 `consume` を呼び出す必要がある
    Rebalanced,
    /// Worker のコンテキストがキャンセルされた
    Cancelled,
}

/// ConsumerGroup は BrokerClient の上にリバランス世代単位のセッションを構築する。
///
/// `consume` は世代ごとに `setup` → パーティションごとの `handle_claim`（並行）→ `cleanup`
/// を実行し、リバランスまたはキャンセルで戻る。
pub struct ConsumerGroup<C: BrokerClient + 'static> {
    client: Arc<C>,
}

impl<C: BrokerClient + 'static> ConsumerGroup<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// 1 世代分のセッションを実行する。
    pub async fn consume(
        &self,
        ctx: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<SessionEnd, ConsumerError> {
        if ctx.is_cancelled() {
            return Ok(SessionEnd::Cancelled);
        }

        self.client.subscribe(topics)?;
        let mut rebalances = self.client.rebalances();
        let generation = *rebalances.borrow_and_update();
        let assignment = self.client.assignment()?;

        let session = Arc::new(Session {
            client: self.client.clone(),
            member_id: self.client.member_id().to_string(),
            generation,
            claims: assignment,
            ctx: ctx.child_token(),
            progress: Mutex::new(HashMap::new()),
        });

        tracing::info!(
            member_id = %session.member_id,
            generation,
            claims = ?session.claims,
            "consumer group session started"
        );

        handler.setup(session.as_ref()).await?;

        let mut senders: HashMap<TopicPartition, mpsc::Sender<ConsumedMessage>> = HashMap::new();
        let mut tasks: JoinSet<(TopicPartition, Result<(), ConsumerError>)> = JoinSet::new();
        for tp in &session.claims {
            let (tx, rx) = mpsc::channel(DEFAULT_CLAIM_BUFFER);
            senders.insert(tp.clone(), tx);

            let claim = PartitionClaim::new(tp.clone(), rx, session.ctx.clone());
            let session = session.clone();
            let handler = handler.clone();
            tasks.spawn(async move {
                let tp = claim.topic_partition().clone();
                let result = handler.handle_claim(session.as_ref(), claim).await;
                (tp, result)
            });
        }

        let mut pending: Option<(mpsc::Sender<ConsumedMessage>, ConsumedMessage)> = None;

        let mut failure: Option<ConsumerError> = None;
        let end = loop {
            tokio::select! {
                biased;
                () = ctx.cancelled() => break SessionEnd::Cancelled,
                changed = rebalances.changed() => {
                    if changed.is_err() {
                        failure = Some(ConsumerError::Closed);
                    }
                    break SessionEnd::Rebalanced;
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok((tp, Ok(()))) => {
                        tracing::debug!(claim = %tp, "claim handler returned");
                        senders.remove(&tp);
                    }
                    Ok((tp, Err(e))) => {
                        tracing::warn!(claim = %tp, error = %e, "claim aborted by handler");
                        failure = Some(e);
                        break SessionEnd::Rebalanced;
                    }
                    Err(e) => {
                        failure = Some(ConsumerError::Handler(format!("claim task failed: {e}")));
                        break SessionEnd::Rebalanced;
                    }
                },
                permit = reserve(pending.as_ref().map(|(tx, _)| tx.clone())), if pending.is_some() => {
                    if let Some((_, msg)) = pending.take() {
                        match permit {
                            Some(permit) => drop(permit.send(msg)),
                            None => {
                                tracing::debug!(claim = %msg.topic_partition(), offset = msg.offset, "claim closed, message left for redelivery");
                            }
                        }
                    }
                }
                received = self.client.recv(), if pending.is_none() => match received {
                    Ok(msg) => {
                        session.record_routed(&msg);
                        if rebalances.has_changed().unwrap_or(true) {
                            // 割り当て変更後に届いたメッセージは配送せず、巻き戻しでログ順に再取得させる
                            tracing::debug!(claim = %msg.topic_partition(), offset = msg.offset, "message received after rebalance left for redelivery");
                            break SessionEnd::Rebalanced;
                        }
                        let tp = msg.topic_partition();
                        match senders.get(&tp) {
                            Some(tx) => pending = Some((tx.clone(), msg)),
                            None => tracing::debug!(claim = %tp, offset = msg.offset, "message for inactive claim dropped"),
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break SessionEnd::Rebalanced;
                    }
                },
            }
        };

        session.ctx.cancel();
        drop(pending);
        drop(senders);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((tp, Err(e))) => {
                    tracing::warn!(claim = %tp, error = %e, "claim aborted by handler");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(ConsumerError::Handler(format!("claim task failed: {e}")));
                }
            }
        }

        if let Err(e) = handler.cleanup(session.as_ref()).await {
            tracing::warn!(error = %e, "claim handler cleanup failed");
            failure.get_or_insert(e);
        }

        if end != SessionEnd::Cancelled {
            session.rewind_unprocessed();
        }

        tracing::info!(
            member_id = %session.member_id,
            generation,
            reason = ?end,
            "consumer group session ended"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(end),
        }
    }

    /// グループから離脱して接続を閉じる。
    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.client.close().await
    }
}

/// 送信枠を確保する。送信先がない場合は永久に待つ（select の前提条件で無効化される）。
async fn reserve(
    tx: Option<mpsc::Sender<ConsumedMessage>>,
) -> Option<mpsc::OwnedPermit<ConsumedMessage>> {
    match tx {
        Some(tx) => tx.reserve_owned().await.ok(),
        None => std::future::pending().await,
    }
}

/// ClaimProgress はパーティションごとの配送・処理済み位置。
#[derive(Debug, Clone, Copy)]
struct ClaimProgress {
    first_routed: i64,
    routed_next: i64,
    marked_next: Option<i64>,
}

impl ClaimProgress {
    /// 未処理のメッセージが残っている場合、戻すべきオフセットを返す。
    fn rewind_point(&self) -> Option<i64> {
        let start = self.marked_next.unwrap_or(self.first_routed);
        (start < self.routed_next).then_some(start)
    }
}

struct Session<C: BrokerClient> {
    client: Arc<C>,
    member_id: String,
    generation: u64,
    claims: Vec<TopicPartition>,
    ctx: CancellationToken,
    progress: Mutex<HashMap<TopicPartition, ClaimProgress>>,
}

impl<C: BrokerClient> Session<C> {
    fn progress(&self) -> MutexGuard<'_, HashMap<TopicPartition, ClaimProgress>> {
        match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_routed(&self, msg: &ConsumedMessage) {
        self.progress()
            .entry(msg.topic_partition())
            .and_modify(|p| p.routed_next = p.routed_next.max(msg.offset + 1))
            .or_insert(ClaimProgress {
                first_routed: msg.offset,
                routed_next: msg.offset + 1,
                marked_next: None,
            });
    }

    fn rewind_unprocessed(&self) {
        let points: Vec<(TopicPartition, i64)> = self
            .progress()
            .iter()
            .filter_map(|(tp, p)| p.rewind_point().map(|offset| (tp.clone(), offset)))
            .collect();

        for (tp, offset) in points {
            match self.client.rewind(&tp, offset) {
                Ok(()) => tracing::info!(claim = %tp, offset, "rewound unprocessed messages"),
                Err(e) => tracing::debug!(claim = %tp, offset, error = %e, "rewind skipped"),
            }
        }
    }
}

impl<C: BrokerClient> GroupSession for Session<C> {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn claims(&self) -> &[TopicPartition] {
        &self.claims
    }

    fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    fn mark_message(&self, message: &ConsumedMessage) -> Result<(), ConsumerError> {
        let tp = message.topic_partition();
        let next = message.offset + 1;
        self.client.mark(&tp, next)?;
        self.progress()
            .entry(tp)
            .and_modify(|p| p.marked_next = Some(p.marked_next.map_or(next, |m| m.max(next))))
            .or_insert(ClaimProgress {
                first_routed: message.offset,
                routed_next: next,
                marked_next: Some(next),
            });
        Ok(())
    }
}
