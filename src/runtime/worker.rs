use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::domain::consumer::{BrokerClient, ClaimHandler};
use crate::runtime::backoff::RetryConfig;
use crate::runtime::completion::{CompletionSignal, WorkerOutcome};
use crate::runtime::group::{ConsumerGroup, SessionEnd};

/// WorkerState は Worker のライフサイクル上の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Joining,
    Consuming,
    Closing,
    Done,
}

/// Worker は 1 つのブローカー接続を所有し、キャンセルされるまでセッションを繰り返す。
pub struct Worker<C: BrokerClient + 'static> {
    id: usize,
    group_name: String,
    topics: Vec<String>,
    group: ConsumerGroup<C>,
    handler: Arc<dyn ClaimHandler>,
    retry: RetryConfig,
    state: WorkerState,
}

impl<C: BrokerClient + 'static> Worker<C> {
    pub fn new(
        id: usize,
        group_name: impl Into<String>,
        topics: Vec<String>,
        client: C,
        handler: Arc<dyn ClaimHandler>,
    ) -> Self {
        Self {
            id,
            group_name: group_name.into(),
            topics,
            group: ConsumerGroup::new(client),
            handler,
            retry: RetryConfig::default(),
            state: WorkerState::Joining,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::debug!(worker_id = self.id, from = ?self.state, to = ?next, "worker state changed");
            self.state = next;
        }
    }

    /// `ctx` がキャンセルされるまでメッセージを消費し、終了時に完了通知を 1 度だけ送る。
    pub async fn run(mut self, ctx: CancellationToken, done: CompletionSignal) {
        tracing::info!(
            worker_id = self.id,
            group = %self.group_name,
            topics = ?self.topics,
            "starting a new consumer"
        );

        let outcome = self.consume_until_cancelled(&ctx).await;

        self.transition(WorkerState::Closing);
        if let Err(e) = self.group.close().await {
            tracing::error!(worker_id = self.id, error = %e, "failed to close kafka client");
        }
        self.transition(WorkerState::Done);

        match &outcome {
            WorkerOutcome::Failed(e) => {
                tracing::error!(worker_id = self.id, error = %e, "consumer stopped with fatal error");
            }
            _ => tracing::info!(worker_id = self.id, "consumer stopped"),
        }
        done.complete(outcome);
    }

    async fn consume_until_cancelled(&mut self, ctx: &CancellationToken) -> WorkerOutcome {
        let mut attempt: u32 = 0;
        loop {
            if ctx.is_cancelled() {
                return WorkerOutcome::Stopped;
            }

            self.transition(WorkerState::Consuming);
            let result = self
                .group
                .consume(ctx, &self.topics, self.handler.clone())
                .await;

            match result {
                Ok(SessionEnd::Rebalanced) => {
                    attempt = 0;
                    self.transition(WorkerState::Joining);
                }
                Ok(SessionEnd::Cancelled) => return WorkerOutcome::Stopped,
                Err(e) if e.is_fatal() => return WorkerOutcome::Failed(e),
                Err(e) => {
                    let delay = self.retry.compute_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    if e.is_handler_error() {
                        tracing::warn!(
                            worker_id = self.id,
                            error = %e,
                            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "message handling failed, offset left unacknowledged"
                        );
                    } else {
                        tracing::warn!(
                            worker_id = self.id,
                            error = %e,
                            attempt,
                            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "error from consumer, retrying"
                        );
                    }
                    self.transition(WorkerState::Joining);
                    tokio::select! {
                        () = ctx.cancelled() => return WorkerOutcome::Stopped,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
