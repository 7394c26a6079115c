use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::consumer::{BrokerClient, BrokerConnector, ClaimHandler};
use crate::error::ConsumerError;
use crate::runtime::backoff::RetryConfig;
use crate::runtime::completion::{
    completion_channel, CompletionReceiver, WorkerOutcome, WorkerReport,
};
use crate::runtime::worker::Worker;

/// CoordinatorSettings は Coordinator の起動パラメータ。
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub group: String,
    pub topics: Vec<String>,
    pub workers: usize,
    /// 完了通知を待つ上限。None の場合は全 Worker の終了まで待ち続ける。
    pub shutdown_timeout: Option<Duration>,
    pub retry: RetryConfig,
}

/// ShutdownReport は正常終了時の集計。
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// 受信した完了通知の数
    pub completed: usize,
}

/// 完了通知を集計する途中状態。
#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    aborted: Vec<usize>,
    fatal: Option<ConsumerError>,
}

impl Tally {
    fn record(&mut self, worker_report: WorkerReport) {
        self.completed += 1;
        tracing::info!(worker_id = worker_report.worker_id, "ok");
        match worker_report.outcome {
            WorkerOutcome::Stopped => {}
            WorkerOutcome::Failed(e) => {
                if self.fatal.is_none() {
                    self.fatal = Some(e);
                } else {
                    tracing::error!(worker_id = worker_report.worker_id, error = %e, "additional worker failure");
                }
            }
            WorkerOutcome::Aborted => {
                tracing::error!(worker_id = worker_report.worker_id, "worker terminated without completing");
                self.aborted.push(worker_report.worker_id);
            }
        }
    }

    /// 停止要求を待たずに全 Worker を止めるべき状態かどうか。
    fn must_stop(&self) -> bool {
        self.fatal.is_some() || !self.aborted.is_empty()
    }

    fn finish(self) -> Result<ShutdownReport, ConsumerError> {
        match self.fatal {
            Some(e) => Err(e),
            None if !self.aborted.is_empty() => Err(ConsumerError::WorkersAborted {
                workers: self.aborted,
            }),
            None => Ok(ShutdownReport {
                completed: self.completed,
            }),
        }
    }
}

/// Coordinator は N 個の Worker を起動し、停止要求を受けたら全 Worker の完了を待つ。
pub struct Coordinator<K: BrokerConnector> {
    connector: K,
    settings: CoordinatorSettings,
}

impl<K: BrokerConnector> Coordinator<K> {
    pub fn new(connector: K, settings: CoordinatorSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Worker を起動して `shutdown` が完了するまで待ち、全 Worker の完了通知を回収して戻る。
    ///
    /// いずれかの Worker が致命的エラーで停止した場合は、残りの Worker も停止させたうえで
    /// そのエラーを返す。
    pub async fn run<F, S>(
        &self,
        handler_factory: F,
        shutdown: S,
    ) -> Result<ShutdownReport, ConsumerError>
    where
        F: Fn(usize) -> Arc<dyn ClaimHandler>,
        S: Future<Output = ()>,
    {
        let clients = self.connect_all().await?;

        let ctx = CancellationToken::new();
        let (signals, mut done) = completion_channel(clients.len());
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(clients.len());
        for ((id, client), signal) in clients.into_iter().enumerate().zip(signals) {
            let worker = Worker::new(
                id,
                self.settings.group.clone(),
                self.settings.topics.clone(),
                client,
                handler_factory(id),
            )
            .with_retry(self.settings.retry.clone());
            handles.push(tokio::spawn(worker.run(ctx.child_token(), signal)));
        }

        tracing::info!(
            workers = handles.len(),
            group = %self.settings.group,
            "consumer workers started"
        );

        let mut tally = Tally::default();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("signal caught, canceling consumer contexts");
                    break;
                }
                received = done.recv() => match received {
                    Some(worker_report) => {
                        tally.record(worker_report);
                        if tally.must_stop() {
                            tracing::error!("worker failed, shutting down remaining workers");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        ctx.cancel();

        let drained = match self.settings.shutdown_timeout {
            Some(limit) => tokio::time::timeout(limit, drain(&mut done, &mut tally))
                .await
                .is_ok(),
            None => {
                drain(&mut done, &mut tally).await;
                true
            }
        };

        if !drained {
            let pending = done.pending();
            tracing::error!(pending, "shutdown timed out, aborting remaining workers");
            for handle in &handles {
                handle.abort();
            }
            return Err(ConsumerError::ShutdownTimeout { pending });
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker task did not finish cleanly");
            }
        }

        tracing::info!(completed = tally.completed, "all consumer workers stopped");
        tally.finish()
    }

    /// 全 Worker 分のクライアントを接続する。1 つでも失敗したら接続済みのものを閉じて返す。
    async fn connect_all(&self) -> Result<Vec<K::Client>, ConsumerError> {
        let mut clients = Vec::with_capacity(self.settings.workers);
        for id in 0..self.settings.workers {
            match self.connector.connect(id).await {
                Ok(client) => clients.push(client),
                Err(e) => {
                    tracing::error!(worker_id = id, error = %e, "error creating consumer group client");
                    for client in &clients {
                        if let Err(close_err) = client.close().await {
                            tracing::warn!(error = %close_err, "failed to close kafka client");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(clients)
    }
}

async fn drain(done: &mut CompletionReceiver, tally: &mut Tally) {
    while let Some(worker_report) = done.recv().await {
        tally.record(worker_report);
    }
}
