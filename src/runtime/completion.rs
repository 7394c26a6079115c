use tokio::sync::mpsc;

use crate::error::ConsumerError;

/// WorkerOutcome は Worker がどのように終了したかを表す。
#[derive(Debug)]
pub enum WorkerOutcome {
    /// キャンセルを受けて正常に停止した
    Stopped,
    /// 致命的なエラーで停止した
    Failed(ConsumerError),
    /// 完了通知を送らずに破棄された（パニック・強制中断）
    Aborted,
}

/// WorkerReport は Worker 1 つ分の完了通知。
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub outcome: WorkerOutcome,
}

/// CompletionSignal は Worker が 1 度だけ送信できる完了通知。
///
/// `complete` は self を消費するため 2 度送ることはできない。送信せずに破棄された場合は
/// `Drop` が `Aborted` を送るため、どの終了経路でも通知は必ず 1 つ届く。
#[derive(Debug)]
pub struct CompletionSignal {
    worker_id: usize,
    tx: Option<mpsc::Sender<WorkerReport>>,
}

impl CompletionSignal {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn complete(mut self, outcome: WorkerOutcome) {
        self.emit(outcome);
    }

    fn emit(&mut self, outcome: WorkerOutcome) {
        if let Some(tx) = self.tx.take() {
            let report = WorkerReport {
                worker_id: self.worker_id,
                outcome,
            };
            // 容量は Worker 数と同じなので満杯にはならない。受信側が先に破棄された場合のみ失敗する。
            if tx.try_send(report).is_err() {
                tracing::warn!(worker_id = self.worker_id, "completion receiver already dropped");
            }
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.emit(WorkerOutcome::Aborted);
    }
}

/// CompletionReceiver は Coordinator 側で完了通知を数えながら受信する。
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: mpsc::Receiver<WorkerReport>,
    expected: usize,
    received: usize,
}

impl CompletionReceiver {
    /// 次の完了通知を待つ。全 Worker 分を受信済みなら `None` を返す。
    pub async fn recv(&mut self) -> Option<WorkerReport> {
        if self.received >= self.expected {
            return None;
        }
        let report = self.rx.recv().await?;
        self.received += 1;
        Some(report)
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// まだ完了通知を送っていない Worker の数。
    pub fn pending(&self) -> usize {
        self.expected - self.received
    }
}

/// Worker 数分の完了通知と、それを受け取る受信側を生成する。
pub fn completion_channel(workers: usize) -> (Vec<CompletionSignal>, CompletionReceiver) {
    let (tx, rx) = mpsc::channel(workers.max(1));
    let signals = (0..workers)
        .map(|worker_id| CompletionSignal {
            worker_id,
            tx: Some(tx.clone()),
        })
        .collect();
    (
        signals,
        CompletionReceiver {
            rx,
            expected: workers,
            received: 0,
        },
    )
}
