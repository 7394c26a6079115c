/// ConsumerError はコンシューマーグループ実行時のエラーを表す。
///
/// 設定エラー・プロトコルエラーは致命的、接続エラーはバックオフ付きで再試行、
/// ハンドラーエラーはクレームを中断するが Worker は継続する。
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("forward error: {0}")]
    Forward(String),

    #[error("client closed")]
    Closed,

    #[error("shutdown timed out with {pending} worker(s) still running")]
    ShutdownTimeout { pending: usize },

    #[error("worker(s) {workers:?} terminated without completing")]
    WorkersAborted { workers: Vec<usize> },
}

impl ConsumerError {
    /// バックオフ後に再試行すべきエラーかどうかを返す。
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumerError::Connection(_))
    }

    /// Worker を停止させプロセスを終了させるべきエラーかどうかを返す。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsumerError::Configuration(_)
                | ConsumerError::Protocol(_)
                | ConsumerError::Closed
                | ConsumerError::ShutdownTimeout { .. }
                | ConsumerError::WorkersAborted { .. }
        )
    }

    /// メッセージ処理に起因するエラーかどうかを返す。
    pub fn is_handler_error(&self) -> bool {
        matches!(
            self,
            ConsumerError::Handler(_) | ConsumerError::Decode(_) | ConsumerError::Forward(_)
        )
    }
}
