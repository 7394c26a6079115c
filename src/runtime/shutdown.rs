/// ShutdownSignal は停止要求となる OS シグナルの受信口。
///
/// `install` の時点でハンドラを登録するため、`wait` を呼ぶ前に届いたシグナルも取りこぼさない。
/// SIGHUP / SIGINT / SIGTERM / SIGQUIT のいずれも同じ停止経路に入る。
pub struct ShutdownSignal {
    #[cfg(unix)]
    streams: Vec<(&'static str, tokio::signal::unix::Signal)>,
}

#[cfg(unix)]
impl ShutdownSignal {
    /// シグナルハンドラを登録する。Tokio ランタイム上で呼び出すこと。
    ///
    /// 登録に失敗した種類は待機対象から外す。
    pub fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let kinds = [
            ("SIGHUP", SignalKind::hangup()),
            ("SIGINT", SignalKind::interrupt()),
            ("SIGTERM", SignalKind::terminate()),
            ("SIGQUIT", SignalKind::quit()),
        ];

        let mut streams = Vec::with_capacity(kinds.len());
        for (name, kind) in kinds {
            match signal(kind) {
                Ok(stream) => streams.push((name, stream)),
                Err(e) => tracing::warn!(signal = name, error = %e, "failed to install signal handler"),
            }
        }
        Self { streams }
    }

    /// 待機対象のシグナル名。
    pub fn watched(&self) -> Vec<&'static str> {
        self.streams.iter().map(|(name, _)| *name).collect()
    }

    /// いずれかのシグナルを受信するまで待ち、受信したシグナル名を返す。
    pub async fn wait(self) -> &'static str {
        if self.streams.is_empty() {
            return wait_ctrl_c().await;
        }

        let waiters = self.streams.into_iter().map(|(name, mut stream)| {
            Box::pin(async move {
                stream.recv().await;
                name
            })
        });
        let (name, _, _) = futures::future::select_all(waiters).await;
        tracing::info!(signal = name, "shutdown signal received");
        name
    }
}

#[cfg(not(unix))]
impl ShutdownSignal {
    pub fn install() -> Self {
        Self {}
    }

    pub fn watched(&self) -> Vec<&'static str> {
        vec!["ctrl-c"]
    }

    pub async fn wait(self) -> &'static str {
        wait_ctrl_c().await
    }
}

async fn wait_ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("shutdown signal received");
            "ctrl-c"
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for ctrl-c, waiting indefinitely");
            std::future::pending().await
        }
    }
}
