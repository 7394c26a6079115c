use std::sync::Arc;

use clap::Parser;
use tracing::info;

use k1s0_storemanager::adapter::handler::{AssetEventClaimHandler, ForwardClaimHandler};
use k1s0_storemanager::cli::Cli;
use k1s0_storemanager::domain::consumer::{BrokerConnector, ClaimHandler};
use k1s0_storemanager::infrastructure::config::{self, HandlerKind, RuntimeSettings};
use k1s0_storemanager::infrastructure::kafka::{KafkaConnector, KafkaConnectorConfig};
use k1s0_storemanager::infrastructure::memory::{InMemoryBroker, InMemoryConnector};
use k1s0_storemanager::infrastructure::telemetry;
use k1s0_storemanager::runtime::{
    handoff_channel, Coordinator, CoordinatorSettings, HandoffReceiver, ShutdownSignal,
};
use k1s0_storemanager::usecase::{DispatchAssetEventUseCase, LoggingAssetCommandExecutor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = cli.overrides();

    // Config
    let mut cfg = config::load(cli.config.as_deref(), cli.env_config.as_deref())?;
    config::apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    cfg.apply_overrides(&overrides);

    // Logging
    telemetry::init_logging(&cfg.log)?;

    let settings = cfg.validate(overrides.in_memory).inspect_err(|e| {
        tracing::error!(error = %e, "invalid configuration");
    })?;

    // 接続確認中に届いたシグナルも停止要求として扱う
    let shutdown = ShutdownSignal::install();

    info!(
        app_name = %settings.app_name,
        environment = %settings.environment,
        brokers = ?settings.brokers,
        version = %settings.version,
        group = %settings.group,
        topics = ?settings.topics,
        assignor = %settings.assignor,
        initial_offset = %settings.initial_offset,
        workers = settings.workers,
        handler = %settings.handler,
        "starting storemanager consumer"
    );

    if settings.in_memory {
        let broker = InMemoryBroker::new()
            .with_assignor(settings.assignor)
            .with_initial_offset(settings.initial_offset);
        for topic in &settings.topics {
            broker.create_topic(topic, settings.workers);
        }
        info!("using in-memory broker");
        run(
            InMemoryConnector::new(broker, settings.group.clone()),
            &settings,
            shutdown,
        )
        .await
    } else {
        run(
            KafkaConnector::new(KafkaConnectorConfig::from(&settings)),
            &settings,
            shutdown,
        )
        .await
    }
}

async fn run<K: BrokerConnector>(
    connector: K,
    settings: &RuntimeSettings,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let dispatch_uc = Arc::new(DispatchAssetEventUseCase::new(Arc::new(
        LoggingAssetCommandExecutor,
    )));

    let (handler, downstream) = match settings.handler {
        HandlerKind::Forward => {
            let (tx, rx) = handoff_channel(settings.handoff_capacity);
            let downstream = tokio::spawn(forward_downstream(rx, dispatch_uc));
            let handler: Arc<dyn ClaimHandler> = Arc::new(ForwardClaimHandler::new(tx));
            (handler, Some(downstream))
        }
        HandlerKind::Dispatch => {
            let handler: Arc<dyn ClaimHandler> = Arc::new(AssetEventClaimHandler::new(dispatch_uc));
            (handler, None)
        }
    };

    let coordinator = Coordinator::new(
        connector,
        CoordinatorSettings {
            group: settings.group.clone(),
            topics: settings.topics.clone(),
            workers: settings.workers,
            shutdown_timeout: settings.shutdown_timeout,
            retry: settings.retry.clone(),
        },
    );

    let result = coordinator
        .run(move |_| handler.clone(), async move {
            shutdown.wait().await;
        })
        .await;

    if let Some(downstream) = downstream {
        if result.is_ok() {
            if let Err(e) = downstream.await {
                tracing::warn!(error = %e, "hand-off downstream task failed");
            }
        } else {
            downstream.abort();
        }
    }

    match result {
        Ok(report) => {
            info!(completed = report.completed, "storemanager consumer exited");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "storemanager consumer terminated");
            Err(e.into())
        }
    }
}

/// 受け渡しチャネルから値を取り出してディスパッチする。送信側が全て破棄されると終了する。
async fn forward_downstream(mut rx: HandoffReceiver, dispatch_uc: Arc<DispatchAssetEventUseCase>) {
    while let Some(value) = rx.recv().await {
        // オフセットは転送時に記録済みのため、ここでの失敗はログのみ
        if let Err(e) = dispatch_uc.execute_bytes(&value).await {
            tracing::warn!(error = %e, "failed to dispatch forwarded asset event");
        }
    }
    info!("hand-off downstream drained");
}
