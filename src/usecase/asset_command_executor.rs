use async_trait::async_trait;

use crate::domain::entity::DeletePayload;

/// AssetCommandExecutor はアセットイベントに対応する下流処理の実行を担う。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetCommandExecutor: Send + Sync {
    async fn delete(&self, payload: &DeletePayload) -> anyhow::Result<()>;
}

/// LoggingAssetCommandExecutor は受け取ったコマンドをログに出力するだけの実装。
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAssetCommandExecutor;

#[async_trait]
impl AssetCommandExecutor for LoggingAssetCommandExecutor {
    async fn delete(&self, payload: &DeletePayload) -> anyhow::Result<()> {
        tracing::info!(
            asset_id = %payload.id,
            path = payload.path.as_deref().unwrap_or(""),
            "asset delete requested"
        );
        Ok(())
    }
}
