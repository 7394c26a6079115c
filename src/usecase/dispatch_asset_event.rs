use std::sync::Arc;

use crate::domain::entity::AssetEvent;
use crate::usecase::asset_command_executor::AssetCommandExecutor;

/// DispatchOutcome はディスパッチの結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Deleted { id: String },
    Ignored { event_type: String },
}

/// DispatchAssetEventUseCase はアセットイベントを種別ごとの処理に振り分ける。
pub struct DispatchAssetEventUseCase {
    executor: Arc<dyn AssetCommandExecutor>,
}

impl DispatchAssetEventUseCase {
    pub fn new(executor: Arc<dyn AssetCommandExecutor>) -> Self {
        Self { executor }
    }

    /// デコード済みのイベントを処理する。未知の種別はエラーにせず読み飛ばす。
    pub async fn execute(&self, event: &AssetEvent) -> anyhow::Result<DispatchOutcome> {
        match event {
            AssetEvent::Delete(payload) => {
                self.executor.delete(payload).await?;
                Ok(DispatchOutcome::Deleted {
                    id: payload.id.clone(),
                })
            }
            AssetEvent::Unknown { event_type } => {
                tracing::debug!(event_type = %event_type, "unhandled asset event type");
                Ok(DispatchOutcome::Ignored {
                    event_type: event_type.clone(),
                })
            }
        }
    }

    /// 生のメッセージ値をデコードしてから処理する。
    pub async fn execute_bytes(&self, value: &[u8]) -> anyhow::Result<DispatchOutcome> {
        let event = AssetEvent::decode(value)?;
        self.execute(&event).await
    }
}
