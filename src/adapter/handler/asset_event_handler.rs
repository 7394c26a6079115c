use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::handler::log_claimed;
use crate::domain::consumer::{ClaimHandler, GroupSession, PartitionClaim};
use crate::domain::entity::AssetEvent;
use crate::error::ConsumerError;
use crate::usecase::DispatchAssetEventUseCase;

/// AssetEventClaimHandler はメッセージ値をアセットイベントとしてデコードし、ディスパッチする。
///
/// デコードまたはディスパッチに失敗したメッセージは記録せず、クレームを中断する。
pub struct AssetEventClaimHandler {
    dispatch_uc: Arc<DispatchAssetEventUseCase>,
}

impl AssetEventClaimHandler {
    pub fn new(dispatch_uc: Arc<DispatchAssetEventUseCase>) -> Self {
        Self { dispatch_uc }
    }
}

#[async_trait]
impl ClaimHandler for AssetEventClaimHandler {
    async fn setup(&self, session: &dyn GroupSession) -> Result<(), ConsumerError> {
        tracing::debug!(
            member_id = session.member_id(),
            generation = session.generation(),
            claims = session.claims().len(),
            "asset event handler ready"
        );
        Ok(())
    }

    async fn handle_claim(
        &self,
        session: &dyn GroupSession,
        mut claim: PartitionClaim,
    ) -> Result<(), ConsumerError> {
        while let Some(message) = claim.next().await {
            log_claimed(&message);

            let event = AssetEvent::decode(&message.value)?;
            let outcome = self.dispatch_uc.execute(&event).await.map_err(|e| {
                ConsumerError::Handler(format!(
                    "failed to dispatch {} event at {}@{}: {e}",
                    event.event_type(),
                    message.topic_partition(),
                    message.offset
                ))
            })?;
            tracing::debug!(offset = message.offset, outcome = ?outcome, "asset event dispatched");

            session.mark_message(&message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::domain::entity::{ConsumedMessage, TopicPartition};
    use crate::usecase::asset_command_executor::MockAssetCommandExecutor;

    struct RecordingSession {
        ctx: CancellationToken,
        marked: Mutex<Vec<i64>>,
    }

    impl GroupSession for RecordingSession {
        fn member_id(&self) -> &str {
            "member-0"
        }

        fn generation(&self) -> u64 {
            1
        }

        fn claims(&self) -> &[TopicPartition] {
            &[]
        }

        fn context(&self) -> &CancellationToken {
            &self.ctx
        }

        fn mark_message(&self, message: &ConsumedMessage) -> Result<(), ConsumerError> {
            self.marked.lock().unwrap().push(message.offset);
            Ok(())
        }
    }

    fn message(offset: i64, value: &[u8]) -> ConsumedMessage {
        ConsumedMessage {
            topic: "asset-events".to_string(),
            partition: 0,
            offset,
            key: None,
            value: value.to_vec(),
            timestamp: None,
        }
    }

    async fn run_claim(
        handler: &AssetEventClaimHandler,
        messages: Vec<ConsumedMessage>,
    ) -> (Result<(), ConsumerError>, Vec<i64>) {
        let session = RecordingSession {
            ctx: CancellationToken::new(),
            marked: Mutex::new(Vec::new()),
        };
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for m in messages {
            tx.send(m).await.unwrap();
        }
        drop(tx);
        let claim = PartitionClaim::new(TopicPartition::new("asset-events", 0), rx, session.ctx.clone());
        handler.setup(&session).await.unwrap();
        let result = handler.handle_claim(&session, claim).await;
        let marked = session.marked.lock().unwrap().clone();
        (result, marked)
    }

    #[tokio::test]
    async fn test_delete_and_unknown_are_marked() {
        let mut mock = MockAssetCommandExecutor::new();
        mock.expect_delete()
            .withf(|p| p.id == "x1")
            .times(1)
            .returning(|_| Ok(()));
        let handler = AssetEventClaimHandler::new(Arc::new(DispatchAssetEventUseCase::new(Arc::new(mock))));

        let (result, marked) = run_claim(
            &handler,
            vec![
                message(0, br#"{"event_type":"delete","payload":{"id":"x1"}}"#),
                message(1, br#"{"event_type":"move","payload":{}}"#),
            ],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(marked, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_decode_failure_aborts_claim_without_mark() {
        let mock = MockAssetCommandExecutor::new();
        let handler = AssetEventClaimHandler::new(Arc::new(DispatchAssetEventUseCase::new(Arc::new(mock))));

        let (result, marked) = run_claim(
            &handler,
            vec![
                message(0, br#"{"event_type":"move"}"#),
                message(1, b"{broken"),
                message(2, br#"{"event_type":"move"}"#),
            ],
        )
        .await;

        assert!(matches!(result, Err(ConsumerError::Decode(_))));
        assert_eq!(marked, vec![0]);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_handler_error() {
        let mut mock = MockAssetCommandExecutor::new();
        mock.expect_delete()
            .returning(|_| Err(anyhow::anyhow!("storage unavailable")));
        let handler = AssetEventClaimHandler::new(Arc::new(DispatchAssetEventUseCase::new(Arc::new(mock))));

        let (result, marked) = run_claim(
            &handler,
            vec![message(4, br#"{"event_type":"delete","payload":{"id":"x1"}}"#)],
        )
        .await;

        assert!(matches!(result, Err(ConsumerError::Handler(_))));
        assert!(marked.is_empty());
    }
}
