use async_trait::async_trait;

use crate::adapter::handler::log_claimed;
use crate::domain::consumer::{ClaimHandler, GroupSession, PartitionClaim};
use crate::error::ConsumerError;
use crate::runtime::handoff::HandoffSender;

/// ForwardClaimHandler はメッセージ値を受け渡しチャネルへ転送し、転送後に処理済みとして記録する。
pub struct ForwardClaimHandler {
    handoff: HandoffSender,
}

impl ForwardClaimHandler {
    pub fn new(handoff: HandoffSender) -> Self {
        Self { handoff }
    }
}

#[async_trait]
impl ClaimHandler for ForwardClaimHandler {
    async fn handle_claim(
        &self,
        session: &dyn GroupSession,
        mut claim: PartitionClaim,
    ) -> Result<(), ConsumerError> {
        while let Some(message) = claim.next().await {
            log_claimed(&message);

            // 受け渡しチャネルが満杯の間に世代が終わった場合は未記録のまま抜ける
            tokio::select! {
                biased;
                () = session.context().cancelled() => return Ok(()),
                sent = self.handoff.send(message.value.clone()) => sent?,
            }

            session.mark_message(&message)?;
        }
        Ok(())
    }
}
