use tokio::sync::mpsc;

use crate::error::ConsumerError;

/// 参照構成での受け渡しチャネル容量。
pub const DEFAULT_HANDOFF_CAPACITY: usize = 30;

/// HandoffSender は受け渡しチャネルへの送信側。複数の Worker で複製して使う。
///
/// チャネルが満杯のとき `send` は空きができるまで待機する。破棄も無制限の増加もしない。
#[derive(Debug, Clone)]
pub struct HandoffSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl HandoffSender {
    pub async fn send(&self, value: Vec<u8>) -> Result<(), ConsumerError> {
        self.tx
            .send(value)
            .await
            .map_err(|_| ConsumerError::Forward("hand-off channel closed".to_string()))
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// 現在キューに溜まっているメッセージ数。
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// HandoffReceiver は受け渡しチャネルの受信側。下流処理が所有する。
#[derive(Debug)]
pub struct HandoffReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl HandoffReceiver {
    /// 次のメッセージを待つ。全送信側が破棄されると `None` を返す。
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// 容量 `capacity` の受け渡しチャネルを生成する。
pub fn handoff_channel(capacity: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (HandoffSender { tx }, HandoffReceiver { rx })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_send_blocks_when_full() {
        let (tx, mut rx) = handoff_channel(2);
        tx.send(b"a".to_vec()).await.unwrap();
        tx.send(b"b".to_vec()).await.unwrap();
        assert_eq!(tx.len(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(b"c".to_vec())).await;
        assert!(blocked.is_err(), "send must suspend while the channel is full");
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.recv().await.as_deref(), Some(&b"a"[..]));
        tx.send(b"c".to_vec()).await.unwrap();
        assert_eq!(tx.len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_send_wakes_when_receiver_drains() {
        let (tx, mut rx) = handoff_channel(1);
        tx.send(b"first".to_vec()).await.unwrap();

        let mut pending = tokio_test::task::spawn(tx.send(b"second".to_vec()));
        tokio_test::assert_pending!(pending.poll());

        assert_eq!(rx.recv().await.as_deref(), Some(&b"first"[..]));
        assert!(pending.is_woken());
        tokio_test::assert_ready_ok!(pending.poll());
        drop(pending);
        assert_eq!(rx.recv().await.as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_forward_error() {
        let (tx, rx) = handoff_channel(1);
        drop(rx);
        let err = tx.send(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Forward(_)));
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_dropped() {
        let (tx, mut rx) = handoff_channel(DEFAULT_HANDOFF_CAPACITY);
        assert_eq!(tx.capacity(), 30);
        assert!(tx.is_empty());
        let tx2 = tx.clone();
        tx2.send(b"v".to_vec()).await.unwrap();
        drop(tx);
        drop(tx2);
        assert_eq!(rx.recv().await.as_deref(), Some(&b"v"[..]));
        assert!(rx.recv().await.is_none());
    }
}
