//! アセットイベント向けの Kafka コンシューマーグループ実行基盤。
//!
//! N 個の Worker がそれぞれ独立したブローカー接続でグループに参加し、
//! 停止シグナルを受けると全 Worker の完了を待ってから終了する。

pub mod adapter;
pub mod cli;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod runtime;
pub mod usecase;

pub use error::ConsumerError;
