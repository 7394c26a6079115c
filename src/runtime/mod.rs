pub mod backoff;
pub mod completion;
pub mod coordinator;
pub mod group;
pub mod handoff;
pub mod shutdown;
pub mod worker;

pub use backoff::RetryConfig;
pub use completion::{completion_channel, CompletionReceiver, CompletionSignal, WorkerOutcome, WorkerReport};
pub use coordinator::{Coordinator, CoordinatorSettings, ShutdownReport};
pub use group::{ConsumerGroup, SessionEnd, DEFAULT_CLAIM_BUFFER};
pub use handoff::{handoff_channel, HandoffReceiver, HandoffSender, DEFAULT_HANDOFF_CAPACITY};
pub use shutdown::ShutdownSignal;
pub use worker::{Worker, WorkerState};
