pub mod asset_command_executor;
pub mod dispatch_asset_event;

pub use asset_command_executor::{AssetCommandExecutor, LoggingAssetCommandExecutor};
pub use dispatch_asset_event::{DispatchAssetEventUseCase, DispatchOutcome};
