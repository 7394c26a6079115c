pub mod broker;
pub mod claim;

pub use broker::{BrokerClient, BrokerConnector};
pub use claim::{ClaimHandler, GroupSession, PartitionClaim};
