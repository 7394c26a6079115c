pub mod config;
pub mod kafka;
pub mod memory;
pub mod telemetry;
