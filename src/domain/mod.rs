pub mod assignor;
pub mod consumer;
pub mod entity;
