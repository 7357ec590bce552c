pub mod connection;
pub mod consumer;
pub mod discovery;
pub mod error;
pub mod failover;
pub mod meta;
pub mod provider;
pub mod session;
pub mod test_util;
