pub mod discovery_agent;
pub mod discovery_feed;
