pub mod connection_events;
pub mod failover_config;
pub mod failover_controller;
pub mod reconnect_backoff;
pub mod recovery_hooks;
