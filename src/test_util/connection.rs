use std::sync::Arc;
use std::time::Duration;

use crate::connection::client_config::ClientConfig;
use crate::connection::connection::Connection;
use crate::provider::broker_addr::BrokerAddr;
use crate::test_util::transport::TrackingTransportFactory;

pub fn test_config() -> ClientConfig {
    ClientConfig::new(vec![BrokerAddr::new("localhost", 5672)])
}

/// a connected [Connection] on top of a fresh [TrackingTransportFactory]
pub async fn connect_tracked(config: ClientConfig) -> (Arc<Connection>, Arc<TrackingTransportFactory>) {
    let factory = Arc::new(TrackingTransportFactory::new());
    let connection = match Connection::new(config, factory.clone(), None) {
        Ok(connection) => connection,
        Err(e) => panic!("invalid test configuration: {}", e),
    };
    if let Err(e) = connection.connect().await {
        panic!("connecting failed: {}", e);
    }
    (connection, factory)
}

/// Polls a condition until it holds. This is meant for tests with paused time, so it gives up
///  after a second of virtual time.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition did not hold within a second");
}
