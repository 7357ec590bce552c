use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::discovery_agent::DiscoveryAgent;
use crate::provider::broker_addr::BrokerAddr;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DiscoveryEventKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiscoveryEvent {
    pub address: BrokerAddr,
    pub kind: DiscoveryEventKind,
}

impl DiscoveryEvent {
    pub fn added(address: BrokerAddr) -> DiscoveryEvent {
        DiscoveryEvent {
            address,
            kind: DiscoveryEventKind::Added,
        }
    }

    pub fn removed(address: BrokerAddr) -> DiscoveryEvent {
        DiscoveryEvent {
            address,
            kind: DiscoveryEventKind::Removed,
        }
    }
}

/// The set of broker addresses currently advertised by some discovery mechanism, in the order
///  they were first advertised. Addresses are taken at face value: whether a broker is actually
///  reachable is found out by connecting to it.
pub struct DiscoveryFeed {
    candidates: RwLock<Vec<BrokerAddr>>,
    added: broadcast::Sender<BrokerAddr>,
}

impl Default for DiscoveryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryFeed {
    pub fn new() -> DiscoveryFeed {
        let (added, _) = broadcast::channel(64);
        DiscoveryFeed {
            candidates: Default::default(),
            added,
        }
    }

    /// Applies an event to the candidate set, returning `true` if the set changed. Duplicate
    ///  additions and removals of unknown addresses are ignored.
    pub fn on_event(&self, event: DiscoveryEvent) -> bool {
        match event.kind {
            DiscoveryEventKind::Added => {
                {
                    let mut candidates = self.candidates.write();
                    if candidates.contains(&event.address) {
                        return false;
                    }
                    candidates.push(event.address.clone());
                }
                debug!(address = %event.address, "discovered broker");
                let _ = self.added.send(event.address);
                true
            }
            DiscoveryEventKind::Removed => {
                let mut candidates = self.candidates.write();
                let len_before = candidates.len();
                candidates.retain(|a| a != &event.address);
                let changed = candidates.len() != len_before;
                if changed {
                    debug!(address = %event.address, "broker no longer advertised");
                }
                changed
            }
        }
    }

    pub fn current_candidates(&self) -> Vec<BrokerAddr> {
        self.candidates.read().clone()
    }

    /// notification of newly added addresses
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerAddr> {
        self.added.subscribe()
    }

    /// Runs a discovery agent on a background task, feeding its events into this feed until the
    ///  agent is exhausted or fails.
    pub fn spawn_agent(self: &Arc<Self>, mut agent: Box<dyn DiscoveryAgent>) -> JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move {
            loop {
                match agent.next_event().await {
                    Ok(Some(event)) => {
                        feed.on_event(event);
                    }
                    Ok(None) => {
                        info!("discovery agent finished");
                        break;
                    }
                    Err(e) => {
                        warn!("discovery agent failed: {:#}", e);
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;
    use crate::discovery::discovery_agent::ChannelDiscoveryAgent;

    fn addr(port: u16) -> BrokerAddr {
        BrokerAddr::new("localhost", port)
    }

    #[test]
    fn test_candidates_keep_advertisement_order() {
        let feed = DiscoveryFeed::new();
        assert!(feed.on_event(DiscoveryEvent::added(addr(3))));
        assert!(feed.on_event(DiscoveryEvent::added(addr(1))));
        assert!(!feed.on_event(DiscoveryEvent::added(addr(3))));
        assert!(feed.on_event(DiscoveryEvent::added(addr(2))));

        assert_eq!(feed.current_candidates(), vec![addr(3), addr(1), addr(2)]);
    }

    #[test]
    fn test_removal() {
        let feed = DiscoveryFeed::new();
        feed.on_event(DiscoveryEvent::added(addr(1)));
        feed.on_event(DiscoveryEvent::added(addr(2)));

        assert!(!feed.on_event(DiscoveryEvent::removed(addr(9))));
        assert!(feed.on_event(DiscoveryEvent::removed(addr(1))));
        assert!(!feed.on_event(DiscoveryEvent::removed(addr(1))));
        assert_eq!(feed.current_candidates(), vec![addr(2)]);

        assert!(feed.on_event(DiscoveryEvent::added(addr(1))));
        assert_eq!(feed.current_candidates(), vec![addr(2), addr(1)]);
    }

    #[test]
    fn test_subscribe_sees_only_new_additions() {
        let feed = DiscoveryFeed::new();
        let mut receiver = feed.subscribe();

        feed.on_event(DiscoveryEvent::added(addr(1)));
        feed.on_event(DiscoveryEvent::added(addr(1)));
        feed.on_event(DiscoveryEvent::removed(addr(1)));
        feed.on_event(DiscoveryEvent::added(addr(2)));

        assert_eq!(receiver.try_recv().unwrap(), addr(1));
        assert_eq!(receiver.try_recv().unwrap(), addr(2));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_agent() {
        let feed = Arc::new(DiscoveryFeed::new());
        let (agent, sender) = ChannelDiscoveryAgent::new();
        let handle = feed.spawn_agent(Box::new(agent));

        sender.send(DiscoveryEvent::added(addr(1))).await.unwrap();
        sender.send(DiscoveryEvent::added(addr(2))).await.unwrap();
        sender.send(DiscoveryEvent::removed(addr(1))).await.unwrap();
        drop(sender);

        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(feed.current_candidates(), vec![addr(2)]);
    }
}
