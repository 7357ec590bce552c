use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::discovery::discovery_feed::DiscoveryEvent;

/// Source of discovery events, e.g. a listener for multicast advertisements. The mechanism
///  itself lives outside of the client core.
#[async_trait]
pub trait DiscoveryAgent: Send + 'static {
    /// `Ok(None)` signals that the agent will produce no more events
    async fn next_event(&mut self) -> anyhow::Result<Option<DiscoveryEvent>>;
}

/// Adapter for agents that push their events rather than being polled
pub struct ChannelDiscoveryAgent {
    receiver: mpsc::Receiver<DiscoveryEvent>,
}

impl ChannelDiscoveryAgent {
    pub fn new() -> (ChannelDiscoveryAgent, mpsc::Sender<DiscoveryEvent>) {
        let (sender, receiver) = mpsc::channel(64);
        (ChannelDiscoveryAgent { receiver }, sender)
    }
}

#[async_trait]
impl DiscoveryAgent for ChannelDiscoveryAgent {
    async fn next_event(&mut self) -> anyhow::Result<Option<DiscoveryEvent>> {
        Ok(self.receiver.recv().await)
    }
}
