use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::ClientError;
use crate::provider::broker_addr::BrokerAddr;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    /// initial connect, no transport was established yet
    Connecting,
    Connected,
    /// the transport was lost, the controller is looking for a new one
    Interrupted,
    /// a new transport was established, resources are being replayed on it
    Recovering,
    /// replay is complete
    Restored,
    /// the connection gave up, this is final
    Failed,
    /// closed by the application, this is final
    Closed,
}

impl ConnectionState {
    /// requests can be issued right away
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Restored)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Established(BrokerAddr),
    Interrupted(BrokerAddr),
    Restored(BrokerAddr),
    /// the connection failed permanently
    Failure(ClientError),
    /// an error that occurred outside of an application call, e.g. in a message listener
    AsyncException(ClientError),
}

/// Application callbacks for connection events. They are called sequentially on a dedicated
///  task, so a slow listener delays later events but never the connection itself.
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    async fn on_connection_established(&self, _remote: &BrokerAddr) {}
    async fn on_connection_interrupted(&self, _remote: &BrokerAddr) {}
    async fn on_connection_restored(&self, _remote: &BrokerAddr) {}
    async fn on_connection_failure(&self, _error: &ClientError) {}
    async fn on_async_exception(&self, _error: &ClientError) {}
}

pub struct ConnectionEventNotifier {
    listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>,
    queue: mpsc::UnboundedSender<ConnectionEvent>,
    broadcast: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionEventNotifier {
    /// NB: this spawns the notification task, so it must be called inside a Tokio runtime
    pub fn new() -> ConnectionEventNotifier {
        let listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>> = Default::default();
        let (queue, receiver) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(128);

        tokio::spawn(Self::notify_loop(listeners.clone(), receiver));

        ConnectionEventNotifier {
            listeners,
            queue,
            broadcast,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.broadcast.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("connection event: {:?}", event);
        let _ = self.broadcast.send(event.clone());
        let _ = self.queue.send(event);
    }

    async fn notify_loop(listeners: Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>, mut receiver: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = receiver.recv().await {
            let listeners = listeners.read().clone();
            for listener in listeners {
                match &event {
                    ConnectionEvent::Established(addr) => listener.on_connection_established(addr).await,
                    ConnectionEvent::Interrupted(addr) => listener.on_connection_interrupted(addr).await,
                    ConnectionEvent::Restored(addr) => listener.on_connection_restored(addr).await,
                    ConnectionEvent::Failure(e) => listener.on_connection_failure(e).await,
                    ConnectionEvent::AsyncException(e) => listener.on_async_exception(e).await,
                }
            }
        }
        trace!("connection event notifier shut down");
    }
}
