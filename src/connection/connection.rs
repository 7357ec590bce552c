use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use crate::connection::client_config::ClientConfig;
use crate::consumer::acknowledgement::{AckType, AcknowledgeMode};
use crate::consumer::dispatch_queue::ReceiveTimeout;
use crate::consumer::message_envelope::MessageEnvelope;
use crate::discovery::discovery_feed::DiscoveryFeed;
use crate::error::ClientError;
use crate::failover::connection_events::{ConnectionEvent, ConnectionEventNotifier, ConnectionListener, ConnectionState};
use crate::failover::failover_controller::{ConnectionHandler, FailoverController};
use crate::failover::recovery_hooks::RecoveryHooks;
use crate::meta::resource_id::{ConnectionId, ConsumerId, ProducerId, ResourceId, SessionId};
use crate::meta::resource_info::{ConnectionInfo, Destination, ResourceInfo, ResourceState, SessionInfo};
use crate::meta::resource_registry::ResourceRegistry;
use crate::provider::broker_addr::BrokerAddr;
use crate::provider::request::Request;
use crate::provider::transport::TransportFactory;
use crate::session::session::Session;

/// The application's handle to a logical broker connection. It stays the same across transport
///  failures: the [FailoverController] underneath replaces transports and replays the
///  connection's resources on them.
pub struct Connection {
    config: ClientConfig,
    info: Arc<ResourceInfo>,
    connection_id: ConnectionId,

    registry: Arc<ResourceRegistry>,
    events: Arc<ConnectionEventNotifier>,
    controller: Arc<FailoverController>,

    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_session_id: AtomicU64,

    connected: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    myself: Weak<Connection>,
}

impl Connection {
    /// Sets up the connection without connecting, see [Connection::connect]. `discovery` takes
    ///  precedence over the configured static addresses once it has candidates.
    pub fn new(config: ClientConfig, factory: Arc<dyn TransportFactory>, discovery: Option<Arc<DiscoveryFeed>>) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;

        let connection_id = ConnectionId::random();
        let info = Arc::new(ResourceInfo::Connection(ConnectionInfo {
            id: connection_id,
            client_id: config.client_id.clone(),
        }));
        let registry = Arc::new(ResourceRegistry::new());
        let events = Arc::new(ConnectionEventNotifier::new());
        let controller = FailoverController::new(
            config.failover.clone(),
            config.request_timeout,
            factory,
            registry.clone(),
            discovery,
            events.clone(),
        );

        let connection = Arc::new_cyclic(|myself| Connection {
            config,
            info,
            connection_id,
            registry,
            events,
            controller,
            sessions: Default::default(),
            next_session_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            myself: myself.clone(),
        });

        let handler: Arc<dyn ConnectionHandler> = connection.clone();
        connection.controller.set_handler(Arc::downgrade(&handler));
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.controller.subscribe_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_usable()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn failure_cause(&self) -> Option<ClientError> {
        self.controller.failure_cause()
    }

    pub async fn remote_address(&self) -> Option<BrokerAddr> {
        self.controller.current_address().await
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.events.add_listener(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn check_closed(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::illegal_state("The Connection is closed"));
        }
        if let Some(cause) = self.failure_cause() {
            return Err(ClientError::illegal_state_caused_by("The Connection has failed", Some(cause)));
        }
        Ok(())
    }

    /// Establishes the initial transport and creates the connection on the broker. If this
    ///  fails, the error is what made the connection give up.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.check_closed()?;
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.registry.register(self.info.clone(), None)?;
        self.controller.start();

        let result = async {
            self.controller.await_connected(None).await?;
            self.create_resource(self.info.clone()).await
        }.await;

        match result {
            Ok(()) => {
                info!(connection = ?self.connection_id, "connected");
                Ok(())
            }
            Err(e) => Err(self.failure_cause().unwrap_or(e)),
        }
    }

    /// Starts message delivery for all sessions
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(connection = ?self.connection_id, "starting message delivery");
        for session in self.sessions() {
            session.start();
        }
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(connection = ?self.connection_id, "stopping message delivery");
        for session in self.sessions() {
            session.stop();
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub async fn create_session(&self, acknowledge_mode: AcknowledgeMode) -> Result<Arc<Session>, ClientError> {
        self.check_closed()?;
        let Some(me) = self.myself.upgrade() else {
            return Err(ClientError::illegal_state("The Connection is closed"));
        };

        let session_info = SessionInfo {
            id: SessionId {
                connection: self.connection_id,
                value: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            },
            acknowledge_mode,
        };
        let session = Session::new(me, session_info);
        let id = session.id();
        debug!(session = ?id, ?acknowledge_mode, "creating session");

        let hooks: Arc<dyn RecoveryHooks> = session.clone();
        self.register_resource(session.resource_info(), Some(Arc::downgrade(&hooks)))?;
        self.sessions.lock().insert(id, session.clone());

        if let Err(e) = self.create_resource(session.resource_info()).await {
            warn!(session = ?id, "creating session failed: {}", e);
            session.shutdown(None);
            self.sessions.lock().remove(&id);
            self.unregister_resource(id.into());
            return Err(e);
        }

        if self.is_started() {
            session.start();
        }
        Ok(session)
    }

    pub(crate) fn remove_session(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    /// Closes all sessions, and then the connection itself. Closing a closed connection has no
    ///  effect.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(connection = ?self.connection_id, "closing connection");
        self.started.store(false, Ordering::SeqCst);

        let usable = self.is_connected();
        for session in self.sessions() {
            if usable {
                if let Err(e) = session.close().await {
                    debug!(session = ?session.id(), "closing session failed: {}", e);
                }
            }
            else {
                session.shutdown(None);
            }
        }
        self.sessions.lock().clear();

        let result = if usable {
            self.destroy_resource(self.connection_id.into()).await
        }
        else {
            Ok(())
        };
        self.controller.close().await;
        result
    }

    pub(crate) fn on_async_exception(&self, error: ClientError) {
        debug!(connection = ?self.connection_id, "async exception: {}", error);
        self.events.send_event(ConnectionEvent::AsyncException(error));
    }

    pub(crate) fn register_resource(&self, info: Arc<ResourceInfo>, hooks: Option<Weak<dyn RecoveryHooks>>) -> Result<(), ClientError> {
        self.registry.register(info, hooks)
    }

    pub(crate) fn unregister_resource(&self, id: ResourceId) {
        self.registry.unregister(id);
    }

    pub fn num_registered_resources(&self) -> usize {
        self.registry.len()
    }

    async fn request(&self, request: Request) -> Result<(), ClientError> {
        self.controller.request(request, self.config.request_timeout).await
    }

    pub(crate) async fn create_resource(&self, info: Arc<ResourceInfo>) -> Result<(), ClientError> {
        let id = info.id();
        self.registry.set_state(id, ResourceState::Creating);
        self.request(Request::Create(info)).await?;
        self.registry.set_state(id, ResourceState::Created);
        Ok(())
    }

    pub(crate) async fn start_resource(&self, id: ResourceId) -> Result<(), ClientError> {
        self.request(Request::Start(id)).await?;
        self.registry.set_state(id, ResourceState::Started);
        Ok(())
    }

    pub(crate) async fn stop_resource(&self, id: ResourceId) -> Result<(), ClientError> {
        self.request(Request::Stop(id)).await?;
        self.registry.set_state(id, ResourceState::Stopped);
        Ok(())
    }

    /// The resource is forgotten locally first, so it is not replayed even if the destroy
    ///  request does not reach the broker.
    pub(crate) async fn destroy_resource(&self, id: ResourceId) -> Result<(), ClientError> {
        self.registry.unregister(id);
        self.request(Request::Destroy(id)).await
    }

    pub(crate) async fn acknowledge(&self, consumer: ConsumerId, delivery_id: u64, ack_type: AckType) -> Result<(), ClientError> {
        trace!(?consumer, delivery_id, ?ack_type, "acknowledging");
        self.request(Request::Acknowledge { consumer, delivery_id, ack_type }).await
    }

    pub(crate) async fn pull(&self, consumer: ConsumerId, timeout: ReceiveTimeout) -> Result<(), ClientError> {
        self.request(Request::Pull { consumer, timeout }).await
    }

    pub(crate) async fn send(&self, producer: ProducerId, destination: Destination, payload: Bytes, priority: u8) -> Result<(), ClientError> {
        self.request(Request::Send { producer, destination, payload, priority }).await
    }

    pub(crate) async fn begin(&self, session: SessionId) -> Result<(), ClientError> {
        self.request(Request::Begin(session)).await
    }

    pub(crate) async fn commit(&self, session: SessionId) -> Result<(), ClientError> {
        self.request(Request::Commit(session)).await
    }

    pub(crate) async fn rollback(&self, session: SessionId) -> Result<(), ClientError> {
        self.request(Request::Rollback(session)).await
    }
}

impl ConnectionHandler for Connection {
    fn on_inbound_message(&self, envelope: MessageEnvelope) {
        let session = self.sessions.lock().get(&envelope.consumer.session).cloned();
        match session {
            Some(session) => session.on_inbound(envelope),
            None => debug!(consumer = ?envelope.consumer, delivery_id = envelope.delivery_id, "dropping message for unknown session"),
        }
    }

    fn on_connection_failure(&self, error: &ClientError) {
        warn!(connection = ?self.connection_id, "connection failed, shutting down all sessions: {}", error);
        self.started.store(false, Ordering::SeqCst);
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions.values() {
            session.shutdown(Some(error.clone()));
        }
    }
}
