use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{broadcast, mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::consumer::message_envelope::MessageEnvelope;
use crate::discovery::discovery_feed::DiscoveryFeed;
use crate::error::ClientError;
use crate::failover::connection_events::{ConnectionEvent, ConnectionEventNotifier, ConnectionState};
use crate::failover::failover_config::{FailoverConfig, InterruptedRequestPolicy};
use crate::failover::reconnect_backoff::ReconnectBackoff;
use crate::failover::recovery_hooks::{PlainRecovery, RecoveryHooks};
use crate::meta::resource_info::ResourceState;
use crate::meta::resource_registry::ResourceRegistry;
use crate::provider::broker_addr::BrokerAddr;
use crate::provider::operation_future::OperationFuture;
use crate::provider::request::{Request, RequestClass};
use crate::provider::transport::{Transport, TransportFactory, TransportListener};

/// The part of the connection that the controller calls back into
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_inbound_message(&self, envelope: MessageEnvelope);

    /// the connection failed permanently, all sessions and consumers are gone
    fn on_connection_failure(&self, error: &ClientError);
}

struct CurrentTransport {
    transport: Arc<dyn Transport>,
    address: BrokerAddr,
    generation: u64,
    failed: Arc<AtomicBool>,
}

/// Owns the connection's transport, and replaces it transparently when it fails.
///
/// A background driver task establishes the initial transport, waits for it to fail and then
///  reconnects, replaying the [ResourceRegistry] on every new transport before it is put to
///  use. Application requests go through [FailoverController::request] which hides the
///  transport swap, see [InterruptedRequestPolicy] for what happens to requests issued while
///  no transport is available.
pub struct FailoverController {
    config: FailoverConfig,
    /// timeout for replayed requests
    request_timeout: Option<Duration>,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<ResourceRegistry>,
    discovery: Option<Arc<DiscoveryFeed>>,
    events: Arc<ConnectionEventNotifier>,

    state: watch::Sender<ConnectionState>,
    current: RwLock<Option<CurrentTransport>>,
    /// generation of the transport that is current or being recovered
    active_generation: AtomicU64,
    next_generation: AtomicU64,

    pending: Mutex<FxHashMap<u64, (u64, OperationFuture)>>,
    next_request_id: AtomicU64,

    ever_connected: AtomicBool,
    pending_redirect: Mutex<Option<BrokerAddr>>,
    failure: Mutex<Option<ClientError>>,

    failure_sender: mpsc::UnboundedSender<(u64, ClientError)>,
    failure_receiver: Mutex<Option<mpsc::UnboundedReceiver<(u64, ClientError)>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    handler: OnceLock<Weak<dyn ConnectionHandler>>,
    myself: Weak<FailoverController>,
}

impl FailoverController {
    pub fn new(
        config: FailoverConfig,
        request_timeout: Option<Duration>,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<ResourceRegistry>,
        discovery: Option<Arc<DiscoveryFeed>>,
        events: Arc<ConnectionEventNotifier>,
    ) -> Arc<FailoverController> {
        let mut config = config;
        if config.randomize_candidates {
            config.static_addresses.shuffle(&mut rand::thread_rng());
        }

        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (failure_sender, failure_receiver) = mpsc::unbounded_channel();

        Arc::new_cyclic(|myself| FailoverController {
            config,
            request_timeout,
            factory,
            registry,
            discovery,
            events,
            state,
            current: RwLock::new(None),
            active_generation: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
            pending: Default::default(),
            next_request_id: AtomicU64::new(0),
            ever_connected: AtomicBool::new(false),
            pending_redirect: Default::default(),
            failure: Default::default(),
            failure_sender,
            failure_receiver: Mutex::new(Some(failure_receiver)),
            driver: Default::default(),
            handler: OnceLock::new(),
            myself: myself.clone(),
        })
    }

    pub fn set_handler(&self, handler: Weak<dyn ConnectionHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("connection handler was already set - ignoring");
        }
    }

    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler.get()
            .and_then(|h| h.upgrade())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// the error that made the connection fail, if it did
    pub fn failure_cause(&self) -> Option<ClientError> {
        self.failure.lock().clone()
    }

    pub async fn current_address(&self) -> Option<BrokerAddr> {
        self.current.read().await
            .as_ref()
            .map(|c| c.address.clone())
    }

    /// Spawns the driver task. Calling this more than once has no effect.
    pub fn start(&self) {
        let Some(failures) = self.failure_receiver.lock().take() else {
            debug!("failover controller is already started");
            return;
        };
        let Some(myself) = self.myself.upgrade() else {
            return;
        };
        let handle = tokio::spawn(myself.run_driver(failures));
        *self.driver.lock() = Some(handle);
    }

    /// Waits until the connection is usable for the first time, or until it failed
    pub async fn await_connected(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let mut state = self.state.subscribe();
        let wait = async {
            loop {
                let s = *state.borrow_and_update();
                if s.is_usable() {
                    return Ok(());
                }
                if s.is_terminal() {
                    return Err(self.terminal_error(s));
                }
                if state.changed().await.is_err() {
                    return Err(self.terminal_error(ConnectionState::Closed));
                }
            }
        };

        match timeout {
            None => wait.await,
            Some(t) => tokio::time::timeout(t, wait).await
                .unwrap_or(Err(ClientError::Timeout(t))),
        }
    }

    fn terminal_error(&self, state: ConnectionState) -> ClientError {
        match state {
            ConnectionState::Failed => ClientError::illegal_state_caused_by("The connection has failed", self.failure_cause()),
            _ => ClientError::illegal_state("The connection is closed"),
        }
    }

    /// Issues a request on the current transport and waits for its outcome.
    ///
    /// While the connection is not usable, the request is handled according to the configured
    ///  [InterruptedRequestPolicy] for its [RequestClass]. Resource operations that are queued
    ///  rather than failed are also re-issued if the transport fails while they are in flight.
    pub async fn request(&self, request: Request, timeout: Option<Duration>) -> Result<(), ClientError> {
        // NB: a timeout too large to represent as an instant means no deadline
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let class = request.class();
        let policy = match class {
            RequestClass::ResourceOperation => self.config.resource_requests_while_interrupted,
            RequestClass::OneShot => self.config.one_shot_requests_while_interrupted,
            RequestClass::Teardown => InterruptedRequestPolicy::FailFast,
        };

        loop {
            let mut state = self.state.subscribe();
            let current_state = *state.borrow_and_update();
            if current_state.is_terminal() {
                return Err(self.terminal_error(current_state));
            }

            if current_state.is_usable() {
                if let Some((id, future)) = self.issue_on_current(&request).await {
                    let result = self.await_pending(id, future, deadline, timeout).await;
                    match result {
                        Err(ClientError::TransportFailure(ref msg))
                            if class == RequestClass::ResourceOperation && policy == InterruptedRequestPolicy::QueueUntilRestored => {
                            debug!(?request, "transport failed with request in flight ({}) - re-issuing after restore", msg);
                        }
                        other => return other,
                    }
                }
            }

            match class {
                RequestClass::Teardown => {
                    debug!(?request, "connection is not usable - completing teardown locally");
                    return Ok(());
                }
                _ if policy == InterruptedRequestPolicy::FailFast => {
                    debug!(?request, "connection is interrupted - failing request");
                    return Err(ClientError::Interrupted);
                }
                _ => {}
            }

            trace!(?request, "connection is not usable - waiting for restore");
            let changed = match deadline {
                None => state.changed().await.is_ok(),
                Some(deadline) => match tokio::time::timeout_at(deadline, state.changed()).await {
                    Ok(r) => r.is_ok(),
                    Err(_) => return Err(ClientError::Timeout(timeout.unwrap_or_default())),
                },
            };
            if !changed {
                return Err(self.terminal_error(ConnectionState::Closed));
            }
        }
    }

    /// returns `None` if there is no usable transport
    async fn issue_on_current(&self, request: &Request) -> Option<(u64, OperationFuture)> {
        let current = self.current.read().await;
        let current = current.as_ref()?;
        if current.failed.load(Ordering::SeqCst) {
            return None;
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        trace!(?request, remote = %current.address, "issuing request");
        let future = current.transport.send(request.clone());
        self.pending.lock().insert(id, (current.generation, future.clone()));

        // NB: the transport may have failed after the check above, and its pending requests may
        //  have been failed before this one was registered
        if current.failed.load(Ordering::SeqCst) {
            future.fail(ClientError::TransportFailure(format!("connection to {} was lost", current.address)));
        }
        Some((id, future))
    }

    async fn await_pending(&self, id: u64, future: OperationFuture, deadline: Option<Instant>, timeout: Option<Duration>) -> Result<(), ClientError> {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let result = future.wait(remaining).await;
        self.pending.lock().remove(&id);

        match result {
            Err(ClientError::Timeout(_)) => Err(ClientError::Timeout(timeout.unwrap_or_default())),
            other => other,
        }
    }

    fn fail_pending(&self, generation: Option<u64>, error: &ClientError) {
        let mut pending = self.pending.lock();
        let affected = pending.iter()
            .filter(|(_, (g, _))| generation.map(|generation| *g == generation).unwrap_or(true))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in affected {
            if let Some((_, future)) = pending.remove(&id) {
                future.fail(error.clone());
            }
        }
    }

    fn on_transport_failure(&self, generation: u64, error: ClientError) {
        let in_flight_error = match &error {
            ClientError::TransportFailure(_) => error.clone(),
            other => ClientError::TransportFailure(other.to_string()),
        };
        self.fail_pending(Some(generation), &in_flight_error);
        let _ = self.failure_sender.send((generation, error));
    }

    fn on_inbound_message(&self, generation: u64, envelope: MessageEnvelope) {
        if generation != self.active_generation.load(Ordering::SeqCst) {
            trace!(delivery_id = envelope.delivery_id, "dropping message from stale transport");
            return;
        }
        match self.handler() {
            Some(h) => h.on_inbound_message(envelope),
            None => debug!(delivery_id = envelope.delivery_id, "no connection handler - dropping message"),
        }
    }

    fn set_state(&self, new_state: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == new_state {
                return false;
            }
            debug!("connection state {:?} -> {:?}", state, new_state);
            *state = new_state;
            true
        })
    }

    fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    async fn wait_until_terminal(&self) {
        let mut state = self.state.subscribe();
        state.wait_for(|s| s.is_terminal()).await.ok();
    }

    pub async fn close(&self) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }
        info!("closing connection");

        self.teardown_current().await;
        self.fail_pending(None, &ClientError::illegal_state("The connection is closed"));

        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            // the driver exits on its own, but it may be blocked establishing a transport
            driver.abort();
        }
    }

    /// returns the address of the transport that was torn down
    async fn teardown_current(&self) -> Option<BrokerAddr> {
        let mut current = self.current.write().await;
        let c = current.take()?;

        c.failed.store(true, Ordering::SeqCst);
        self.fail_pending(Some(c.generation), &ClientError::TransportFailure(format!("connection to {} was lost", c.address)));
        c.transport.close().await;
        Some(c.address)
    }

    async fn run_driver(self: Arc<Self>, mut failures: mpsc::UnboundedReceiver<(u64, ClientError)>) {
        let mut cursor = 0usize;

        if let Err(e) = self.connect_loop(&mut cursor, false).await {
            self.fail_connection(e).await;
            return;
        }

        loop {
            let (generation, error) = select! {
                f = failures.recv() => match f {
                    Some(f) => f,
                    None => return,
                },
                _ = self.wait_until_terminal() => return,
            };

            if generation != self.active_generation.load(Ordering::SeqCst) {
                debug!("ignoring failure of stale transport: {}", error);
                continue;
            }

            warn!("transport failed: {}", error);
            let address = self.teardown_current().await;

            match &error {
                ClientError::Redirected { hostname, network_host, port } if self.config.follow_redirects => {
                    info!("following redirect to {} at {}:{}", hostname, network_host, port);
                    *self.pending_redirect.lock() = Some(BrokerAddr::new(network_host.clone(), *port));
                }
                e if e.is_remote_closure() => {
                    self.fail_connection(error).await;
                    return;
                }
                _ => {}
            }

            if !self.set_state(ConnectionState::Interrupted) {
                return;
            }
            for entry in self.registry.snapshot() {
                if let Some(hooks) = entry.hooks() {
                    hooks.on_connection_interrupted();
                }
            }
            if let Some(address) = address {
                self.events.send_event(ConnectionEvent::Interrupted(address));
            }

            if let Err(e) = self.connect_loop(&mut cursor, true).await {
                self.fail_connection(e).await;
                return;
            }
        }
    }

    /// Tries candidates until a transport was established (and the registry replayed on it if
    ///  `is_reconnect` is set), or until the attempt limit is reached.
    async fn connect_loop(&self, cursor: &mut usize, is_reconnect: bool) -> Result<(), ClientError> {
        let mut backoff = ReconnectBackoff::new(&self.config);
        let limit = self.config.attempt_limit(self.ever_connected.load(Ordering::SeqCst));
        let mut discovered = self.discovery.as_ref()
            .map(|d| d.subscribe());

        loop {
            let delay = backoff.next_delay();
            let is_first_connect = !is_reconnect && backoff.attempts() == 1;
            if !delay.is_zero() && !is_first_connect {
                trace!("waiting {:?} before next connection attempt", delay);
                self.sleep_between_attempts(delay, &mut discovered).await;
            }
            if self.is_closed() {
                return Err(self.terminal_error(self.state()));
            }

            let attempt = backoff.attempts();
            match self.next_candidate(cursor) {
                None => warn!(attempt, "no broker address available"),
                Some(address) => match self.attempt(address.clone(), is_reconnect).await {
                    Ok(()) => return Ok(()),
                    Err(ClientError::Redirected { hostname, network_host, port }) if self.config.follow_redirects => {
                        info!(%address, "redirected to {} at {}:{}", hostname, network_host, port);
                        *self.pending_redirect.lock() = Some(BrokerAddr::new(network_host, port));
                    }
                    Err(e) if e.is_remote_closure() => {
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(%address, attempt, "connection attempt failed: {}", e);
                    }
                },
            }

            if let Some(limit) = limit {
                if attempt >= limit {
                    error!("giving up after {} connection attempts", attempt);
                    return Err(ClientError::ReconnectExhausted { attempts: attempt });
                }
            }
        }
    }

    async fn sleep_between_attempts(&self, delay: Duration, discovered: &mut Option<broadcast::Receiver<BrokerAddr>>) {
        select! {
            _ = sleep(delay) => {}
            addr = Self::next_discovered(discovered) => {
                debug!("discovered {} - skipping rest of reconnect delay", addr);
            }
            _ = self.wait_until_terminal() => {}
        }
    }

    async fn next_discovered(discovered: &mut Option<broadcast::Receiver<BrokerAddr>>) -> BrokerAddr {
        let Some(receiver) = discovered else {
            return pending().await;
        };
        loop {
            match receiver.recv().await {
                Ok(addr) => return addr,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return pending().await,
            }
        }
    }

    fn next_candidate(&self, cursor: &mut usize) -> Option<BrokerAddr> {
        if let Some(redirect) = self.pending_redirect.lock().take() {
            return Some(redirect);
        }

        let discovered = self.discovery.as_ref()
            .map(|d| d.current_candidates())
            .unwrap_or_default();
        let candidates = if discovered.is_empty() {
            &self.config.static_addresses
        }
        else {
            &discovered
        };

        if candidates.is_empty() {
            return None;
        }
        let result = candidates[*cursor % candidates.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(result)
    }

    async fn attempt(&self, address: BrokerAddr, is_reconnect: bool) -> Result<(), ClientError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let failed = Arc::new(AtomicBool::new(false));
        let failure_signal = Arc::new(Notify::new());
        self.active_generation.store(generation, Ordering::SeqCst);

        let sink = Arc::new(TransportEventSink {
            generation,
            failed: failed.clone(),
            failure_signal: failure_signal.clone(),
            controller: self.myself.clone(),
        });

        info!(%address, "connecting");
        let connect_timeout = self.config.connect_timeout;
        let transport = match tokio::time::timeout(connect_timeout, self.factory.establish(address.clone(), connect_timeout, sink)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ClientError::Timeout(connect_timeout)),
        };

        if is_reconnect {
            self.set_state(ConnectionState::Recovering);
            // NB: replayed requests are not tracked as pending, so a transport failure has to
            //  abort the replay explicitly
            let replayed = select! {
                r = self.replay(transport.as_ref()) => r,
                _ = failure_signal.notified() => Err(ClientError::TransportFailure(format!("connection to {} was lost during replay", address))),
            };
            if let Err(e) = replayed {
                warn!(%address, "replaying resources failed: {}", e);
                failed.store(true, Ordering::SeqCst);
                transport.close().await;
                self.set_state(ConnectionState::Interrupted);
                return Err(e);
            }
        }

        {
            let mut current = self.current.write().await;
            if failed.load(Ordering::SeqCst) || self.is_closed() {
                drop(current);
                transport.close().await;
                return Err(ClientError::TransportFailure(format!("connection to {} was lost during setup", address)));
            }
            *current = Some(CurrentTransport {
                transport,
                address: address.clone(),
                generation,
                failed,
            });
        }
        self.ever_connected.store(true, Ordering::SeqCst);

        if is_reconnect {
            self.set_state(ConnectionState::Restored);
            for entry in self.registry.snapshot() {
                if let Some(hooks) = entry.hooks() {
                    hooks.on_connection_restored();
                }
            }
            info!(%address, "connection restored");
            self.events.send_event(ConnectionEvent::Restored(address));
        }
        else {
            info!(%address, "connection established");
            self.events.send_event(ConnectionEvent::Established(address));
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Recreates all resources that existed remotely, parents before children, and then restarts
    ///  those that were started. This is all-or-nothing: the first failure aborts the replay.
    async fn replay(&self, transport: &dyn Transport) -> Result<(), ClientError> {
        let plain: Arc<dyn RecoveryHooks> = Arc::new(PlainRecovery);
        let entries = self.registry.snapshot().into_iter()
            .filter(|e| e.state.is_replayable())
            .collect::<Vec<_>>();

        debug!("replaying {} resources", entries.len());
        for entry in &entries {
            trace!(resource = ?entry.id(), "recreating resource");
            let hooks = entry.hooks().unwrap_or_else(|| plain.clone());
            hooks.on_connection_recovery(transport, &entry.info, self.request_timeout).await?;
        }
        for entry in entries.iter().filter(|e| e.state == ResourceState::Started) {
            trace!(resource = ?entry.id(), "restarting resource");
            let hooks = entry.hooks().unwrap_or_else(|| plain.clone());
            hooks.on_connection_recovered(transport, &entry.info, self.request_timeout).await?;
        }
        Ok(())
    }

    async fn fail_connection(&self, error: ClientError) {
        if self.is_closed() {
            debug!("connection closed while connecting: {}", error);
            return;
        }
        error!("connection failed: {}", error);

        *self.failure.lock() = Some(error.clone());
        self.teardown_current().await;
        self.set_state(ConnectionState::Failed);
        self.fail_pending(None, &ClientError::illegal_state_caused_by("The connection has failed", Some(error.clone())));

        if let Some(handler) = self.handler() {
            handler.on_connection_failure(&error);
        }
        self.events.send_event(ConnectionEvent::Failure(error));
    }
}

/// The listener registered with a single transport. It reports at most one failure, and drops
///  everything once the transport failed.
struct TransportEventSink {
    generation: u64,
    failed: Arc<AtomicBool>,
    /// wakes an attempt that is still replaying on this transport
    failure_signal: Arc<Notify>,
    controller: Weak<FailoverController>,
}

impl TransportListener for TransportEventSink {
    fn on_inbound_message(&self, envelope: MessageEnvelope) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(controller) = self.controller.upgrade() {
            controller.on_inbound_message(self.generation, envelope);
        }
    }

    fn on_transport_failure(&self, error: ClientError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            debug!("ignoring repeated failure of transport: {}", error);
            return;
        }
        self.failure_signal.notify_one();
        if let Some(controller) = self.controller.upgrade() {
            controller.on_transport_failure(self.generation, error);
        }
    }
}
