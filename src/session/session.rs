use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::connection::Connection;
use crate::consumer::acknowledgement::{AckState, AckType, AcknowledgeMode};
use crate::consumer::dispatch_queue::QueueOrdering;
use crate::consumer::message_consumer::MessageConsumer;
use crate::consumer::message_envelope::MessageEnvelope;
use crate::error::ClientError;
use crate::failover::recovery_hooks::RecoveryHooks;
use crate::meta::resource_id::{ConsumerId, ProducerId, SessionId};
use crate::meta::resource_info::{ConsumerInfo, Destination, ProducerInfo, ResourceInfo, SessionInfo};
use crate::session::message_producer::MessageProducer;
use crate::session::session_executor::SessionExecutor;
use crate::session::transaction_context::TransactionContext;

/// A session groups consumers and producers, it is the unit of acknowledgement and of
///  transactions.
pub struct Session {
    info: Arc<ResourceInfo>,
    session_info: SessionInfo,
    connection: Arc<Connection>,

    consumers: Mutex<BTreeMap<ConsumerId, Arc<MessageConsumer>>>,
    producers: Mutex<BTreeMap<ProducerId, Arc<MessageProducer>>>,
    next_child_id: AtomicU64,

    executor: SessionExecutor,
    transaction: TransactionContext,
    /// messages handed to the application that are not consumed or released yet
    delivered: Mutex<Vec<Arc<MessageEnvelope>>>,

    started: AtomicBool,
    closed: AtomicBool,
    recovered: AtomicBool,
    failure_cause: Mutex<Option<ClientError>>,
    myself: Weak<Session>,
}

impl Session {
    pub(crate) fn new(connection: Arc<Connection>, session_info: SessionInfo) -> Arc<Session> {
        Arc::new_cyclic(|myself| Session {
            info: Arc::new(ResourceInfo::Session(session_info.clone())),
            session_info,
            connection,
            consumers: Default::default(),
            producers: Default::default(),
            next_child_id: AtomicU64::new(1),
            executor: SessionExecutor::new(),
            transaction: TransactionContext::new(),
            delivered: Default::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            failure_cause: Default::default(),
            myself: myself.clone(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.session_info.id
    }

    pub(crate) fn resource_info(&self) -> Arc<ResourceInfo> {
        self.info.clone()
    }

    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.session_info.acknowledge_mode
    }

    pub fn is_transacted(&self) -> bool {
        self.session_info.acknowledge_mode.is_transacted()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn executor(&self) -> &SessionExecutor {
        &self.executor
    }

    pub(crate) fn transaction_context(&self) -> &TransactionContext {
        &self.transaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_recovered(&self) {
        self.recovered.store(false, Ordering::SeqCst);
    }

    fn check_closed(&self) -> Result<(), ClientError> {
        if !self.is_closed() {
            return Ok(());
        }
        match self.failure_cause.lock().clone() {
            Some(cause) => Err(ClientError::illegal_state_caused_by("The Session was closed due to an unrecoverable error.", Some(cause))),
            None => Err(ClientError::illegal_state("The Session is closed")),
        }
    }

    fn next_child_id(&self) -> u64 {
        self.next_child_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<MessageConsumer>> {
        self.consumers.lock().get(&id).cloned()
    }

    pub fn consumers(&self) -> Vec<Arc<MessageConsumer>> {
        self.consumers.lock().values().cloned().collect()
    }

    pub fn producers(&self) -> Vec<Arc<MessageProducer>> {
        self.producers.lock().values().cloned().collect()
    }

    pub async fn create_consumer(&self, destination: Destination, selector: Option<String>, no_local: bool) -> Result<Arc<MessageConsumer>, ClientError> {
        self.add_consumer(destination, selector, no_local, None, false).await
    }

    /// durable subscriptions survive the consumer, they are identified by their name
    pub async fn create_durable_subscriber(&self, topic: Destination, subscription_name: impl Into<String>, selector: Option<String>, no_local: bool) -> Result<Arc<MessageConsumer>, ClientError> {
        if !topic.is_topic() {
            return Err(ClientError::InvalidConfiguration(format!("durable subscriptions require a topic, not {:?}", topic)));
        }
        let subscription_name = subscription_name.into();
        if subscription_name.trim().is_empty() {
            return Err(ClientError::InvalidConfiguration("subscription name must not be blank".to_string()));
        }
        self.add_consumer(topic, selector, no_local, Some(subscription_name), false).await
    }

    /// A browser looks at a queue's messages without consuming them
    pub async fn create_browser(&self, queue: Destination, selector: Option<String>) -> Result<Arc<MessageConsumer>, ClientError> {
        if queue.is_topic() {
            return Err(ClientError::InvalidConfiguration(format!("only queues can be browsed, not {:?}", queue)));
        }
        self.add_consumer(queue, selector, false, None, true).await
    }

    async fn add_consumer(&self, destination: Destination, selector: Option<String>, no_local: bool, subscription_name: Option<String>, browser: bool) -> Result<Arc<MessageConsumer>, ClientError> {
        self.check_closed()?;
        let Some(me) = self.myself.upgrade() else {
            return Err(ClientError::illegal_state("The Session is closed"));
        };

        let config = self.connection.config();
        let prefetch_size = config.prefetch.prefetch_for(&destination, subscription_name.is_some(), browser);
        let ordering = if config.local_message_priority {
            QueueOrdering::Priority
        }
        else {
            QueueOrdering::Fifo
        };

        let consumer_info = ConsumerInfo {
            id: ConsumerId {
                session: self.id(),
                value: self.next_child_id(),
            },
            destination,
            selector,
            no_local,
            prefetch_size,
            acknowledge_mode: self.acknowledge_mode(),
            subscription_name,
            browser,
        };
        let consumer = MessageConsumer::new(me, consumer_info, ordering);
        let id = consumer.id();
        debug!(consumer = ?id, destination = ?consumer.destination(), prefetch_size, "creating consumer");

        let hooks: Arc<dyn RecoveryHooks> = consumer.clone();
        self.connection.register_resource(consumer.resource_info(), Some(Arc::downgrade(&hooks)))?;
        self.consumers.lock().insert(id, consumer.clone());

        let created = async {
            self.connection.create_resource(consumer.resource_info()).await?;
            self.connection.start_resource(id.into()).await
        }.await;
        if let Err(e) = created {
            warn!(consumer = ?id, "creating consumer failed: {}", e);
            consumer.shutdown(None);
            self.consumers.lock().remove(&id);
            self.connection.unregister_resource(id.into());
            return Err(e);
        }

        if self.is_started() {
            consumer.start();
        }
        Ok(consumer)
    }

    /// `None` creates an anonymous producer that names the destination for every message
    pub async fn create_producer(&self, destination: Option<Destination>) -> Result<Arc<MessageProducer>, ClientError> {
        self.check_closed()?;
        let Some(me) = self.myself.upgrade() else {
            return Err(ClientError::illegal_state("The Session is closed"));
        };

        let producer_info = ProducerInfo {
            id: ProducerId {
                session: self.id(),
                value: self.next_child_id(),
            },
            destination,
        };
        let producer = MessageProducer::new(me, producer_info);
        let id = producer.id();
        debug!(producer = ?id, "creating producer");

        self.connection.register_resource(producer.resource_info(), None)?;
        self.producers.lock().insert(id, producer.clone());

        if let Err(e) = self.connection.create_resource(producer.resource_info()).await {
            warn!(producer = ?id, "creating producer failed: {}", e);
            producer.shutdown(None);
            self.producers.lock().remove(&id);
            self.connection.unregister_resource(id.into());
            return Err(e);
        }
        Ok(producer)
    }

    pub(crate) fn remove_consumer(&self, id: ConsumerId) {
        self.consumers.lock().remove(&id);
    }

    pub(crate) fn remove_producer(&self, id: ProducerId) {
        self.producers.lock().remove(&id);
    }

    pub fn start(&self) {
        if self.is_closed() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for consumer in self.consumers() {
            consumer.start();
        }
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for consumer in self.consumers() {
            consumer.stop();
        }
    }

    pub(crate) fn on_inbound(&self, envelope: MessageEnvelope) {
        match self.consumer(envelope.consumer) {
            Some(consumer) => consumer.on_inbound(envelope),
            None => debug!(consumer = ?envelope.consumer, delivery_id = envelope.delivery_id, "dropping message for unknown consumer"),
        }
    }

    /// Acknowledges a single delivery. Every envelope reaches each ack state at most once, so
    ///  repeated acknowledgements are suppressed locally.
    ///
    /// If the ack times out, its local effects are undone so that acknowledging again sends it
    ///  again.
    pub(crate) async fn acknowledge(&self, envelope: &Arc<MessageEnvelope>, ack_type: AckType) -> Result<(), ClientError> {
        let Some(previous) = envelope.ack.try_advance(ack_type) else {
            debug!(delivery_id = envelope.delivery_id, ?ack_type, state = ?envelope.ack.state(), "suppressing redundant acknowledgement");
            return Ok(());
        };
        self.track_delivered(envelope, ack_type);

        let result = self.send_acknowledgement(envelope, ack_type).await;
        if let Err(e) = &result {
            if e.is_timeout() && envelope.ack.revert(ack_type, previous) {
                debug!(delivery_id = envelope.delivery_id, ?ack_type, "acknowledgement timed out - reverting local state");
                self.untrack_delivered(envelope, ack_type, previous);
            }
        }
        result
    }

    async fn send_acknowledgement(&self, envelope: &MessageEnvelope, ack_type: AckType) -> Result<(), ClientError> {
        if self.is_transacted() && ack_type == AckType::Consumed {
            self.ensure_transaction().await?;
        }
        self.connection.acknowledge(envelope.consumer, envelope.delivery_id, ack_type).await
    }

    fn track_delivered(&self, envelope: &Arc<MessageEnvelope>, ack_type: AckType) {
        let mut delivered = self.delivered.lock();
        match ack_type {
            AckType::Delivered => delivered.push(envelope.clone()),
            AckType::Consumed | AckType::Released => delivered.retain(|e| !Arc::ptr_eq(e, envelope)),
        }
    }

    fn untrack_delivered(&self, envelope: &Arc<MessageEnvelope>, ack_type: AckType, previous: AckState) {
        let mut delivered = self.delivered.lock();
        match ack_type {
            AckType::Delivered => delivered.retain(|e| !Arc::ptr_eq(e, envelope)),
            AckType::Consumed | AckType::Released => {
                if previous == AckState::Delivered && !delivered.iter().any(|e| Arc::ptr_eq(e, envelope)) {
                    delivered.push(envelope.clone());
                }
            }
        }
    }

    /// consumes everything that was delivered so far
    pub(crate) async fn acknowledge_delivered(&self) -> Result<(), ClientError> {
        let delivered = self.delivered.lock().clone();
        for envelope in delivered {
            self.acknowledge(&envelope, AckType::Consumed).await?;
        }
        Ok(())
    }

    pub(crate) async fn ensure_transaction(&self) -> Result<(), ClientError> {
        if self.transaction.begin() {
            debug!(session = ?self.id(), "beginning transaction");
            if let Err(e) = self.connection.begin(self.id()).await {
                self.transaction.mark_failed();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Releases all messages that were delivered but not acknowledged, so the broker redelivers
    ///  them. Delivery is paused while this happens.
    pub async fn recover(&self) -> Result<(), ClientError> {
        self.check_closed()?;
        if self.is_transacted() {
            return Err(ClientError::illegal_state("Cannot call recover() on a transacted session"));
        }

        let was_started = self.is_started();
        self.stop();
        self.recovered.store(true, Ordering::SeqCst);

        let delivered = std::mem::take(&mut *self.delivered.lock());
        debug!(session = ?self.id(), "recovering {} delivered messages", delivered.len());
        let mut result = Ok(());
        for envelope in delivered {
            if let Err(e) = self.acknowledge(&envelope, AckType::Released).await {
                result = Err(e);
            }
        }

        if was_started {
            self.start();
        }
        result
    }

    pub async fn commit(&self) -> Result<(), ClientError> {
        self.check_closed()?;
        if !self.is_transacted() {
            return Err(ClientError::illegal_state("Not a transacted session"));
        }

        if self.transaction.is_failed() {
            self.rollback_internal().await;
            return Err(ClientError::TransactionRolledBack("the transaction was rolled back because the connection was interrupted".to_string()));
        }
        if !self.transaction.in_transaction() {
            debug!(session = ?self.id(), "commit without open transaction");
            return Ok(());
        }

        debug!(session = ?self.id(), "committing transaction");
        if let Err(e) = self.connection.commit(self.id()).await {
            warn!(session = ?self.id(), "commit failed, rolling back: {}", e);
            self.rollback_internal().await;
            return Err(ClientError::TransactionRolledBack(e.to_string()));
        }

        let completion = self.transaction.complete();
        self.delivered.lock().clear();
        for consumer in self.consumers() {
            consumer.on_transaction_committed();
        }
        for sync in completion.synchronizations {
            sync.after_commit().await;
        }
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), ClientError> {
        self.check_closed()?;
        if !self.is_transacted() {
            return Err(ClientError::illegal_state("Not a transacted session"));
        }
        self.rollback_internal().await;
        Ok(())
    }

    /// Rolls back the open transaction (if any). The session's consumers are stopped while this
    ///  happens, so messages that are redelivered after the rollback arrive in order.
    async fn rollback_internal(&self) {
        let open_consumers = self.consumers().into_iter()
            .filter(|c| !c.is_closed())
            .collect::<Vec<_>>();

        for consumer in &open_consumers {
            if let Err(e) = consumer.suspend_for_rollback().await {
                debug!(consumer = ?consumer.id(), "stopping consumer for rollback failed: {}", e);
            }
        }

        let completion = self.transaction.complete();
        self.delivered.lock().clear();
        if completion.was_in_transaction && !completion.failed {
            debug!(session = ?self.id(), "rolling back transaction");
            if let Err(e) = self.connection.rollback(self.id()).await {
                warn!(session = ?self.id(), "rollback failed: {}", e);
            }
        }
        for sync in completion.synchronizations {
            sync.after_rollback().await;
        }

        for consumer in &open_consumers {
            if let Err(e) = consumer.resume_after_rollback().await {
                debug!(consumer = ?consumer.id(), "restarting consumer after rollback failed: {}", e);
            }
        }
    }

    /// Closing a transacted session rolls back its open transaction.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!(session = ?self.id(), "closing session");

        if self.is_transacted() && self.transaction.in_transaction() {
            self.rollback_internal().await;
        }
        self.shutdown(None);
        self.connection.remove_session(self.id());
        self.connection.destroy_resource(self.id().into()).await
    }

    /// Local teardown of the session and all its children, without any remote interaction
    pub(crate) fn shutdown(&self, cause: Option<ClientError>) {
        if let Some(cause) = &cause {
            self.failure_cause.lock().get_or_insert(cause.clone());
        }
        self.closed.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.values() {
            consumer.shutdown(cause.clone());
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers.values() {
            producer.shutdown(cause.clone());
        }
        self.executor.shutdown();
        self.delivered.lock().clear();
    }
}

impl RecoveryHooks for Session {
    fn on_connection_interrupted(&self) {
        // acknowledgements for these can not reach the broker anymore, it redelivers them
        self.delivered.lock().clear();
        self.transaction.mark_failed();
    }
}
