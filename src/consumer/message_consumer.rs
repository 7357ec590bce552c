use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::consumer::acknowledgement::{AckType, AcknowledgeMode};
use crate::consumer::dispatch_queue::{DispatchQueue, QueueOrdering, ReceiveTimeout};
use crate::consumer::message_envelope::MessageEnvelope;
use crate::consumer::received_message::ReceivedMessage;
use crate::error::ClientError;
use crate::failover::recovery_hooks::RecoveryHooks;
use crate::meta::resource_id::ConsumerId;
use crate::meta::resource_info::{ConsumerInfo, Destination, ResourceInfo};
use crate::session::session::Session;
use crate::session::transaction_context::{TransactionContext, TxSynchronization};

/// Asynchronous message delivery. Listeners of a session are called one at a time, an `Err` (or a
///  panic) is reported to the connection's listeners as an async exception.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: ReceivedMessage) -> anyhow::Result<()>;
}

/// Notification that a message arrived for a consumer without a [MessageListener]. This is called
///  on the I/O path, so it must not block.
pub trait MessageAvailableListener: Send + Sync + 'static {
    fn on_message_available(&self, consumer: ConsumerId);
}

pub struct MessageConsumer {
    info: Arc<ResourceInfo>,
    consumer_info: ConsumerInfo,
    session: Arc<Session>,
    queue: DispatchQueue,

    listener: Mutex<Option<Arc<dyn MessageListener>>>,
    available_listener: Mutex<Option<Arc<dyn MessageAvailableListener>>>,

    started: AtomicBool,
    closed: AtomicBool,
    torn_down: AtomicBool,
    /// something was received as part of the session's current transaction
    delivered_in_transaction: AtomicBool,
    failure_cause: Mutex<Option<ClientError>>,
    myself: Weak<MessageConsumer>,
}

impl MessageConsumer {
    pub(crate) fn new(session: Arc<Session>, consumer_info: ConsumerInfo, ordering: QueueOrdering) -> Arc<MessageConsumer> {
        Arc::new_cyclic(|myself| MessageConsumer {
            info: Arc::new(ResourceInfo::Consumer(consumer_info.clone())),
            consumer_info,
            session,
            queue: DispatchQueue::new(ordering),
            listener: Default::default(),
            available_listener: Default::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            delivered_in_transaction: AtomicBool::new(false),
            failure_cause: Default::default(),
            myself: myself.clone(),
        })
    }

    pub fn id(&self) -> ConsumerId {
        self.consumer_info.id
    }

    pub fn info(&self) -> &ConsumerInfo {
        &self.consumer_info
    }

    pub(crate) fn resource_info(&self) -> Arc<ResourceInfo> {
        self.info.clone()
    }

    pub fn destination(&self) -> &Destination {
        &self.consumer_info.destination
    }

    pub fn selector(&self) -> Option<&str> {
        self.consumer_info.selector.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.consumer_info.subscription_name.is_some()
    }

    pub fn is_browser(&self) -> bool {
        self.consumer_info.browser
    }

    pub fn prefetch_size(&self) -> u32 {
        self.consumer_info.prefetch_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// number of messages that arrived but were not handed to the application yet
    pub fn num_buffered(&self) -> usize {
        self.queue.len()
    }

    /// consumers that do not prefetch ask the broker for every single message
    fn pulls_explicitly(&self) -> bool {
        self.consumer_info.prefetch_size == 0 || self.consumer_info.browser
    }

    fn check_closed(&self) -> Result<(), ClientError> {
        if !self.is_closed() {
            return Ok(());
        }
        match self.failure_cause.lock().clone() {
            Some(cause) => Err(ClientError::illegal_state_caused_by("The MessageConsumer was closed due to an unrecoverable error.", Some(cause))),
            None => Err(ClientError::illegal_state("The MessageConsumer is closed")),
        }
    }

    /// Waits for the next message. Returns `None` if the timeout expires, or if the consumer is
    ///  stopped or closed while waiting.
    pub async fn receive(&self, timeout: ReceiveTimeout) -> Result<Option<ReceivedMessage>, ClientError> {
        self.check_closed()?;
        if self.listener.lock().is_some() {
            return Err(ClientError::illegal_state("Cannot synchronously receive a message when a MessageListener is set"));
        }

        if self.pulls_explicitly() && self.queue.is_empty() && self.queue.is_running() {
            trace!(consumer = ?self.id(), ?timeout, "pulling message");
            self.session.connection().pull(self.id(), timeout).await?;
        }

        let envelope = match timeout {
            ReceiveTimeout::NoWait => self.queue.dequeue_no_wait(),
            ReceiveTimeout::Forever => self.queue.dequeue(None).await,
            ReceiveTimeout::After(d) => self.queue.dequeue(Some(d)).await,
        };
        let Some(envelope) = envelope else {
            return Ok(None);
        };

        if let Err(e) = self.ack_from_receive(&envelope).await {
            if !e.is_recoverable() {
                return Err(e);
            }
            // the delivery died with the transport, the broker redelivers it
            debug!(consumer = ?self.id(), delivery_id = envelope.delivery_id, "acknowledging received message failed: {}", e);
        }
        Ok(Some(ReceivedMessage::new(&envelope, self.session.clone())))
    }

    pub async fn receive_no_wait(&self) -> Result<Option<ReceivedMessage>, ClientError> {
        self.receive(ReceiveTimeout::NoWait).await
    }

    async fn ack_from_receive(&self, envelope: &Arc<MessageEnvelope>) -> Result<(), ClientError> {
        if self.consumer_info.browser {
            return Ok(());
        }
        match self.session.acknowledge_mode() {
            AcknowledgeMode::Client => self.session.acknowledge(envelope, AckType::Delivered).await,
            AcknowledgeMode::Transacted => {
                self.delivered_in_transaction.store(true, Ordering::SeqCst);
                self.session.acknowledge(envelope, AckType::Consumed).await
            }
            AcknowledgeMode::Auto | AcknowledgeMode::DupsOk => self.session.acknowledge(envelope, AckType::Consumed).await,
        }
    }

    /// Setting a listener switches the consumer to asynchronous delivery, `None` switches back.
    ///  Consumers that do not prefetch can not have a listener.
    pub fn set_message_listener(&self, listener: Option<Arc<dyn MessageListener>>) -> Result<(), ClientError> {
        self.check_closed()?;
        if listener.is_some() && self.consumer_info.prefetch_size == 0 {
            return Err(ClientError::illegal_state("Cannot set MessageListener - Consumer is configured with prefetch of zero"));
        }

        let has_listener = listener.is_some();
        *self.listener.lock() = listener;
        if has_listener {
            self.schedule_delivery();
        }
        Ok(())
    }

    pub fn message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener.lock().clone()
    }

    pub fn set_available_listener(&self, listener: Option<Arc<dyn MessageAvailableListener>>) {
        *self.available_listener.lock() = listener;
    }

    pub fn start(&self) {
        if self.is_closed() {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        self.queue.start();
        self.schedule_delivery();
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.queue.stop();
    }

    pub(crate) fn on_inbound(&self, envelope: MessageEnvelope) {
        let enqueue_first = envelope.enqueue_first;
        let delivery_id = envelope.delivery_id;
        let envelope = Arc::new(envelope);

        let accepted = if enqueue_first {
            self.queue.enqueue_first(envelope)
        }
        else {
            self.queue.enqueue(envelope)
        };
        if !accepted {
            debug!(consumer = ?self.id(), delivery_id, "dropping message for closed consumer");
            return;
        }

        if self.listener.lock().is_some() {
            self.schedule_delivery();
            return;
        }
        let available = self.available_listener.lock().clone();
        if let Some(available) = available {
            available.on_message_available(self.id());
        }
    }

    fn schedule_delivery(&self) {
        if !self.is_started() || self.listener.lock().is_none() || self.queue.is_empty() {
            return;
        }
        if let Some(me) = self.myself.upgrade() {
            self.session.executor().execute(me.deliver_pending());
        }
    }

    async fn deliver_pending(self: Arc<Self>) {
        loop {
            if !self.session.is_started() || !self.is_started() {
                return;
            }
            let Some(listener) = self.listener.lock().clone() else {
                return;
            };
            let Some(envelope) = self.queue.dequeue_no_wait() else {
                return;
            };

            let auto_ack = self.session.acknowledge_mode().is_auto_or_dups_ok();
            let ack_result = if auto_ack {
                self.session.acknowledge(&envelope, AckType::Delivered).await
            }
            else {
                self.ack_from_receive(&envelope).await
            };
            if let Err(e) = ack_result {
                debug!(consumer = ?self.id(), delivery_id = envelope.delivery_id, "acknowledging delivery failed: {}", e);
            }

            self.session.clear_recovered();
            let message = ReceivedMessage::new(&envelope, self.session.clone());
            let outcome = tokio::spawn(async move { listener.on_message(message).await }).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(consumer = ?self.id(), delivery_id = envelope.delivery_id, "message listener failed: {:#}", e);
                    self.session.connection().on_async_exception(ClientError::from(e));
                }
                Err(e) => {
                    warn!(consumer = ?self.id(), delivery_id = envelope.delivery_id, "message listener panicked: {}", e);
                    self.session.connection().on_async_exception(ClientError::Listener(format!("listener panicked: {}", e)));
                }
            }

            if auto_ack && !self.session.is_recovered() {
                if let Err(e) = self.session.acknowledge(&envelope, AckType::Consumed).await {
                    debug!(consumer = ?self.id(), delivery_id = envelope.delivery_id, "acknowledging consumed message failed: {}", e);
                }
            }
        }
    }

    /// Closes the consumer. If it received messages as part of an open transaction, it stays
    ///  registered with the broker until that transaction completes, but is closed for the
    ///  application right away.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Ok(());
        }

        if let Some(me) = self.myself.upgrade() {
            let deferred = Arc::new(DeferredClose {
                consumer: Arc::downgrade(&me),
            });
            if self.session.transaction_context().register_synchronization(deferred) {
                debug!(consumer = ?self.id(), "deferring close until the transaction completes");
                self.closed.store(true, Ordering::SeqCst);
                self.stop();
                self.listener.lock().take();
                return Ok(());
            }
        }

        self.do_close().await
    }

    async fn do_close(&self) -> Result<(), ClientError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(consumer = ?self.id(), "closing consumer");
        self.shutdown(None);
        self.session.remove_consumer(self.id());
        self.session.connection().destroy_resource(self.id().into()).await
    }

    /// Local teardown, without any remote interaction
    pub(crate) fn shutdown(&self, cause: Option<ClientError>) {
        if let Some(cause) = cause {
            self.failure_cause.lock().get_or_insert(cause);
        }
        self.closed.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.queue.close();
        self.listener.lock().take();
        self.available_listener.lock().take();
    }

    pub(crate) async fn suspend_for_rollback(&self) -> Result<(), ClientError> {
        self.stop();
        self.session.connection().stop_resource(self.id().into()).await
    }

    /// Gives everything that is still buffered back to the broker, and then resumes delivery.
    ///  The broker redelivers both the buffered messages and those consumed in the rolled back
    ///  transaction.
    pub(crate) async fn resume_after_rollback(&self) -> Result<(), ClientError> {
        self.delivered_in_transaction.store(false, Ordering::SeqCst);

        for envelope in self.queue.remove_all() {
            if let Err(e) = self.session.acknowledge(&envelope, AckType::Released).await {
                debug!(consumer = ?self.id(), delivery_id = envelope.delivery_id, "releasing buffered message failed: {}", e);
            }
        }

        if self.session.is_started() {
            self.start();
        }
        self.session.connection().start_resource(self.id().into()).await
    }

    pub(crate) fn on_transaction_committed(&self) {
        self.delivered_in_transaction.store(false, Ordering::SeqCst);
    }
}

impl RecoveryHooks for MessageConsumer {
    fn on_connection_interrupted(&self) {
        // buffered deliveries belong to the lost transport, the broker redelivers them
        let num_dropped = self.queue.len();
        self.queue.clear();
        if num_dropped > 0 {
            debug!(consumer = ?self.id(), "dropped {} buffered messages due to connection interruption", num_dropped);
        }
    }
}

struct DeferredClose {
    consumer: Weak<MessageConsumer>,
}

#[async_trait]
impl TxSynchronization for DeferredClose {
    fn validate(&self, _context: &TransactionContext) -> bool {
        match self.consumer.upgrade() {
            Some(consumer) => consumer.session.acknowledge_mode().is_transacted()
                && consumer.delivered_in_transaction.load(Ordering::SeqCst),
            None => false,
        }
    }

    async fn after_commit(&self) {
        self.close_consumer().await;
    }

    async fn after_rollback(&self) {
        self.close_consumer().await;
    }
}

impl DeferredClose {
    async fn close_consumer(&self) {
        if let Some(consumer) = self.consumer.upgrade() {
            if let Err(e) = consumer.do_close().await {
                debug!(consumer = ?consumer.id(), "deferred close failed: {}", e);
            }
        }
    }
}
