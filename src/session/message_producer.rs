use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::consumer::message_envelope::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::error::ClientError;
use crate::meta::resource_id::ProducerId;
use crate::meta::resource_info::{Destination, ProducerInfo, ResourceInfo};
use crate::session::session::Session;

pub struct MessageProducer {
    info: Arc<ResourceInfo>,
    producer_info: ProducerInfo,
    session: Weak<Session>,
    closed: AtomicBool,
    failure_cause: Mutex<Option<ClientError>>,
}

impl MessageProducer {
    pub(crate) fn new(session: Arc<Session>, producer_info: ProducerInfo) -> Arc<MessageProducer> {
        Arc::new(MessageProducer {
            info: Arc::new(ResourceInfo::Producer(producer_info.clone())),
            producer_info,
            session: Arc::downgrade(&session),
            closed: AtomicBool::new(false),
            failure_cause: Default::default(),
        })
    }

    pub fn id(&self) -> ProducerId {
        self.producer_info.id
    }

    pub(crate) fn resource_info(&self) -> Arc<ResourceInfo> {
        self.info.clone()
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.producer_info.destination.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_closed(&self) -> Result<Arc<Session>, ClientError> {
        if self.is_closed() {
            return match self.failure_cause.lock().clone() {
                Some(cause) => Err(ClientError::illegal_state_caused_by("The MessageProducer was closed due to an unrecoverable error.", Some(cause))),
                None => Err(ClientError::illegal_state("The MessageProducer is closed")),
            };
        }
        self.session.upgrade()
            .ok_or_else(|| ClientError::illegal_state("The MessageProducer is closed"))
    }

    /// Sends to the producer's destination. `None` sends with the default priority, priorities
    ///  above the maximum are capped.
    pub async fn send(&self, payload: Bytes, priority: Option<u8>) -> Result<(), ClientError> {
        let Some(destination) = self.producer_info.destination.clone() else {
            return Err(ClientError::illegal_state("An anonymous producer requires a destination for every message"));
        };
        self.do_send(destination, payload, priority).await
    }

    /// for anonymous producers
    pub async fn send_to(&self, destination: Destination, payload: Bytes, priority: Option<u8>) -> Result<(), ClientError> {
        if let Some(own) = &self.producer_info.destination {
            if *own != destination {
                return Err(ClientError::illegal_state(format!("This producer sends to {:?} only", own)));
            }
        }
        self.do_send(destination, payload, priority).await
    }

    async fn do_send(&self, destination: Destination, payload: Bytes, priority: Option<u8>) -> Result<(), ClientError> {
        let session = self.check_closed()?;
        let priority = priority.unwrap_or(DEFAULT_PRIORITY).min(MAX_PRIORITY);

        if session.is_transacted() {
            session.ensure_transaction().await?;
        }
        trace!(producer = ?self.id(), ?destination, priority, "sending message");
        session.connection().send(self.id(), destination, payload, priority).await
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(producer = ?self.id(), "closing producer");
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        session.remove_producer(self.id());
        session.connection().destroy_resource(self.id().into()).await
    }

    pub(crate) fn shutdown(&self, cause: Option<ClientError>) {
        if let Some(cause) = cause {
            self.failure_cause.lock().get_or_insert(cause);
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use crate::consumer::acknowledgement::AcknowledgeMode;
    use crate::provider::request::Request;
    use crate::test_util::connection::{connect_tracked, eventually, test_config};
    use crate::test_util::transport::AttemptScript;

    #[rstest]
    #[case::default(None, DEFAULT_PRIORITY)]
    #[case::explicit(Some(7), 7)]
    #[case::capped(Some(200), MAX_PRIORITY)]
    #[tokio::test(start_paused = true)]
    async fn test_send_priority(#[case] priority: Option<u8>, #[case] expected: u8) {
        let (connection, factory) = connect_tracked(test_config()).await;
        let session = connection.create_session(AcknowledgeMode::Auto).await.unwrap();
        let producer = session.create_producer(Some(Destination::queue("q"))).await.unwrap();
        let transport = factory.latest().unwrap();
        transport.clear_requests();

        producer.send(Bytes::from_static(b"hello"), priority).await.unwrap();
        assert_eq!(transport.requests(), vec![Request::Send {
            producer: producer.id(),
            destination: Destination::queue("q"),
            payload: Bytes::from_static(b"hello"),
            priority: expected,
        }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_producer() {
        let (connection, factory) = connect_tracked(test_config()).await;
        let session = connection.create_session(AcknowledgeMode::Auto).await.unwrap();
        let producer = session.create_producer(None).await.unwrap();
        let transport = factory.latest().unwrap();
        transport.clear_requests();

        assert!(matches!(producer.send(Bytes::from_static(b"x"), None).await, Err(ClientError::IllegalState { .. })));
        producer.send_to(Destination::topic("t"), Bytes::from_static(b"x"), None).await.unwrap();
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_interrupted_fails_fast() {
        let (connection, factory) = connect_tracked(test_config()).await;
        let session = connection.create_session(AcknowledgeMode::Auto).await.unwrap();
        let producer = session.create_producer(Some(Destination::queue("q"))).await.unwrap();

        for _ in 0..3 {
            factory.push_script(AttemptScript::Refuse(ClientError::TransportFailure("refused".to_string())));
        }
        factory.latest().unwrap().simulate_failure(ClientError::TransportFailure("reset".to_string()));
        eventually(|| !connection.is_connected()).await;

        assert_eq!(producer.send(Bytes::from_static(b"x"), None).await, Err(ClientError::Interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let (connection, factory) = connect_tracked(test_config()).await;
        let session = connection.create_session(AcknowledgeMode::Auto).await.unwrap();
        let producer = session.create_producer(Some(Destination::queue("q"))).await.unwrap();
        let transport = factory.latest().unwrap();
        transport.clear_requests();

        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert_eq!(transport.requests(), vec![Request::Destroy(producer.id().into())]);
        assert!(session.producers().is_empty());
        assert_eq!(producer.send(Bytes::from_static(b"x"), None).await, Err(ClientError::illegal_state("The MessageProducer is closed")));
    }
}
