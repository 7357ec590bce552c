use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::consumer::acknowledgement::AcknowledgeMode;
use crate::consumer::message_envelope::MessageEnvelope;
use crate::error::ClientError;
use crate::meta::resource_id::ConsumerId;
use crate::session::session::Session;

/// A message as handed to the application. It is a copy of the underlying envelope, so the
///  application can hold on to it without affecting delivery state.
#[derive(Clone)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub delivery_id: u64,
    pub priority: u8,
    pub redelivered: bool,
    pub consumer: ConsumerId,
    session: Arc<Session>,
}

impl Debug for ReceivedMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("consumer", &self.consumer)
            .field("delivery_id", &self.delivery_id)
            .field("priority", &self.priority)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl ReceivedMessage {
    pub(crate) fn new(envelope: &MessageEnvelope, session: Arc<Session>) -> ReceivedMessage {
        ReceivedMessage {
            payload: envelope.payload.clone(),
            delivery_id: envelope.delivery_id,
            priority: envelope.priority(),
            redelivered: envelope.redelivered,
            consumer: envelope.consumer,
            session,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// In client acknowledge mode, this acknowledges every message the session delivered so far
    ///  - not just this one. In other modes this is a no-op.
    pub async fn acknowledge(&self) -> Result<(), ClientError> {
        if self.session.is_closed() {
            return Err(ClientError::illegal_state("Session closed"));
        }
        if self.session.acknowledge_mode() != AcknowledgeMode::Client {
            return Ok(());
        }
        self.session.acknowledge_delivered().await
    }
}
