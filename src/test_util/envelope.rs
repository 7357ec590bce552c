use bytes::Bytes;
use uuid::Uuid;

use crate::consumer::message_envelope::MessageEnvelope;
use crate::meta::resource_id::{ConnectionId, ConsumerId, SessionId};

pub fn test_connection_id() -> ConnectionId {
    ConnectionId(Uuid::nil())
}

pub fn test_consumer_id() -> ConsumerId {
    ConsumerId {
        session: SessionId {
            connection: test_connection_id(),
            value: 1,
        },
        value: 1,
    }
}

/// an envelope for [test_consumer_id] with a payload derived from the delivery id
pub fn envelope(delivery_id: u64) -> MessageEnvelope {
    envelope_for(test_consumer_id(), delivery_id)
}

pub fn envelope_for(consumer: ConsumerId, delivery_id: u64) -> MessageEnvelope {
    MessageEnvelope::new(consumer, delivery_id, payload(delivery_id))
}

pub fn payload(delivery_id: u64) -> Bytes {
    Bytes::from(format!("message {}", delivery_id))
}
