use bytes::Bytes;

use crate::consumer::acknowledgement::AckRecord;
use crate::meta::resource_id::ConsumerId;

pub const MAX_PRIORITY: u8 = 9;
pub const DEFAULT_PRIORITY: u8 = 4;

/// An inbound message as handed over by the transport, together with its local delivery state.
///
/// Envelopes are shared as `Arc<MessageEnvelope>` between the dispatch queue, the session's
///  delivered-unacknowledged list and in-flight acks. The application never sees the envelope
///  itself, only a [crate::consumer::received_message::ReceivedMessage] copy.
#[derive(Debug)]
pub struct MessageEnvelope {
    /// opaque token identifying the delivery in acknowledgements
    pub delivery_id: u64,
    pub consumer: ConsumerId,
    pub payload: Bytes,
    pub priority: u8,
    /// redeliveries are put at the head of the consumer's queue
    pub enqueue_first: bool,
    pub redelivered: bool,
    pub ack: AckRecord,
}

impl MessageEnvelope {
    pub fn new(consumer: ConsumerId, delivery_id: u64, payload: Bytes) -> MessageEnvelope {
        MessageEnvelope {
            delivery_id,
            consumer,
            payload,
            priority: DEFAULT_PRIORITY,
            enqueue_first: false,
            redelivered: false,
            ack: AckRecord::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> MessageEnvelope {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_enqueue_first(mut self, enqueue_first: bool) -> MessageEnvelope {
        self.enqueue_first = enqueue_first;
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> MessageEnvelope {
        self.redelivered = redelivered;
        self
    }

    /// effective priority, i.e. clamped to the supported range
    pub fn priority(&self) -> u8 {
        self.priority.min(MAX_PRIORITY)
    }
}
