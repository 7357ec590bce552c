pub mod acknowledgement;
pub mod dispatch_queue;
pub mod message_consumer;
pub mod message_envelope;
pub mod received_message;
