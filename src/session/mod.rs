pub mod message_producer;
pub mod session;
pub mod session_executor;
pub mod transaction_context;
