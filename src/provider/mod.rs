pub mod broker_addr;
pub mod operation_future;
pub mod request;
pub mod transport;
