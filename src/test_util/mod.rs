//! Utilities for testing code that is based on the client core. They are used for testing the
//!  client itself, but they are also exported so applications can test their messaging code
//!  without a broker.

pub mod connection;
pub mod envelope;
pub mod transport;
