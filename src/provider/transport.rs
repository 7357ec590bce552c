use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::consumer::message_envelope::MessageEnvelope;
use crate::error::ClientError;
use crate::provider::broker_addr::BrokerAddr;
use crate::provider::operation_future::OperationFuture;
use crate::provider::request::Request;

/// A single established connection to a broker, as provided by the wire protocol layer.
///
/// The client core never talks to a [Transport] directly outside of the failover layer: all
///  requests go through [crate::failover::failover_controller::FailoverController], which swaps
///  transports underneath its callers.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    fn remote_address(&self) -> BrokerAddr;

    /// Issue a request. The returned future is completed by the transport's I/O context once the
    ///  broker responded (or the request failed).
    fn send(&self, request: Request) -> OperationFuture;

    /// Tear down the connection. Requests still in flight may be left incomplete - the failover
    ///  layer fails them on its side.
    async fn close(&self);
}

/// Callbacks from a [Transport] into the client core. They are called from the transport's I/O
///  context and must not block.
pub trait TransportListener: Send + Sync + 'static {
    fn on_inbound_message(&self, envelope: MessageEnvelope);

    /// Called at most once per transport.
    fn on_transport_failure(&self, error: ClientError);
}

/// Establishes transports to given addresses - this is the seam to the wire protocol layer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn establish(&self, address: BrokerAddr, timeout: Duration, listener: Arc<dyn TransportListener>) -> Result<Arc<dyn Transport>, ClientError>;
}

/// Send a request through a given transport and wait for its outcome.
pub async fn issue(transport: &dyn Transport, request: Request, timeout: Option<Duration>) -> Result<(), ClientError> {
    trace!(?request, remote = %transport.remote_address(), "issuing request");
    transport.send(request)
        .wait(timeout)
        .await
}
