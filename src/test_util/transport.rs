use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::consumer::message_envelope::MessageEnvelope;
use crate::error::ClientError;
use crate::provider::broker_addr::BrokerAddr;
use crate::provider::operation_future::OperationFuture;
use crate::provider::request::Request;
use crate::provider::transport::{Transport, TransportFactory, TransportListener};

/// Scripted outcome of a single connection attempt
#[derive(Debug, Clone)]
pub enum AttemptScript {
    Refuse(ClientError),
    Accept,
    /// the transport is established, but every request sent through it fails
    AcceptFailingRequests(ClientError),
    /// the transport is established, and requests sent through it are held until completed
    AcceptHoldingRequests,
}

/// A [TransportFactory] that plays back a script of attempt outcomes and keeps track of every
///  transport it establishes. Once the script is exhausted, all attempts are accepted.
#[derive(Default)]
pub struct TrackingTransportFactory {
    script: Mutex<VecDeque<AttemptScript>>,
    attempts: Mutex<Vec<BrokerAddr>>,
    transports: Mutex<Vec<Arc<TrackingTransport>>>,
}

impl TrackingTransportFactory {
    pub fn new() -> TrackingTransportFactory {
        Default::default()
    }

    pub fn with_script(script: Vec<AttemptScript>) -> TrackingTransportFactory {
        let result = TrackingTransportFactory::new();
        result.script.lock().extend(script);
        result
    }

    pub fn push_script(&self, outcome: AttemptScript) {
        self.script.lock().push_back(outcome);
    }

    /// addresses of all connection attempts so far, successful or not
    pub fn attempts(&self) -> Vec<BrokerAddr> {
        self.attempts.lock().clone()
    }

    pub fn transports(&self) -> Vec<Arc<TrackingTransport>> {
        self.transports.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<TrackingTransport>> {
        self.transports.lock().last().cloned()
    }

    /// polls until at least `n` transports were established
    pub async fn wait_for_transports(&self, n: usize) -> Vec<Arc<TrackingTransport>> {
        loop {
            let transports = self.transports();
            if transports.len() >= n {
                return transports;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl TransportFactory for TrackingTransportFactory {
    async fn establish(&self, address: BrokerAddr, _timeout: Duration, listener: Arc<dyn TransportListener>) -> Result<Arc<dyn Transport>, ClientError> {
        self.attempts.lock().push(address.clone());

        let outcome = self.script.lock().pop_front()
            .unwrap_or(AttemptScript::Accept);

        let (failing_requests, hold_requests) = match outcome {
            AttemptScript::Refuse(e) => return Err(e),
            AttemptScript::Accept => (None, false),
            AttemptScript::AcceptFailingRequests(e) => (Some(e), false),
            AttemptScript::AcceptHoldingRequests => (None, true),
        };

        let transport = Arc::new(TrackingTransport {
            address,
            listener,
            requests: Default::default(),
            failing_requests: Mutex::new(failing_requests),
            hold_requests: AtomicBool::new(hold_requests),
            held: Default::default(),
            closed: AtomicBool::new(false),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// A [Transport] that records every request. Requests complete immediately unless the
///  transport is configured to fail or to hold them.
pub struct TrackingTransport {
    address: BrokerAddr,
    listener: Arc<dyn TransportListener>,
    requests: Mutex<Vec<Request>>,
    failing_requests: Mutex<Option<ClientError>>,
    hold_requests: AtomicBool,
    held: Mutex<Vec<OperationFuture>>,
    closed: AtomicBool,
}

impl Debug for TrackingTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrackingTransport{{{}}}", self.address)
    }
}

impl TrackingTransport {
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    pub fn assert_no_requests(&self) {
        let requests = self.requests();
        assert!(requests.is_empty(), "unexpected requests: {:?}", requests);
    }

    /// requests that were sent and match a predicate
    pub fn requests_matching(&self, predicate: impl Fn(&Request) -> bool) -> Vec<Request> {
        self.requests.lock().iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    /// `Some` makes all further requests fail with the given error, `None` lets them succeed
    pub fn fail_requests(&self, error: Option<ClientError>) {
        *self.failing_requests.lock() = error;
    }

    /// held requests are not completed until [TrackingTransport::complete_held] is called
    pub fn hold_requests(&self, hold: bool) {
        self.hold_requests.store(hold, Ordering::SeqCst);
    }

    pub fn complete_held(&self) {
        for f in self.held.lock().drain(..) {
            f.complete();
        }
    }

    pub fn num_held(&self) -> usize {
        self.held.lock().len()
    }

    pub fn simulate_failure(&self, error: ClientError) {
        self.listener.on_transport_failure(error);
    }

    pub fn deliver(&self, envelope: MessageEnvelope) {
        self.listener.on_inbound_message(envelope);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    fn remote_address(&self) -> BrokerAddr {
        self.address.clone()
    }

    fn send(&self, request: Request) -> OperationFuture {
        self.requests.lock().push(request);

        if self.is_closed() {
            return OperationFuture::completed(Err(ClientError::TransportFailure("transport is closed".to_string())));
        }
        if let Some(e) = self.failing_requests.lock().clone() {
            return OperationFuture::completed(Err(e));
        }
        if self.hold_requests.load(Ordering::SeqCst) {
            let future = OperationFuture::new();
            self.held.lock().push(future.clone());
            return future;
        }
        OperationFuture::completed(Ok(()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
