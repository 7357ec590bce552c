use std::sync::Arc;

use bytes::Bytes;

use crate::consumer::acknowledgement::AckType;
use crate::consumer::dispatch_queue::ReceiveTimeout;
use crate::meta::resource_id::{ConsumerId, ProducerId, ResourceId, SessionId};
use crate::meta::resource_info::{Destination, ResourceInfo};

/// A request issued to the transport layer. Encoding it for the wire is the transport's business.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Create(Arc<ResourceInfo>),
    Start(ResourceId),
    Stop(ResourceId),
    Destroy(ResourceId),
    Acknowledge {
        consumer: ConsumerId,
        delivery_id: u64,
        ack_type: AckType,
    },
    /// grants credit for a consumer that does not prefetch
    Pull {
        consumer: ConsumerId,
        timeout: ReceiveTimeout,
    },
    Send {
        producer: ProducerId,
        destination: Destination,
        payload: Bytes,
        priority: u8,
    },
    Begin(SessionId),
    Commit(SessionId),
    Rollback(SessionId),
}

/// Requests are treated differently while the connection is interrupted, see
///  [crate::failover::failover_config::InterruptedRequestPolicy].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RequestClass {
    /// idempotent with respect to the resource's declared state
    ResourceOperation,
    /// meaningful only against the transport it was issued for
    OneShot,
    /// needs no remote counterpart once the transport that knew the resource is gone
    Teardown,
}

impl Request {
    pub fn class(&self) -> RequestClass {
        match self {
            Request::Create(_) | Request::Start(_) | Request::Stop(_) | Request::Pull { .. } => RequestClass::ResourceOperation,
            Request::Destroy(_) => RequestClass::Teardown,
            Request::Acknowledge { .. } | Request::Send { .. } | Request::Begin(_) | Request::Commit(_) | Request::Rollback(_) => RequestClass::OneShot,
        }
    }
}
