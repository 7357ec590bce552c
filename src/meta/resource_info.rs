use crate::consumer::acknowledgement::AcknowledgeMode;
use crate::meta::resource_id::{ConnectionId, ConsumerId, ProducerId, ResourceId, SessionId};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Destination {
        Destination {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Destination {
        Destination {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }
}

/// Lifecycle of a resource as far as the remote peer is concerned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceState {
    Uncreated,
    /// a create request is in flight
    Creating,
    Created,
    Started,
    Stopped,
    Destroyed,
}

impl ResourceState {
    /// Resources that existed remotely before a connection loss are recreated on the new
    ///  transport. A resource that is still being created is not: its own create request either
    ///  failed with the old transport or waits for the new one.
    pub fn is_replayable(&self) -> bool {
        matches!(self, ResourceState::Created | ResourceState::Started | ResourceState::Stopped)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub acknowledge_mode: AcknowledgeMode,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub destination: Destination,
    pub selector: Option<String>,
    pub no_local: bool,
    /// 0 means the consumer pulls messages explicitly
    pub prefetch_size: u32,
    pub acknowledge_mode: AcknowledgeMode,
    /// set for durable subscriptions
    pub subscription_name: Option<String>,
    pub browser: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProducerInfo {
    pub id: ProducerId,
    /// `None` for anonymous producers that name the destination per message
    pub destination: Option<Destination>,
}

/// Declarative description of a logical resource, i.e. everything that is needed to (re)create
///  it on a transport.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResourceInfo {
    Connection(ConnectionInfo),
    Session(SessionInfo),
    Consumer(ConsumerInfo),
    Producer(ProducerInfo),
}

impl ResourceInfo {
    pub fn id(&self) -> ResourceId {
        match self {
            ResourceInfo::Connection(info) => info.id.into(),
            ResourceInfo::Session(info) => info.id.into(),
            ResourceInfo::Consumer(info) => info.id.into(),
            ResourceInfo::Producer(info) => info.id.into(),
        }
    }
}
