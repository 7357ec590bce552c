use std::fmt::{Debug, Formatter};

use uuid::Uuid;

/// Identity of a logical connection. It is generated once on the client side and stays the same
///  across reconnects, so are all ids derived from it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn random() -> ConnectionId {
        ConnectionId(Uuid::new_v4())
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ID:{}", self.0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId {
    pub connection: ConnectionId,
    pub value: u64,
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.connection, self.value)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConsumerId {
    pub session: SessionId,
    pub value: u64,
}

impl Debug for ConsumerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:C{}", self.session, self.value)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ProducerId {
    pub session: SessionId,
    pub value: u64,
}

impl Debug for ProducerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:P{}", self.session, self.value)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ResourceId {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

impl ResourceId {
    /// Sessions belong to a connection, consumers and producers to a session
    pub fn parent(&self) -> Option<ResourceId> {
        match self {
            ResourceId::Connection(_) => None,
            ResourceId::Session(id) => Some(ResourceId::Connection(id.connection)),
            ResourceId::Consumer(id) => Some(ResourceId::Session(id.session)),
            ResourceId::Producer(id) => Some(ResourceId::Session(id.session)),
        }
    }
}

impl From<ConnectionId> for ResourceId {
    fn from(value: ConnectionId) -> Self {
        ResourceId::Connection(value)
    }
}
impl From<SessionId> for ResourceId {
    fn from(value: SessionId) -> Self {
        ResourceId::Session(value)
    }
}
impl From<ConsumerId> for ResourceId {
    fn from(value: ConsumerId) -> Self {
        ResourceId::Consumer(value)
    }
}
impl From<ProducerId> for ResourceId {
    fn from(value: ProducerId) -> Self {
        ResourceId::Producer(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_chain() {
        let connection = ConnectionId::random();
        let session = SessionId { connection, value: 1 };
        let consumer = ConsumerId { session, value: 2 };
        let producer = ProducerId { session, value: 3 };

        assert_eq!(ResourceId::from(connection).parent(), None);
        assert_eq!(ResourceId::from(session).parent(), Some(ResourceId::Connection(connection)));
        assert_eq!(ResourceId::from(consumer).parent(), Some(ResourceId::Session(session)));
        assert_eq!(ResourceId::from(producer).parent(), Some(ResourceId::Session(session)));
    }

    #[test]
    fn test_debug() {
        let connection = ConnectionId(Uuid::nil());
        let consumer = ConsumerId { session: SessionId { connection, value: 1 }, value: 4 };
        assert_eq!(format!("{:?}", consumer), "ID:00000000-0000-0000-0000-000000000000:1:C4");
    }
}
