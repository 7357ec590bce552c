use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::failover::recovery_hooks::RecoveryHooks;
use crate::meta::resource_id::ResourceId;
use crate::meta::resource_info::{ResourceInfo, ResourceState};

#[derive(Clone)]
pub struct RegistryEntry {
    pub info: Arc<ResourceInfo>,
    pub state: ResourceState,
    creation_order: u64,
    hooks: Option<Weak<dyn RecoveryHooks>>,
}

impl RegistryEntry {
    pub fn id(&self) -> ResourceId {
        self.info.id()
    }

    /// `None` if the resource registered no hooks, or if its owner is gone
    pub fn hooks(&self) -> Option<Arc<dyn RecoveryHooks>> {
        self.hooks.as_ref()
            .and_then(|h| h.upgrade())
    }
}

/// The live set of logical resources of a connection. This is what gets replayed against a new
///  transport after a reconnect.
pub struct ResourceRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    entries: FxHashMap<ResourceId, RegistryEntry>,
    next_creation_order: u64,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> ResourceRegistry {
        ResourceRegistry {
            inner: Default::default(),
        }
    }

    /// Registers a resource in state [ResourceState::Uncreated]. A resource's parent must be
    ///  registered before the resource itself.
    pub fn register(&self, info: Arc<ResourceInfo>, hooks: Option<Weak<dyn RecoveryHooks>>) -> Result<(), ClientError> {
        let id = info.id();
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(&id) {
            return Err(ClientError::illegal_state(format!("resource {:?} is already registered", id)));
        }
        if let Some(parent) = id.parent() {
            if !inner.entries.contains_key(&parent) {
                return Err(ClientError::illegal_state(format!("parent {:?} of resource {:?} is not registered", parent, id)));
            }
        }

        let creation_order = inner.next_creation_order;
        inner.next_creation_order += 1;

        trace!(?id, "registering resource");
        inner.entries.insert(id, RegistryEntry {
            info,
            state: ResourceState::Uncreated,
            creation_order,
            hooks,
        });
        Ok(())
    }

    /// Removes a resource and all of its descendants, returning the resource's entry
    pub fn unregister(&self, id: ResourceId) -> Option<RegistryEntry> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(&id)?;

        let descendants = inner.entries.keys()
            .filter(|candidate| is_descendant_of(**candidate, id))
            .cloned()
            .collect::<Vec<_>>();
        for d in descendants {
            debug!(resource = ?d, parent = ?id, "unregistering child of removed resource");
            inner.entries.remove(&d);
        }

        Some(removed)
    }

    /// returns `false` if the resource is not registered
    pub fn set_state(&self, id: ResourceId, state: ResourceState) -> bool {
        match self.inner.lock().entries.get_mut(&id) {
            Some(entry) => {
                trace!(?id, ?state, "resource state changed");
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: ResourceId) -> Option<ResourceState> {
        self.inner.lock().entries.get(&id)
            .map(|e| e.state)
    }

    pub fn info(&self, id: ResourceId) -> Option<Arc<ResourceInfo>> {
        self.inner.lock().entries.get(&id)
            .map(|e| e.info.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a point-in-time copy of all entries in replay order: every resource is followed
    ///  by its children (depth first), siblings are ordered by registration.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let inner = self.inner.lock();

        let mut children: FxHashMap<Option<ResourceId>, Vec<&RegistryEntry>> = FxHashMap::default();
        for entry in inner.entries.values() {
            let parent = entry.id().parent()
                .filter(|p| inner.entries.contains_key(p));
            children.entry(parent).or_default().push(entry);
        }
        for siblings in children.values_mut() {
            siblings.sort_by_key(|e| e.creation_order);
        }

        let mut result = Vec::with_capacity(inner.entries.len());
        let mut stack = children.get(&None)
            .map(|roots| roots.iter().rev().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        while let Some(entry) = stack.pop() {
            result.push(entry.clone());
            if let Some(c) = children.get(&Some(entry.id())) {
                stack.extend(c.iter().rev());
            }
        }
        result
    }
}

fn is_descendant_of(candidate: ResourceId, ancestor: ResourceId) -> bool {
    let mut cur = candidate.parent();
    while let Some(p) = cur {
        if p == ancestor {
            return true;
        }
        cur = p.parent();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::acknowledgement::AcknowledgeMode;
    use crate::meta::resource_id::{ConnectionId, ConsumerId, ProducerId, SessionId};
    use crate::meta::resource_info::{ConnectionInfo, ConsumerInfo, Destination, ProducerInfo, SessionInfo};

    fn connection_info(id: ConnectionId) -> Arc<ResourceInfo> {
        Arc::new(ResourceInfo::Connection(ConnectionInfo { id, client_id: None }))
    }

    fn session_info(connection: ConnectionId, value: u64) -> Arc<ResourceInfo> {
        Arc::new(ResourceInfo::Session(SessionInfo {
            id: SessionId { connection, value },
            acknowledge_mode: AcknowledgeMode::Auto,
        }))
    }

    fn consumer_info(session: SessionId, value: u64) -> Arc<ResourceInfo> {
        Arc::new(ResourceInfo::Consumer(ConsumerInfo {
            id: ConsumerId { session, value },
            destination: Destination::queue("q"),
            selector: None,
            no_local: false,
            prefetch_size: 10,
            acknowledge_mode: AcknowledgeMode::Auto,
            subscription_name: None,
            browser: false,
        }))
    }

    fn producer_info(session: SessionId, value: u64) -> Arc<ResourceInfo> {
        Arc::new(ResourceInfo::Producer(ProducerInfo {
            id: ProducerId { session, value },
            destination: None,
        }))
    }

    #[test]
    fn test_snapshot_order_parents_first() {
        let connection = ConnectionId::random();
        let s1 = SessionId { connection, value: 1 };
        let s2 = SessionId { connection, value: 2 };

        let registry = ResourceRegistry::new();
        registry.register(connection_info(connection), None).unwrap();
        registry.register(session_info(connection, 1), None).unwrap();
        registry.register(session_info(connection, 2), None).unwrap();
        registry.register(consumer_info(s2, 1), None).unwrap();
        registry.register(consumer_info(s1, 2), None).unwrap();
        registry.register(producer_info(s1, 3), None).unwrap();
        registry.register(consumer_info(s1, 4), None).unwrap();

        let order = registry.snapshot().iter()
            .map(|e| e.id())
            .collect::<Vec<_>>();

        assert_eq!(order, vec![
            ResourceId::Connection(connection),
            ResourceId::Session(s1),
            ResourceId::Consumer(ConsumerId { session: s1, value: 2 }),
            ResourceId::Producer(ProducerId { session: s1, value: 3 }),
            ResourceId::Consumer(ConsumerId { session: s1, value: 4 }),
            ResourceId::Session(s2),
            ResourceId::Consumer(ConsumerId { session: s2, value: 1 }),
        ]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let connection = ConnectionId::random();
        let registry = ResourceRegistry::new();
        registry.register(connection_info(connection), None).unwrap();

        let snapshot = registry.snapshot();
        registry.register(session_info(connection, 1), None).unwrap();
        registry.set_state(connection.into(), ResourceState::Created);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, ResourceState::Uncreated);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_register_requires_parent() {
        let connection = ConnectionId::random();
        let registry = ResourceRegistry::new();

        assert!(registry.register(session_info(connection, 1), None).is_err());
        registry.register(connection_info(connection), None).unwrap();
        assert!(registry.register(session_info(connection, 1), None).is_ok());
    }

    #[test]
    fn test_register_duplicate() {
        let connection = ConnectionId::random();
        let registry = ResourceRegistry::new();
        registry.register(connection_info(connection), None).unwrap();
        assert!(registry.register(connection_info(connection), None).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_cascades() {
        let connection = ConnectionId::random();
        let s1 = SessionId { connection, value: 1 };
        let s2 = SessionId { connection, value: 2 };

        let registry = ResourceRegistry::new();
        registry.register(connection_info(connection), None).unwrap();
        registry.register(session_info(connection, 1), None).unwrap();
        registry.register(session_info(connection, 2), None).unwrap();
        registry.register(consumer_info(s1, 1), None).unwrap();
        registry.register(producer_info(s1, 2), None).unwrap();
        registry.register(consumer_info(s2, 3), None).unwrap();

        let removed = registry.unregister(s1.into()).unwrap();
        assert_eq!(removed.id(), ResourceId::Session(s1));

        let remaining = registry.snapshot().iter()
            .map(|e| e.id())
            .collect::<Vec<_>>();
        assert_eq!(remaining, vec![
            ResourceId::Connection(connection),
            ResourceId::Session(s2),
            ResourceId::Consumer(ConsumerId { session: s2, value: 3 }),
        ]);

        assert!(registry.unregister(s1.into()).is_none());
    }

    #[test]
    fn test_state() {
        let connection = ConnectionId::random();
        let registry = ResourceRegistry::new();
        assert!(!registry.set_state(connection.into(), ResourceState::Created));

        registry.register(connection_info(connection), None).unwrap();
        assert_eq!(registry.state(connection.into()), Some(ResourceState::Uncreated));
        assert!(registry.set_state(connection.into(), ResourceState::Created));
        assert_eq!(registry.state(connection.into()), Some(ResourceState::Created));
    }

    #[test]
    fn test_hooks_are_weak() {
        struct Hooks;
        impl RecoveryHooks for Hooks {}

        let connection = ConnectionId::random();
        let registry = ResourceRegistry::new();
        let hooks: Arc<dyn RecoveryHooks> = Arc::new(Hooks);
        registry.register(connection_info(connection), Some(Arc::downgrade(&hooks))).unwrap();

        assert!(registry.snapshot()[0].hooks().is_some());
        drop(hooks);
        assert!(registry.snapshot()[0].hooks().is_none());
    }
}
