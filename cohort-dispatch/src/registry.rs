use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::command::{CommandKey, OpaqueInvoker};
use crate::envelope::ClientId;
use crate::error::DispatchError;

/// The commands a logical service can execute for other members.
pub(crate) struct ClientRegistration {
    invokers: BTreeMap<CommandKey, Arc<dyn OpaqueInvoker>>,
}

impl ClientRegistration {
    pub(crate) fn new(invokers: BTreeMap<CommandKey, Arc<dyn OpaqueInvoker>>) -> Self {
        Self { invokers }
    }

    #[inline]
    pub(crate) fn invoker(&self, key: CommandKey) -> Option<Arc<dyn OpaqueInvoker>> {
        self.invokers.get(&key).cloned()
    }
}

#[derive(Default)]
/// The registered logical services of a transport, keyed by client id.
pub(crate) struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientRegistration>>,
}

impl ClientRegistry {
    pub(crate) fn register(
        &self,
        client_id: ClientId,
        registration: ClientRegistration,
    ) -> Result<(), DispatchError> {
        match self.clients.entry(client_id) {
            Entry::Occupied(entry) => Err(DispatchError::DuplicateClient(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(registration));
                Ok(())
            },
        }
    }

    pub(crate) fn deregister(&self, client_id: &ClientId) -> bool {
        self.clients.remove(client_id).is_some()
    }

    pub(crate) fn get(&self, client_id: &ClientId) -> Option<Arc<ClientRegistration>> {
        self.clients.get(client_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }
}
