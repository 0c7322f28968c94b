//! MAC to client routing table
//!
//! Owned by the dispatch thread only, so no synchronisation is needed. The
//! live list keeps insertion order except that removal swaps the last entry
//! into the freed slot.

use std::collections::HashMap;
use std::sync::Arc;

use smoltcp::wire::EthernetAddress;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::Client;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client table full ({0} entries)")]
    Full(usize),

    #[error("client not registered")]
    NotFound,
}

pub struct ClientRegistry {
    clients: Vec<Arc<Client>>,
    mac_to_client: HashMap<EthernetAddress, Arc<Client>>,
    capacity: usize,
}

impl ClientRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            clients: Vec::with_capacity(capacity),
            mac_to_client: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Register `client` for its MAC and for broadcast delivery.
    ///
    /// A MAC that is already routed is taken over by the new client.
    pub fn add_client(&mut self, client: Arc<Client>) -> Result<(), RegistryError> {
        if self.clients.len() >= self.capacity {
            return Err(RegistryError::Full(self.capacity));
        }
        let mac = client.mac();
        self.clients.push(Arc::clone(&client));
        if let Some(prev) = self.mac_to_client.insert(mac, client) {
            warn!(mac = %mac, previous_pid = prev.pid(), "Duplicate client MAC, routing to newest client");
        }
        debug!(mac = %mac, clients = self.clients.len(), "Client added to registry");
        Ok(())
    }

    /// Unregister `client`, returning the registry's reference to it.
    pub fn remove_client(&mut self, client: &Arc<Client>) -> Result<Arc<Client>, RegistryError> {
        let pos = self
            .clients
            .iter()
            .position(|c| Arc::ptr_eq(c, client))
            .ok_or(RegistryError::NotFound)?;
        let removed = self.clients.swap_remove(pos);

        let mac = removed.mac();
        if self
            .mac_to_client
            .get(&mac)
            .is_some_and(|c| Arc::ptr_eq(c, &removed))
        {
            self.mac_to_client.remove(&mac);
            // Hand the MAC back to an older client that still claims it
            if let Some(other) = self.clients.iter().rev().find(|c| c.mac() == mac) {
                self.mac_to_client.insert(mac, Arc::clone(other));
            }
        }
        debug!(mac = %mac, clients = self.clients.len(), "Client removed from registry");
        Ok(removed)
    }

    #[inline]
    pub fn lookup(&self, mac: &EthernetAddress) -> Option<&Arc<Client>> {
        self.mac_to_client.get(mac)
    }

    /// Every live client, the fan-out set for broadcast frames
    #[inline]
    pub fn broadcast_targets(&self) -> &[Arc<Client>] {
        &self.clients
    }

    pub fn contains(&self, client: &Arc<Client>) -> bool {
        self.clients.iter().any(|c| Arc::ptr_eq(c, client))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(pid: u32, last: u8) -> Arc<Client> {
        let mac = EthernetAddress([0x02, 0, 0, 0, 0, last]);
        Arc::new(Client::new(pid, mac, 1, 4).unwrap().0)
    }

    #[test]
    fn test_add_and_lookup() {
        let mut registry = ClientRegistry::with_capacity(4);
        let a = client(1, 0xa);
        registry.add_client(Arc::clone(&a)).unwrap();

        assert!(Arc::ptr_eq(registry.lookup(&a.mac()).unwrap(), &a));
        assert!(registry.lookup(&EthernetAddress([0x02, 0, 0, 0, 0, 0xb])).is_none());
        assert_eq!(registry.broadcast_targets().len(), 1);
    }

    #[test]
    fn test_full() {
        let mut registry = ClientRegistry::with_capacity(1);
        registry.add_client(client(1, 1)).unwrap();
        assert!(matches!(registry.add_client(client(2, 2)), Err(RegistryError::Full(1))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_round_trip() {
        let mut registry = ClientRegistry::with_capacity(4);
        let a = client(1, 1);
        registry.add_client(Arc::clone(&a)).unwrap();
        let removed = registry.remove_client(&a).unwrap();

        assert!(Arc::ptr_eq(&removed, &a));
        assert!(registry.is_empty());
        assert!(registry.lookup(&a.mac()).is_none());
    }

    #[test]
    fn test_remove_absent() {
        let mut registry = ClientRegistry::with_capacity(4);
        let a = client(1, 1);
        let b = client(2, 2);
        registry.add_client(Arc::clone(&a)).unwrap();

        assert!(matches!(registry.remove_client(&b), Err(RegistryError::NotFound)));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&a.mac()).is_some());
    }

    #[test]
    fn test_swap_remove_keeps_others_routable() {
        let mut registry = ClientRegistry::with_capacity(4);
        let clients: Vec<_> = (1..=3).map(|i| client(i, i as u8)).collect();
        for c in &clients {
            registry.add_client(Arc::clone(c)).unwrap();
        }

        registry.remove_client(&clients[0]).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.broadcast_targets()[0], &clients[2]));
        for c in &clients[1..] {
            assert!(Arc::ptr_eq(registry.lookup(&c.mac()).unwrap(), c));
        }
    }

    #[test]
    fn test_duplicate_mac() {
        let mut registry = ClientRegistry::with_capacity(4);
        let old = client(1, 5);
        let new = client(2, 5);
        registry.add_client(Arc::clone(&old)).unwrap();
        registry.add_client(Arc::clone(&new)).unwrap();
        assert!(Arc::ptr_eq(registry.lookup(&old.mac()).unwrap(), &new));

        // Removing the routed client falls back to the remaining one
        registry.remove_client(&new).unwrap();
        assert!(Arc::ptr_eq(registry.lookup(&old.mac()).unwrap(), &old));

        registry.remove_client(&old).unwrap();
        assert!(registry.lookup(&old.mac()).is_none());
    }

    #[test]
    fn test_remove_shadowed_client_keeps_route() {
        let mut registry = ClientRegistry::with_capacity(4);
        let old = client(1, 5);
        let new = client(2, 5);
        registry.add_client(Arc::clone(&old)).unwrap();
        registry.add_client(Arc::clone(&new)).unwrap();

        registry.remove_client(&old).unwrap();
        assert!(Arc::ptr_eq(registry.lookup(&new.mac()).unwrap(), &new));
    }
}
