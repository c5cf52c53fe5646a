//! Connection registry: endpoint -> live connection. At most one entry per endpoint.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;

enum Slot<H> {
    /// Outbound connect in flight; reserves the endpoint.
    Connecting,
    Established(H),
}

/// Error from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already connected or connecting")]
    AlreadyRegistered(Endpoint),
    /// Usage error: sending to a peer that is not connected.
    #[error("not connected to {0}")]
    NotConnected(Endpoint),
    /// Lookup error: disconnecting a peer that is not registered.
    #[error("no connection registered for {0}")]
    UnknownEndpoint(Endpoint),
}

/// Thread-safe map from endpoint to connection handle `H`.
pub struct ConnectionRegistry<H> {
    entries: Mutex<HashMap<Endpoint, Slot<H>>>,
}

impl<H: Clone> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> ConnectionRegistry<H> {
    pub fn new() -> Self {
        ConnectionRegistry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve `endpoint` for an outbound connect. Fails if any entry exists.
    pub fn reserve(&self, endpoint: Endpoint) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&endpoint) {
            return Err(RegistryError::AlreadyRegistered(endpoint));
        }
        entries.insert(endpoint, Slot::Connecting);
        Ok(())
    }

    /// Turn a reservation into a live connection.
    pub fn establish(&self, endpoint: Endpoint, handle: H) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        let Some(slot) = entries.get_mut(&endpoint) else {
            return Err(RegistryError::UnknownEndpoint(endpoint));
        };
        if matches!(slot, Slot::Established(_)) {
            return Err(RegistryError::AlreadyRegistered(endpoint));
        }
        *slot = Slot::Established(handle);
        Ok(())
    }

    /// Drop a reservation after a failed connect. Live connections are left alone.
    pub fn release(&self, endpoint: Endpoint) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(&endpoint), Some(Slot::Connecting)) {
            entries.remove(&endpoint);
        }
    }

    /// Register an accepted connection directly.
    pub fn insert(&self, endpoint: Endpoint, handle: H) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&endpoint) {
            return Err(RegistryError::AlreadyRegistered(endpoint));
        }
        entries.insert(endpoint, Slot::Established(handle));
        Ok(())
    }

    /// Handle of a live connection.
    pub fn get(&self, endpoint: Endpoint) -> Result<H, RegistryError> {
        match self.entries.lock().get(&endpoint) {
            Some(Slot::Established(h)) => Ok(h.clone()),
            _ => Err(RegistryError::NotConnected(endpoint)),
        }
    }

    /// Remove a live connection. Whoever gets `Some` owns its teardown.
    pub fn remove(&self, endpoint: Endpoint) -> Option<H> {
        let mut entries = self.entries.lock();
        match entries.get(&endpoint) {
            Some(Slot::Established(_)) => match entries.remove(&endpoint) {
                Some(Slot::Established(h)) => Some(h),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remove every live connection, leaving reservations in place.
    pub fn drain(&self) -> Vec<(Endpoint, H)> {
        let mut entries = self.entries.lock();
        let live: Vec<Endpoint> = entries
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Established(_)))
            .map(|(ep, _)| *ep)
            .collect();
        live.into_iter()
            .filter_map(|ep| match entries.remove(&ep) {
                Some(Slot::Established(h)) => Some((ep, h)),
                _ => None,
            })
            .collect()
    }

    pub fn is_connected(&self, endpoint: Endpoint) -> bool {
        matches!(self.entries.lock().get(&endpoint), Some(Slot::Established(_)))
    }

    /// True for live connections and in-flight connects.
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.entries.lock().contains_key(&endpoint)
    }

    /// Live connections.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Established(_)))
            .map(|(ep, _)| *ep)
            .collect()
    }

    /// Entries of any state.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1".parse().unwrap(), port)
    }

    #[test]
    fn reserve_then_establish() {
        let reg = ConnectionRegistry::new();
        reg.reserve(ep(1)).unwrap();
        assert!(reg.contains(ep(1)));
        assert_eq!(reg.get(ep(1)), Err(RegistryError::NotConnected(ep(1))));
        reg.establish(ep(1), 10u32).unwrap();
        assert_eq!(reg.get(ep(1)), Ok(10));
        assert_eq!(reg.endpoints(), vec![ep(1)]);
    }

    #[test]
    fn duplicate_reservation_rejected() {
        let reg: ConnectionRegistry<u32> = ConnectionRegistry::new();
        reg.reserve(ep(1)).unwrap();
        assert_eq!(
            reg.reserve(ep(1)),
            Err(RegistryError::AlreadyRegistered(ep(1)))
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn release_only_drops_reservations() {
        let reg = ConnectionRegistry::new();
        reg.reserve(ep(1)).unwrap();
        reg.release(ep(1));
        assert!(reg.is_empty());
        reg.insert(ep(2), 5u32).unwrap();
        reg.release(ep(2));
        assert!(reg.is_connected(ep(2)));
    }

    #[test]
    fn remove_is_single_owner() {
        let reg = ConnectionRegistry::new();
        reg.insert(ep(1), 1u32).unwrap();
        assert_eq!(reg.remove(ep(1)), Some(1));
        assert_eq!(reg.remove(ep(1)), None);
    }

    #[test]
    fn remove_leaves_reservation() {
        let reg: ConnectionRegistry<u32> = ConnectionRegistry::new();
        reg.reserve(ep(1)).unwrap();
        assert_eq!(reg.remove(ep(1)), None);
        assert!(reg.contains(ep(1)));
    }

    #[test]
    fn drain_takes_live_entries() {
        let reg = ConnectionRegistry::new();
        reg.insert(ep(1), 1u32).unwrap();
        reg.insert(ep(2), 2u32).unwrap();
        reg.reserve(ep(3)).unwrap();
        let mut drained = reg.drain();
        drained.sort();
        assert_eq!(drained, vec![(ep(1), 1), (ep(2), 2)]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn random_operations_keep_one_entry_per_endpoint() {
        let reg = ConnectionRegistry::new();
        let mut rng = rand::thread_rng();
        for i in 0..1000u32 {
            let e = ep(rng.gen_range(1..5));
            match rng.gen_range(0..5) {
                0 => {
                    let _ = reg.reserve(e);
                }
                1 => {
                    let _ = reg.establish(e, i);
                }
                2 => {
                    let _ = reg.insert(e, i);
                }
                3 => {
                    reg.release(e);
                }
                _ => {
                    let _ = reg.remove(e);
                }
            }
            assert!(reg.len() <= 4);
            let mut eps = reg.endpoints();
            let before = eps.len();
            eps.dedup();
            assert_eq!(eps.len(), before);
        }
    }
}
