//! Connection registry
//!
//! Tracks one entry per peripheral from the moment the transport decides to
//! connect until the link is gone. Entries in the `Connecting` state reserve
//! the peripheral id so a second advertisement cannot start a second attempt.
//!
//! Every entry carries a generation. A session only acts on the registry
//! while its generation is still the current one for its peripheral, so a
//! session outliving its link can never touch a later connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::ble::RemotePeripheral;
use crate::device::Device;
use crate::model::PeripheralId;
use crate::signal::{Signal, SignalListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    /// The host reported the link gone; the disconnect hook is running.
    Disconnecting,
}

/// A device and the signal that ends its session.
pub struct Connection {
    pub device: Arc<dyn Device>,
    /// GATT handle, set once the link is up.
    pub peripheral: Option<Arc<dyn RemotePeripheral>>,
    pub teardown: Signal,
    pub state: LinkState,
    pub generation: u64,
}

impl Connection {
    fn new(device: Arc<dyn Device>, generation: u64) -> Self {
        Self {
            device,
            peripheral: None,
            teardown: Signal::new(),
            state: LinkState::Connecting,
            generation,
        }
    }

    /// Fire the teardown signal. Returns `false` if it had already fired.
    pub fn close(&self) -> bool {
        self.teardown.fire()
    }
}

/// What a session needs once its link is up.
pub struct Session {
    pub device: Arc<dyn Device>,
    pub teardown: SignalListener,
    pub generation: u64,
}

/// Snapshot of an entry whose link went away.
pub struct Departure {
    pub device: Arc<dyn Device>,
    pub peripheral: Option<Arc<dyn RemotePeripheral>>,
    pub teardown: Signal,
    pub generation: u64,
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<PeripheralId, Connection>>,
    generations: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Reserve `id` for `device`. Returns `false`, leaving the existing entry
    /// untouched, if the id is already present.
    pub async fn add(&self, id: PeripheralId, device: Arc<dyn Device>) -> bool {
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&id) {
            log::warn!("Peripheral {} is already registered", id);
            return false;
        }
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        connections.insert(id, Connection::new(device, generation));
        true
    }

    pub async fn remove(&self, id: &PeripheralId) -> Option<Connection> {
        self.connections.lock().await.remove(id)
    }

    /// Remove the entry only if it is still `generation`.
    pub async fn remove_generation(&self, id: &PeripheralId, generation: u64) -> Option<Connection> {
        let mut connections = self.connections.lock().await;
        if connections.get(id).map(|c| c.generation) != Some(generation) {
            return None;
        }
        connections.remove(id)
    }

    /// Promote a `Connecting` entry to `Connected` and record its GATT
    /// handle. Unknown and already connected entries yield `None`.
    pub async fn mark_connected(&self, id: &PeripheralId, peripheral: Arc<dyn RemotePeripheral>) -> Option<Session> {
        let mut connections = self.connections.lock().await;
        let connection = connections.get_mut(id).filter(|c| c.state == LinkState::Connecting)?;
        connection.state = LinkState::Connected;
        connection.peripheral = Some(peripheral);
        Some(Session {
            device: Arc::clone(&connection.device),
            teardown: connection.teardown.listener(),
            generation: connection.generation,
        })
    }

    /// Flag the entry as going away. Entries already disconnecting yield `None`
    /// so the disconnect hook runs once.
    pub async fn mark_disconnecting(&self, id: &PeripheralId) -> Option<Departure> {
        let mut connections = self.connections.lock().await;
        let connection = connections.get_mut(id).filter(|c| c.state != LinkState::Disconnecting)?;
        connection.state = LinkState::Disconnecting;
        Some(Departure {
            device: Arc::clone(&connection.device),
            peripheral: connection.peripheral.clone(),
            teardown: connection.teardown.clone(),
            generation: connection.generation,
        })
    }

    /// Whether a session of `generation` still owns a live link to `id`.
    pub async fn owns_link(&self, id: &PeripheralId, generation: u64) -> bool {
        let connections = self.connections.lock().await;
        connections
            .get(id)
            .map_or(false, |c| c.generation == generation && c.state == LinkState::Connected)
    }

    pub async fn contains(&self, id: &PeripheralId) -> bool {
        self.connections.lock().await.contains_key(id)
    }

    pub async fn state(&self, id: &PeripheralId) -> Option<LinkState> {
        self.connections.lock().await.get(id).map(|c| c.state)
    }

    /// A connected device.
    pub async fn get(&self, id: &PeripheralId) -> Option<Arc<dyn Device>> {
        let connections = self.connections.lock().await;
        connections
            .get(id)
            .filter(|c| c.state == LinkState::Connected)
            .map(|c| Arc::clone(&c.device))
    }

    /// Every connected device, ordered by peripheral id.
    pub async fn list(&self) -> Vec<Arc<dyn Device>> {
        let connections = self.connections.lock().await;
        let mut connected: Vec<(&PeripheralId, &Connection)> = connections
            .iter()
            .filter(|(_, c)| c.state == LinkState::Connected)
            .collect();
        connected.sort_by(|a, b| a.0.cmp(b.0));
        connected.into_iter().map(|(_, c)| Arc::clone(&c.device)).collect()
    }

    /// Ids of entries in `state`, ordered.
    pub async fn ids_in(&self, state: LinkState) -> Vec<PeripheralId> {
        let connections = self.connections.lock().await;
        let mut ids: Vec<PeripheralId> = connections
            .iter()
            .filter(|(_, c)| c.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of entries, connecting ones included.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Fire every teardown signal. Entries stay until their disconnect is
    /// observed.
    pub async fn close_all(&self) -> usize {
        let connections = self.connections.lock().await;
        connections.values().filter(|c| c.close()).count()
    }

    pub async fn ids(&self) -> Vec<PeripheralId> {
        let mut ids: Vec<PeripheralId> = self.connections.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::SimPeripheral;
    use crate::ble::Advertisement;
    use crate::callback::{CallbackRegistry, ReadingSink};
    use crate::device::{DeviceContext, GenericDevice};

    fn device(id: &str) -> Arc<dyn Device> {
        let ctx = DeviceContext::new(ReadingSink::new(Arc::new(CallbackRegistry::new())));
        Arc::new(GenericDevice::new(&Advertisement::new(PeripheralId::new(id)), ctx))
    }

    fn handle(id: &str) -> Arc<dyn RemotePeripheral> {
        Arc::new(SimPeripheral::new(id))
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        let registry = ConnectionRegistry::new();
        let id = PeripheralId::new("p1");

        assert!(registry.add(id.clone(), device("p1")).await);
        assert!(!registry.add(id.clone(), device("p1")).await);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.state(&id).await, Some(LinkState::Connecting));
    }

    #[tokio::test]
    async fn test_only_connected_entries_are_listed() {
        let registry = ConnectionRegistry::new();
        registry.add(PeripheralId::new("b"), device("b")).await;
        registry.add(PeripheralId::new("a"), device("a")).await;
        registry.add(PeripheralId::new("c"), device("c")).await;

        assert!(registry.list().await.is_empty());
        assert!(registry.get(&PeripheralId::new("a")).await.is_none());

        registry.mark_connected(&PeripheralId::new("b"), handle("b")).await.unwrap();
        registry.mark_connected(&PeripheralId::new("a"), handle("a")).await.unwrap();
        assert!(registry.mark_connected(&PeripheralId::new("a"), handle("a")).await.is_none());
        assert!(registry.mark_connected(&PeripheralId::new("zz"), handle("zz")).await.is_none());

        let ids: Vec<String> = registry.list().await.iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.get(&PeripheralId::new("a")).await.is_some());
        assert!(registry.get(&PeripheralId::new("c")).await.is_none());
        assert_eq!(registry.ids_in(LinkState::Connecting).await, vec![PeripheralId::new("c")]);
    }

    #[tokio::test]
    async fn test_close_all_fires_teardown() {
        let registry = ConnectionRegistry::new();
        let id = PeripheralId::new("p1");
        registry.add(id.clone(), device("p1")).await;
        let mut session = registry.mark_connected(&id, handle("p1")).await.unwrap();

        assert_eq!(registry.close_all().await, 1);
        session.teardown.fired().await;
        // Already fired.
        assert_eq!(registry.close_all().await, 0);

        let connection = registry.remove(&id).await.unwrap();
        assert!(!connection.close());
        assert!(registry.is_empty().await);
        assert!(registry.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_handle_until_removed() {
        let registry = ConnectionRegistry::new();
        let id = PeripheralId::new("p1");
        registry.add(id.clone(), device("p1")).await;
        let session = registry.mark_connected(&id, handle("p1")).await.unwrap();
        assert!(registry.owns_link(&id, session.generation).await);

        let departure = registry.mark_disconnecting(&id).await.unwrap();
        assert_eq!(departure.generation, session.generation);
        assert_eq!(departure.peripheral.as_ref().map(|p| p.id().clone()), Some(id.clone()));
        assert!(!departure.teardown.is_fired());
        assert!(registry.mark_disconnecting(&id).await.is_none());

        // Hidden from listings, still reserving the id.
        assert!(registry.list().await.is_empty());
        assert!(!registry.owns_link(&id, session.generation).await);
        assert!(!registry.add(id.clone(), device("p1")).await);

        assert!(registry.remove_generation(&id, departure.generation).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_touch_new_entry() {
        let registry = ConnectionRegistry::new();
        let id = PeripheralId::new("p1");
        registry.add(id.clone(), device("p1")).await;
        let old = registry.mark_connected(&id, handle("p1")).await.unwrap();
        registry.remove(&id).await;

        registry.add(id.clone(), device("p1")).await;
        let new = registry.mark_connected(&id, handle("p1")).await.unwrap();
        assert_ne!(old.generation, new.generation);

        assert!(!registry.owns_link(&id, old.generation).await);
        assert!(registry.remove_generation(&id, old.generation).await.is_none());
        assert!(registry.owns_link(&id, new.generation).await);
        assert_eq!(registry.state(&id).await, Some(LinkState::Connected));
    }
}
