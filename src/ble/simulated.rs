//! In-process BLE host simulator
//!
//! Provides a simulated host stack with scripted peripherals that advertise,
//! accept connections, expose GATT services and push notifications entirely
//! in-process. Used for integration testing and for running the gateway
//! without BLE hardware.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::host::{
    AdapterState, Advertisement, BleHost, CharProperties, HostEvent, NotificationHandler,
    RemoteCharacteristic, RemotePeripheral, RemoteService,
};
use super::BleError;
use crate::model::PeripheralId;

/// The simulated host. Owns the "air" and every scripted peripheral.
pub struct SimBleHost {
    events_tx: broadcast::Sender<HostEvent>,
    peripherals: Mutex<HashMap<PeripheralId, Arc<SimPeripheral>>>,
    state: RwLock<AdapterState>,
    scanning: AtomicBool,
    scan_starts: AtomicUsize,
}

impl SimBleHost {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            events_tx,
            peripherals: Mutex::new(HashMap::new()),
            state: RwLock::new(AdapterState::Unknown),
            scanning: AtomicBool::new(false),
            scan_starts: AtomicUsize::new(0),
        })
    }

    /// Report an adapter state change.
    pub fn set_state(&self, state: AdapterState) {
        if state != AdapterState::PoweredOn {
            self.scanning.store(false, Ordering::SeqCst);
        }
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
        self.emit(HostEvent::StateChanged(state));
    }

    pub fn power_on(&self) {
        self.set_state(AdapterState::PoweredOn);
    }

    /// Place a peripheral in range. It stays silent until [`advertise`](Self::advertise).
    pub async fn add_peripheral(&self, peripheral: SimPeripheral) -> Arc<SimPeripheral> {
        let peripheral = Arc::new(peripheral);
        let mut peripherals = self.peripherals.lock().await;
        peripherals.insert(peripheral.id.clone(), Arc::clone(&peripheral));
        peripheral
    }

    /// Broadcast the peripheral's advertisement. Like a real host, discoveries
    /// are only reported while scanning; returns whether it was reported.
    pub async fn advertise(&self, id: &PeripheralId) -> bool {
        if !self.is_scanning() {
            return false;
        }
        let adv = {
            let peripherals = self.peripherals.lock().await;
            match peripherals.get(id) {
                Some(p) => p.advertisement(),
                None => return false,
            }
        };
        self.emit(HostEvent::Discovered(adv));
        true
    }

    /// Simulate the peripheral dropping the link (out of range, powered off).
    pub async fn drop_link(&self, id: &PeripheralId) -> bool {
        let peripheral = {
            let peripherals = self.peripherals.lock().await;
            peripherals.get(id).cloned()
        };
        match peripheral {
            Some(p) => self.disconnect_peripheral(&p).await,
            None => false,
        }
    }

    /// Re-report the current adapter state `count` times without yielding,
    /// which overflows the event queue of a slow subscriber.
    pub fn repeat_state(&self, count: usize) {
        let state = self.state.read().map(|s| *s).unwrap_or(AdapterState::Unknown);
        for _ in 0..count {
            self.emit(HostEvent::StateChanged(state));
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Number of times a scan has been started.
    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    async fn disconnect_peripheral(&self, peripheral: &SimPeripheral) -> bool {
        if !peripheral.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        peripheral.handlers.lock().await.clear();
        self.emit(HostEvent::Disconnected(peripheral.id.clone()));
        true
    }

    fn emit(&self, event: HostEvent) {
        // No receivers simply means nobody is listening yet.
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl BleHost for SimBleHost {
    fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.events_tx.subscribe()
    }

    async fn adapter_state(&self) -> AdapterState {
        self.state.read().map(|s| *s).unwrap_or(AdapterState::Unknown)
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        self.scanning.store(true, Ordering::SeqCst);
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), BleError> {
        let peripheral = {
            let peripherals = self.peripherals.lock().await;
            peripherals
                .get(id)
                .cloned()
                .ok_or_else(|| BleError::UnknownPeripheral(id.clone()))?
        };
        peripheral.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if peripheral.faults.refuse_connections {
            self.emit(HostEvent::ConnectFailed {
                id: id.clone(),
                reason: "connection refused by peripheral".to_string(),
            });
            return Ok(());
        }

        if !peripheral.connected.swap(true, Ordering::SeqCst) {
            self.emit(HostEvent::Connected(id.clone()));
        }
        Ok(())
    }

    async fn is_connected(&self, id: &PeripheralId) -> bool {
        let peripherals = self.peripherals.lock().await;
        peripherals.get(id).map_or(false, |p| p.is_connected())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), BleError> {
        self.drop_link(id).await;
        Ok(())
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Arc<dyn RemotePeripheral>, BleError> {
        let peripherals = self.peripherals.lock().await;
        let peripheral = peripherals
            .get(id)
            .cloned()
            .ok_or_else(|| BleError::UnknownPeripheral(id.clone()))?;
        Ok(peripheral as Arc<dyn RemotePeripheral>)
    }
}

#[derive(Debug, Default)]
struct SimFaults {
    mtu: bool,
    services: bool,
    refuse_connections: bool,
    /// Services whose characteristic discovery fails.
    characteristics: HashSet<Uuid>,
    /// Characteristics whose descriptor discovery fails.
    descriptors: HashSet<Uuid>,
}

struct SimService {
    service: RemoteService,
    characteristics: Vec<RemoteCharacteristic>,
}

/// A scripted peripheral. Configure it with the builder methods, then hand it
/// to [`SimBleHost::add_peripheral`].
pub struct SimPeripheral {
    id: PeripheralId,
    name: Option<String>,
    local_name: Option<String>,
    services: Vec<SimService>,
    faults: SimFaults,
    write_latency: Duration,
    connected: AtomicBool,
    connect_attempts: AtomicUsize,
    mtu: AtomicU16,
    handlers: Mutex<HashMap<Uuid, NotificationHandler>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
}

impl SimPeripheral {
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            local_name: None,
            services: Vec::new(),
            faults: SimFaults::default(),
            write_latency: Duration::ZERO,
            connected: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            mtu: AtomicU16::new(23),
            handlers: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Add a service with `(uuid, name, properties)` characteristics.
    pub fn with_service(mut self, uuid: Uuid, name: &str, characteristics: &[(Uuid, &str, CharProperties)]) -> Self {
        let characteristics = characteristics
            .iter()
            .map(|(char_uuid, char_name, properties)| RemoteCharacteristic {
                uuid: *char_uuid,
                service_uuid: uuid,
                name: char_name.to_string(),
                properties: *properties,
            })
            .collect();
        self.services.push(SimService {
            service: RemoteService {
                uuid,
                name: name.to_string(),
            },
            characteristics,
        });
        self
    }

    pub fn failing_mtu(mut self) -> Self {
        self.faults.mtu = true;
        self
    }

    pub fn failing_service_discovery(mut self) -> Self {
        self.faults.services = true;
        self
    }

    pub fn failing_characteristic_discovery(mut self, service: Uuid) -> Self {
        self.faults.characteristics.insert(service);
        self
    }

    pub fn failing_descriptor_discovery(mut self, characteristic: Uuid) -> Self {
        self.faults.descriptors.insert(characteristic);
        self
    }

    pub fn refusing_connections(mut self) -> Self {
        self.faults.refuse_connections = true;
        self
    }

    /// Simulated radio latency applied to each write.
    /// Uses tokio time, so paused clocks advance instantly in tests.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            peripheral_id: self.id.clone(),
            name: self.name.clone(),
            local_name: self.local_name.clone(),
            rssi: Some(-50),
            service_uuids: self.services.iter().map(|s| s.service.uuid).collect(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn negotiated_mtu(&self) -> u16 {
        self.mtu.load(Ordering::SeqCst)
    }

    /// Push a notification for a characteristic. Returns whether a subscriber
    /// received it.
    pub async fn notify(&self, characteristic: Uuid, data: &[u8]) -> bool {
        let handlers = self.handlers.lock().await;
        match handlers.get(&characteristic) {
            Some(handler) => {
                handler(data.to_vec());
                true
            }
            None => false,
        }
    }

    pub async fn is_subscribed(&self, characteristic: Uuid) -> bool {
        self.handlers.lock().await.contains_key(&characteristic)
    }

    /// Every completed write, in order.
    pub async fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().await.clone()
    }

    fn ensure_connected(&self) -> Result<(), BleError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BleError::Disconnected)
        }
    }

    fn find_characteristic(&self, uuid: &Uuid) -> Option<&RemoteCharacteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *uuid)
    }
}

fn passes(filter: Option<&[Uuid]>, uuid: &Uuid) -> bool {
    filter.map_or(true, |f| f.is_empty() || f.contains(uuid))
}

#[async_trait]
impl RemotePeripheral for SimPeripheral {
    fn id(&self) -> &PeripheralId {
        &self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone().or_else(|| self.local_name.clone())
    }

    async fn set_mtu(&self, mtu: u16) -> Result<(), BleError> {
        self.ensure_connected()?;
        if self.faults.mtu {
            return Err(BleError::MtuError(format!("peripheral rejected MTU {}", mtu)));
        }
        self.mtu.store(mtu, Ordering::SeqCst);
        Ok(())
    }

    async fn discover_services(&self, filter: Option<&[Uuid]>) -> Result<Vec<RemoteService>, BleError> {
        self.ensure_connected()?;
        if self.faults.services {
            return Err(BleError::GattError("service discovery failed".to_string()));
        }
        Ok(self
            .services
            .iter()
            .filter(|s| passes(filter, &s.service.uuid))
            .map(|s| s.service.clone())
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &RemoteService,
        filter: Option<&[Uuid]>,
    ) -> Result<Vec<RemoteCharacteristic>, BleError> {
        self.ensure_connected()?;
        if self.faults.characteristics.contains(&service.uuid) {
            return Err(BleError::GattError(format!(
                "characteristic discovery failed for service {}",
                service.uuid
            )));
        }
        let sim_service = self
            .services
            .iter()
            .find(|s| s.service.uuid == service.uuid)
            .ok_or_else(|| BleError::GattError(format!("unknown service {}", service.uuid)))?;
        Ok(sim_service
            .characteristics
            .iter()
            .filter(|c| passes(filter, &c.uuid))
            .cloned()
            .collect())
    }

    async fn discover_descriptors(&self, characteristic: &RemoteCharacteristic) -> Result<Vec<Uuid>, BleError> {
        self.ensure_connected()?;
        if self.faults.descriptors.contains(&characteristic.uuid) {
            return Err(BleError::GattError(format!(
                "descriptor discovery failed for {}",
                characteristic.uuid
            )));
        }
        Ok(Vec::new())
    }

    async fn write(
        &self,
        characteristic: &RemoteCharacteristic,
        data: &[u8],
        _with_response: bool,
    ) -> Result<(), BleError> {
        self.ensure_connected()?;
        let known = self
            .find_characteristic(&characteristic.uuid)
            .map_or(false, |c| c.properties.is_writable());
        if !known {
            return Err(BleError::GattError(format!(
                "characteristic {} is not writable",
                characteristic.uuid
            )));
        }
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }
        self.writes.lock().await.push((characteristic.uuid, data.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &RemoteCharacteristic,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        self.ensure_connected()?;
        let notifiable = self
            .find_characteristic(&characteristic.uuid)
            .map_or(false, |c| c.properties.is_notifiable());
        if !notifiable {
            return Err(BleError::GattError(format!(
                "characteristic {} does not support notifications",
                characteristic.uuid
            )));
        }
        self.handlers.lock().await.insert(characteristic.uuid, handler);
        Ok(())
    }
}
