//! Host stack backed by btleplug
//!
//! Uses the first adapter reported by the platform manager. Central events
//! are pumped into the same [`HostEvent`] stream the simulator produces, and
//! notifications of each connected peripheral are routed to the handler of
//! the characteristic they belong to.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as PlatformId};
use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use super::host::{
    AdapterState, Advertisement, BleHost, CharProperties, HostEvent, NotificationHandler,
    RemoteCharacteristic, RemotePeripheral, RemoteService,
};
use super::BleError;
use crate::model::PeripheralId;

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => BleError::Disconnected,
            btleplug::Error::DeviceNotFound => BleError::GattError("device not found".to_string()),
            other => BleError::ConnectionError(other.to_string()),
        }
    }
}

fn char_properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn matches_filter(uuid: &Uuid, filter: Option<&[Uuid]>) -> bool {
    filter.map_or(true, |f| f.contains(uuid))
}

pub struct BtleplugHost {
    adapter: Adapter,
    events_tx: broadcast::Sender<HostEvent>,
    /// Platform ids of every peripheral seen so far, keyed by their string form.
    known: Arc<Mutex<HashMap<PeripheralId, PlatformId>>>,
    peripherals: Mutex<HashMap<PeripheralId, Arc<BtleplugPeripheral>>>,
}

impl BtleplugHost {
    /// Open the first adapter and start pumping its events.
    pub async fn new() -> Result<Arc<Self>, BleError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::ScanError("no Bluetooth adapter found".to_string()))?;
        match adapter.adapter_info().await {
            Ok(info) => log::info!("Using Bluetooth adapter {}", info),
            Err(e) => log::warn!("Could not query adapter info: {}", e),
        }

        let (events_tx, _) = broadcast::channel(256);
        let host = Arc::new(Self {
            adapter,
            events_tx,
            known: Arc::new(Mutex::new(HashMap::new())),
            peripherals: Mutex::new(HashMap::new()),
        });
        host.spawn_event_pump().await?;
        Ok(host)
    }

    async fn spawn_event_pump(self: &Arc<Self>) -> Result<(), BleError> {
        let mut events = self.adapter.events().await?;
        let host = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(host) = host.upgrade() else { break };
                host.handle_central_event(event).await;
            }
            log::debug!("Central event stream ended");
        });
        Ok(())
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(platform_id) | CentralEvent::DeviceUpdated(platform_id) => {
                if let Some(adv) = self.advertisement(&platform_id).await {
                    self.emit(HostEvent::Discovered(adv));
                }
            }
            CentralEvent::DeviceConnected(platform_id) => {
                self.emit(HostEvent::Connected(self.remember(platform_id).await));
            }
            CentralEvent::DeviceDisconnected(platform_id) => {
                let id = self.remember(platform_id).await;
                self.peripherals.lock().await.remove(&id);
                self.emit(HostEvent::Disconnected(id));
            }
            _ => {}
        }
    }

    async fn remember(&self, platform_id: PlatformId) -> PeripheralId {
        let id = PeripheralId::new(platform_id.to_string());
        self.known.lock().await.insert(id.clone(), platform_id);
        id
    }

    async fn advertisement(&self, platform_id: &PlatformId) -> Option<Advertisement> {
        let peripheral = self.adapter.peripheral(platform_id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        let id = self.remember(platform_id.clone()).await;
        Some(Advertisement {
            peripheral_id: id,
            name: None,
            local_name: properties.local_name,
            rssi: properties.rssi,
            service_uuids: properties.services,
        })
    }

    async fn platform_peripheral(&self, id: &PeripheralId) -> Result<Peripheral, BleError> {
        let platform_id = self
            .known
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BleError::UnknownPeripheral(id.clone()))?;
        Ok(self.adapter.peripheral(&platform_id).await?)
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl BleHost for BtleplugHost {
    fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.events_tx.subscribe()
    }

    // An adapter that opened is usable; the platform reports no finer state.
    async fn adapter_state(&self) -> AdapterState {
        AdapterState::PoweredOn
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), BleError> {
        let peripheral = self.platform_peripheral(id).await?;
        let events_tx = self.events_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            match peripheral.connect().await {
                // Linux reports the connection as a central event as well,
                // duplicates are ignored by the transport.
                Ok(()) => {
                    let _ = events_tx.send(HostEvent::Connected(id));
                }
                Err(e) => {
                    let _ = events_tx.send(HostEvent::ConnectFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn is_connected(&self, id: &PeripheralId) -> bool {
        match self.platform_peripheral(id).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), BleError> {
        let peripheral = self.platform_peripheral(id).await?;
        self.peripherals.lock().await.remove(id);
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Arc<dyn RemotePeripheral>, BleError> {
        let mut peripherals = self.peripherals.lock().await;
        if let Some(existing) = peripherals.get(id) {
            return Ok(Arc::clone(existing) as Arc<dyn RemotePeripheral>);
        }
        let platform = self.platform_peripheral(id).await?;
        if !platform.is_connected().await? {
            return Err(BleError::Disconnected);
        }
        let peripheral = BtleplugPeripheral::open(id.clone(), platform).await?;
        peripherals.insert(id.clone(), Arc::clone(&peripheral));
        Ok(peripheral as Arc<dyn RemotePeripheral>)
    }
}

type HandlerMap = Arc<Mutex<HashMap<Uuid, NotificationHandler>>>;

/// GATT access to a connected btleplug peripheral.
pub struct BtleplugPeripheral {
    id: PeripheralId,
    peripheral: Peripheral,
    name: Option<String>,
    handlers: HandlerMap,
}

impl BtleplugPeripheral {
    async fn open(id: PeripheralId, peripheral: Peripheral) -> Result<Arc<Self>, BleError> {
        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };
        let handlers: HandlerMap = Arc::new(Mutex::new(HashMap::new()));

        let mut notifications = peripheral.notifications().await?;
        let routes = Arc::clone(&handlers);
        let pump_id = id.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let handlers = routes.lock().await;
                match handlers.get(&notification.uuid) {
                    Some(handler) => handler(notification.value),
                    None => log::trace!("{}: unrouted notification from {}", pump_id, notification.uuid),
                }
            }
            log::debug!("{}: notification stream ended", pump_id);
        });

        Ok(Arc::new(Self {
            id,
            peripheral,
            name,
            handlers,
        }))
    }

    /// The platform characteristic behind `characteristic`, from the last discovery.
    fn platform_characteristic(&self, characteristic: &RemoteCharacteristic) -> Result<Characteristic, BleError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or_else(|| BleError::GattError(format!("characteristic {} not discovered", characteristic.uuid)))
    }
}

#[async_trait]
impl RemotePeripheral for BtleplugPeripheral {
    fn id(&self) -> &PeripheralId {
        &self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    // btleplug negotiates the MTU on connection.
    async fn set_mtu(&self, mtu: u16) -> Result<(), BleError> {
        log::debug!("{}: leaving MTU {} to the platform", self.id, mtu);
        Ok(())
    }

    async fn discover_services(&self, filter: Option<&[Uuid]>) -> Result<Vec<RemoteService>, BleError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .filter(|s| matches_filter(&s.uuid, filter))
            .map(|s| RemoteService {
                uuid: s.uuid,
                name: s.uuid.to_string(),
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &RemoteService,
        filter: Option<&[Uuid]>,
    ) -> Result<Vec<RemoteCharacteristic>, BleError> {
        let platform_service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .ok_or_else(|| BleError::GattError(format!("service {} not discovered", service.uuid)))?;
        Ok(platform_service
            .characteristics
            .into_iter()
            .filter(|c| matches_filter(&c.uuid, filter))
            .map(|c| RemoteCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                name: c.uuid.to_string(),
                properties: char_properties(c.properties),
            })
            .collect())
    }

    async fn discover_descriptors(&self, characteristic: &RemoteCharacteristic) -> Result<Vec<Uuid>, BleError> {
        let descriptors: BTreeSet<Uuid> = self
            .platform_characteristic(characteristic)?
            .descriptors
            .into_iter()
            .map(|d| d.uuid)
            .collect();
        Ok(descriptors.into_iter().collect())
    }

    async fn write(
        &self,
        characteristic: &RemoteCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let platform = self.platform_characteristic(characteristic)?;
        self.peripheral
            .write(&platform, data, write_type)
            .await
            .map_err(|e| BleError::GattError(e.to_string()))
    }

    async fn subscribe(
        &self,
        characteristic: &RemoteCharacteristic,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        let platform = self.platform_characteristic(characteristic)?;
        self.handlers.lock().await.insert(characteristic.uuid, handler);
        if let Err(e) = self.peripheral.subscribe(&platform).await {
            self.handlers.lock().await.remove(&characteristic.uuid);
            return Err(BleError::GattError(e.to_string()));
        }
        Ok(())
    }
}
