//! BLE host trait definitions and core types
//!
//! Defines the abstract host-stack interface the transport drives. Both the
//! simulated host and the btleplug host conform to it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::BleError;
use crate::model::PeripheralId;

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unknown,
}

/// A received BLE advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peripheral_id: PeripheralId,
    /// Name known to the host for this peripheral (GAP device name).
    pub name: Option<String>,
    /// Local name carried in the advertisement payload.
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
}

impl Advertisement {
    pub fn new(peripheral_id: PeripheralId) -> Self {
        Self {
            peripheral_id,
            name: None,
            local_name: None,
            rssi: None,
            service_uuids: Vec::new(),
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

    /// The best human readable name available: the host name, else the
    /// advertised local name.
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.local_name.as_deref().filter(|n| !n.is_empty()))
    }

    /// Case-insensitive substring match against both names.
    pub fn name_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [self.name.as_deref(), self.local_name.as_deref()]
            .into_iter()
            .flatten()
            .any(|n| n.to_lowercase().contains(&needle))
    }
}

/// Events reported by the host stack.
#[derive(Debug, Clone)]
pub enum HostEvent {
    StateChanged(AdapterState),
    Discovered(Advertisement),
    Connected(PeripheralId),
    ConnectFailed { id: PeripheralId, reason: String },
    Disconnected(PeripheralId),
}

/// GATT characteristic properties relevant to the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub const READ: Self = Self {
        read: true,
        write: false,
        write_without_response: false,
        notify: false,
        indicate: false,
    };

    pub const WRITE: Self = Self {
        read: false,
        write: true,
        write_without_response: false,
        notify: false,
        indicate: false,
    };

    pub const NOTIFY: Self = Self {
        read: false,
        write: false,
        write_without_response: false,
        notify: true,
        indicate: false,
    };

    pub fn union(self, other: Self) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
            write_without_response: self.write_without_response || other.write_without_response,
            notify: self.notify || other.notify,
            indicate: self.indicate || other.indicate,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn is_notifiable(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A service discovered on a remote peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub name: String,
}

/// A characteristic discovered on a remote peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub name: String,
    pub properties: CharProperties,
}

/// Invoked by the host for every notification of a subscribed characteristic.
///
/// Runs on the host's notification path, so it must not block.
pub type NotificationHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// GATT client access to one connected peripheral.
#[async_trait]
pub trait RemotePeripheral: Send + Sync {
    fn id(&self) -> &PeripheralId;

    fn name(&self) -> Option<String>;

    /// Negotiate the link MTU.
    async fn set_mtu(&self, mtu: u16) -> Result<(), BleError>;

    /// Discover services, restricted to `filter` when given.
    async fn discover_services(&self, filter: Option<&[Uuid]>) -> Result<Vec<RemoteService>, BleError>;

    /// Discover the characteristics of a service, restricted to `filter` when given.
    async fn discover_characteristics(
        &self,
        service: &RemoteService,
        filter: Option<&[Uuid]>,
    ) -> Result<Vec<RemoteCharacteristic>, BleError>;

    /// Discover the descriptors of a characteristic.
    async fn discover_descriptors(&self, characteristic: &RemoteCharacteristic) -> Result<Vec<Uuid>, BleError>;

    async fn write(
        &self,
        characteristic: &RemoteCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError>;

    /// Enable notifications (or indications) and route them to `handler`.
    async fn subscribe(
        &self,
        characteristic: &RemoteCharacteristic,
        handler: NotificationHandler,
    ) -> Result<(), BleError>;
}

/// BLE central role of the host stack.
#[async_trait]
pub trait BleHost: Send + Sync {
    /// Subscribe to host events.
    fn events(&self) -> broadcast::Receiver<HostEvent>;

    /// Current adapter power state. Lets a late subscriber catch up on a
    /// power-on it did not observe as an event.
    async fn adapter_state(&self) -> AdapterState;

    async fn start_scan(&self) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Request a connection. The outcome is reported as
    /// [`HostEvent::Connected`] or [`HostEvent::ConnectFailed`].
    async fn connect(&self, id: &PeripheralId) -> Result<(), BleError>;

    /// Whether the host currently holds a link to the peripheral.
    async fn is_connected(&self, id: &PeripheralId) -> bool;

    /// Drop the link to a peripheral. A [`HostEvent::Disconnected`] follows.
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), BleError>;

    /// GATT handle of a known peripheral.
    async fn peripheral(&self, id: &PeripheralId) -> Result<Arc<dyn RemotePeripheral>, BleError>;
}
