//! Device model
//!
//! A [`Device`] is the gateway's view of one connected peripheral: a set of
//! named characteristics, some of which decode notifications into
//! [`Reading`]s, and a set of named actions that turn trigger requests into
//! characteristic writes.
//!
//! Variants are selected once, at discovery time, by the [`DeviceCatalog`].

pub mod action;
pub mod catalog;
pub mod generic;
pub mod session;
pub mod smart_vase;

pub use catalog::{DeviceCatalog, DeviceFactory};
pub use generic::{GenericDevice, GenericFactory};
pub use smart_vase::{SmartVase, SmartVaseFactory};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::ble::{Advertisement, BleError, RemotePeripheral};
use crate::callback::ReadingSink;
use crate::device_service::DeviceService;
use crate::model::{ActionData, PeripheralId, Reading};
use crate::signal::SignalListener;

/// MTU requested from every peripheral on connect.
pub const DEFAULT_MTU: u16 = 500;

#[derive(Error, Debug)]
pub enum DeviceError {
    /// Fatal to the connection attempt.
    #[error("Failed to {stage}: {source}")]
    ConnectionSetup {
        stage: &'static str,
        #[source]
        source: BleError,
    },

    /// Logged and skipped; the rest of the peripheral stays usable.
    #[error("Failed to discover characteristics of service {service}: {source}")]
    CharacteristicDiscovery {
        service: Uuid,
        #[source]
        source: BleError,
    },

    #[error("action {0} not recognised")]
    ActionNotRecognized(String),

    #[error("action channel for {0} is closed")]
    ActionChannelClosed(String),
}

/// Decodes raw notification bytes into a reading, if the bytes carry one.
pub type Decoder = Arc<dyn Fn(&[u8]) -> Option<Reading> + Send + Sync>;

/// A characteristic as exposed to clients of the gateway.
#[derive(Clone, Serialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub name: String,
    #[serde(skip)]
    pub decode: Option<Decoder>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            decode: None,
        }
    }

    pub fn with_decoder(mut self, decode: Decoder) -> Self {
        self.decode = Some(decode);
        self
    }

    /// Decode notification bytes. Characteristics without a decoder never
    /// produce readings.
    pub fn reading(&self, bytes: &[u8]) -> Option<Reading> {
        self.decode.as_ref().and_then(|decode| decode(bytes))
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("decodes", &self.decode.is_some())
            .finish()
    }
}

/// Serializable snapshot of a device, as returned by the REST façade.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDescription {
    pub id: PeripheralId,
    pub name: String,
    pub kind: &'static str,
    pub characteristics: Vec<Characteristic>,
}

/// Everything a factory needs to build a device.
#[derive(Clone)]
pub struct DeviceContext {
    pub sink: ReadingSink,
    pub device_service: Option<Arc<dyn DeviceService>>,
    pub mtu: u16,
    /// Room the device is registered in on the device service.
    pub room: String,
}

impl DeviceContext {
    pub fn new(sink: ReadingSink) -> Self {
        Self {
            sink,
            device_service: None,
            mtu: DEFAULT_MTU,
            room: "default".to_string(),
        }
    }

    pub fn with_device_service(mut self, service: Arc<dyn DeviceService>) -> Self {
        self.device_service = Some(service);
        self
    }
}

/// Name a device after its advertisement, falling back to `device<id>`.
pub fn device_name(adv: &Advertisement) -> String {
    adv.display_name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("device{}", adv.peripheral_id))
}

/// A connected peripheral.
///
/// Lifecycle hooks are driven by the transport, each connection on its own
/// task.
#[async_trait]
pub trait Device: Send + Sync {
    fn id(&self) -> &PeripheralId;

    fn name(&self) -> &str;

    /// Short variant tag, e.g. `generic`.
    fn kind(&self) -> &'static str;

    /// Set up the GATT session and hold it until `teardown` fires.
    ///
    /// MTU and service discovery failures are returned; the caller then
    /// drops the link.
    async fn on_connected(
        &self,
        peripheral: Arc<dyn RemotePeripheral>,
        teardown: SignalListener,
    ) -> Result<(), DeviceError>;

    async fn on_disconnected(&self, peripheral: Arc<dyn RemotePeripheral>) -> Result<(), DeviceError>;

    async fn available_characteristics(&self) -> Vec<Characteristic>;

    /// Queue an action. Returns once the request is queued, not once it is
    /// written. With a request already pending the call waits until the
    /// action's writer takes it.
    async fn trigger_action(&self, name: &str, data: ActionData) -> Result<(), DeviceError>;

    async fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            id: self.id().clone(),
            name: self.name().to_string(),
            kind: self.kind(),
            characteristics: self.available_characteristics().await,
        }
    }
}
