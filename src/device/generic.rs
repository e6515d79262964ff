//! Generic device
//!
//! Exposes whatever the peripheral offers at connect time. Notifications are
//! reported as raw byte lists and every writable characteristic becomes an
//! action named after its UUID.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::action::{ActionEncoder, ActionTable};
use super::catalog::DeviceFactory;
use super::session::{self, GattProfile};
use super::{device_name, Characteristic, Decoder, Device, DeviceContext, DeviceError};
use crate::ble::{Advertisement, RemoteCharacteristic, RemotePeripheral, RemoteService};
use crate::model::{format_bytes, ActionData, PeripheralId, Reading};
use crate::signal::SignalListener;

/// Name fragment accepted by the generic fallback when none is configured.
pub const DEFAULT_NAME_FILTER: &str = "bbc micro:bit";

/// Writes the action value truncated to a single byte.
fn encode_low_byte(data: &ActionData) -> Vec<u8> {
    vec![data.value as u8]
}

/// Action names are characteristic UUIDs. Any textual UUID form is accepted
/// and folded to the hyphenated form.
fn action_key(name: &str) -> String {
    Uuid::parse_str(name)
        .map(|uuid| uuid.to_string())
        .unwrap_or_else(|_| name.to_string())
}

struct GenericProfile;

impl GattProfile for GenericProfile {
    fn service_filter(&self) -> Option<Vec<Uuid>> {
        None
    }

    fn characteristic_filter(&self, _service: &RemoteService) -> Option<Vec<Uuid>> {
        None
    }

    fn action_for(&self, characteristic: &RemoteCharacteristic) -> Option<(String, ActionEncoder)> {
        let encode: ActionEncoder = encode_low_byte;
        Some((characteristic.uuid.to_string(), encode))
    }

    fn decoder_for(&self, characteristic: &RemoteCharacteristic) -> Option<Decoder> {
        if !characteristic.properties.is_notifiable() {
            return None;
        }
        let name = characteristic.uuid.to_string();
        let decode: Decoder = Arc::new(move |bytes: &[u8]| Some(Reading::new(name.clone(), format_bytes(bytes), "")));
        Some(decode)
    }
}

pub struct GenericDevice {
    id: PeripheralId,
    name: String,
    ctx: DeviceContext,
    actions: ActionTable,
    characteristics: RwLock<Vec<Characteristic>>,
}

impl GenericDevice {
    pub fn new(adv: &Advertisement, ctx: DeviceContext) -> Self {
        Self {
            id: adv.peripheral_id.clone(),
            name: device_name(adv),
            ctx,
            actions: ActionTable::new(),
            characteristics: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Device for GenericDevice {
    fn id(&self) -> &PeripheralId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "generic"
    }

    async fn on_connected(
        &self,
        peripheral: Arc<dyn RemotePeripheral>,
        teardown: SignalListener,
    ) -> Result<(), DeviceError> {
        let characteristics = session::establish(
            &peripheral,
            Arc::new(GenericProfile),
            &self.actions,
            &self.ctx.sink,
            &teardown,
            self.ctx.mtu,
        )
        .await?;

        log::info!(
            "{} ({}) ready with {} characteristics",
            self.name,
            self.id,
            characteristics.len()
        );
        *self.characteristics.write().await = characteristics;

        session::hold(&self.actions, teardown).await;
        Ok(())
    }

    async fn on_disconnected(&self, _peripheral: Arc<dyn RemotePeripheral>) -> Result<(), DeviceError> {
        log::info!("{} ({}) disconnected", self.name, self.id);
        Ok(())
    }

    async fn available_characteristics(&self) -> Vec<Characteristic> {
        self.characteristics.read().await.clone()
    }

    async fn trigger_action(&self, name: &str, data: ActionData) -> Result<(), DeviceError> {
        self.actions.trigger(&action_key(name), data).await
    }
}

/// Fallback factory for peripherals no specialized factory claims.
pub struct GenericFactory {
    name_filters: Vec<String>,
}

impl GenericFactory {
    /// Accept peripherals whose name contains any of `name_filters`. An empty
    /// list accepts every peripheral.
    pub fn new(name_filters: Vec<String>) -> Self {
        Self { name_filters }
    }
}

impl Default for GenericFactory {
    fn default() -> Self {
        Self::new(vec![DEFAULT_NAME_FILTER.to_string()])
    }
}

impl DeviceFactory for GenericFactory {
    fn kind(&self) -> &'static str {
        "generic"
    }

    fn recognizes(&self, adv: &Advertisement) -> bool {
        self.name_filters.is_empty() || self.name_filters.iter().any(|f| adv.name_contains(f))
    }

    fn build(&self, adv: &Advertisement, ctx: &DeviceContext) -> Arc<dyn Device> {
        Arc::new(GenericDevice::new(adv, ctx.clone()))
    }
}
