//! Smart Vase
//!
//! A BBC micro:bit based plant pot with light, temperature and soil moisture
//! sensors and a watering pump. Readings are fanned out to callbacks and, once
//! the vase is registered, published to the device service.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::action::{ActionEncoder, ActionTable};
use super::catalog::DeviceFactory;
use super::session::{self, GattProfile};
use super::{device_name, Characteristic, Decoder, Device, DeviceContext, DeviceError};
use crate::ble::simulated::SimPeripheral;
use crate::ble::{Advertisement, CharProperties, RemoteCharacteristic, RemotePeripheral, RemoteService};
use crate::device_service::DeviceService;
use crate::model::{format_bytes, format_bytes_unbracketed, ActionData, GioDevice, PeripheralId, Reading};
use crate::signal::SignalListener;

pub const LIGHT_SERVICE: Uuid = Uuid::from_u128(0x02751625_523e_493b_8f94_1765effa1b20);
pub const TEMPERATURE_SERVICE: Uuid = Uuid::from_u128(0xe95d6100_251d_470a_a062_fa1922dfa9a8);
pub const MOISTURE_SERVICE: Uuid = Uuid::from_u128(0x73cd5e04_d32c_4345_a543_487435c70c48);
pub const WATERING_SERVICE: Uuid = Uuid::from_u128(0xce9eafe4_c443_41db_9cb5_81e567f3ba93);

pub const LIGHT_CHARACTERISTIC: Uuid = Uuid::from_u128(0x02759250_523e_493b_8f94_1765effa1b20);
pub const TEMPERATURE_CHARACTERISTIC: Uuid = Uuid::from_u128(0xe95d9250_251d_470a_a062_fa1922dfa9a8);
pub const MOISTURE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x73cd7350_d32c_4345_a543_487435c70c48);
pub const WATERING_CHARACTERISTIC: Uuid = Uuid::from_u128(0xce9e7625_c443_41db_9cb5_81e567f3ba93);

pub const SERVICES: [Uuid; 4] = [LIGHT_SERVICE, TEMPERATURE_SERVICE, MOISTURE_SERVICE, WATERING_SERVICE];

pub const CHARACTERISTICS: [Uuid; 4] = [
    LIGHT_CHARACTERISTIC,
    TEMPERATURE_CHARACTERISTIC,
    MOISTURE_CHARACTERISTIC,
    WATERING_CHARACTERISTIC,
];

/// Advertised name fragment of every micro:bit.
pub const NAME_FRAGMENT: &str = "bbc micro:bit";

pub const WATERING_ACTION: &str = "watering";

/// Byte the vase firmware interprets as "water now".
pub const WATERING_COMMAND: u8 = 0x74;

/// Delay between device service registration attempts.
pub const REGISTRATION_RETRY: Duration = Duration::from_secs(5);

fn encode_watering(_data: &ActionData) -> Vec<u8> {
    vec![WATERING_COMMAND]
}

fn decoder(name: &'static str, unit: &'static str, bracketed: bool) -> Decoder {
    Arc::new(move |bytes: &[u8]| {
        let value = if bracketed {
            format_bytes(bytes)
        } else {
            format_bytes_unbracketed(bytes)
        };
        Some(Reading::new(name, value, unit))
    })
}

/// The fixed characteristic set of a vase.
pub fn characteristics() -> Vec<Characteristic> {
    vec![
        Characteristic::new(LIGHT_CHARACTERISTIC, "light").with_decoder(decoder("light", "", true)),
        Characteristic::new(TEMPERATURE_CHARACTERISTIC, "temperature")
            .with_decoder(decoder("temperature", "C°", false)),
        Characteristic::new(MOISTURE_CHARACTERISTIC, "moisture").with_decoder(decoder("moisture", "", false)),
        Characteristic::new(WATERING_CHARACTERISTIC, "watering"),
    ]
}

/// A simulated vase exposing the same GATT layout as the real firmware.
pub fn simulated_peripheral(id: impl Into<PeripheralId>, name: &str) -> SimPeripheral {
    // Moisture is set up last, so once it is subscribed the session is complete.
    SimPeripheral::new(id)
        .with_local_name(name)
        .with_service(
            WATERING_SERVICE,
            "watering",
            &[(WATERING_CHARACTERISTIC, "watering", CharProperties::WRITE)],
        )
        .with_service(LIGHT_SERVICE, "light", &[(LIGHT_CHARACTERISTIC, "light", CharProperties::NOTIFY)])
        .with_service(
            TEMPERATURE_SERVICE,
            "temperature",
            &[(
                TEMPERATURE_CHARACTERISTIC,
                "temperature",
                CharProperties::NOTIFY.union(CharProperties::READ),
            )],
        )
        .with_service(
            MOISTURE_SERVICE,
            "moisture",
            &[(MOISTURE_CHARACTERISTIC, "moisture", CharProperties::NOTIFY)],
        )
}

struct VaseState {
    characteristics: Vec<Characteristic>,
    device_service: Option<Arc<dyn DeviceService>>,
    registered: RwLock<Option<GioDevice>>,
}

impl VaseState {
    fn registered(&self) -> Option<GioDevice> {
        self.registered.read().ok().and_then(|r| r.clone())
    }

    fn set_registered(&self, device: Option<GioDevice>) {
        if let Ok(mut registered) = self.registered.write() {
            *registered = device;
        }
    }
}

impl GattProfile for VaseState {
    fn service_filter(&self) -> Option<Vec<Uuid>> {
        Some(SERVICES.to_vec())
    }

    fn characteristic_filter(&self, _service: &RemoteService) -> Option<Vec<Uuid>> {
        Some(CHARACTERISTICS.to_vec())
    }

    fn action_for(&self, characteristic: &RemoteCharacteristic) -> Option<(String, ActionEncoder)> {
        if characteristic.uuid != WATERING_CHARACTERISTIC {
            return None;
        }
        let encode: ActionEncoder = encode_watering;
        Some((WATERING_ACTION.to_string(), encode))
    }

    fn decoder_for(&self, characteristic: &RemoteCharacteristic) -> Option<Decoder> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == characteristic.uuid)
            .and_then(|c| c.decode.clone())
    }

    fn on_reading(&self, peripheral_id: &PeripheralId, reading: &Reading) {
        let (Some(service), Some(device)) = (self.device_service.clone(), self.registered()) else {
            return;
        };

        let peripheral_id = peripheral_id.clone();
        let reading = reading.clone();
        tokio::spawn(async move {
            if let Err(e) = service.send_data(&device, &reading).await {
                log::warn!("Failed to publish {} from {}: {}", reading.name, peripheral_id, e);
            }
        });
    }
}

pub struct SmartVase {
    id: PeripheralId,
    name: String,
    ctx: DeviceContext,
    actions: ActionTable,
    state: Arc<VaseState>,
}

impl SmartVase {
    pub fn new(adv: &Advertisement, ctx: DeviceContext) -> Self {
        let state = Arc::new(VaseState {
            characteristics: characteristics(),
            device_service: ctx.device_service.clone(),
            registered: RwLock::new(None),
        });

        Self {
            id: adv.peripheral_id.clone(),
            name: device_name(adv),
            ctx,
            actions: ActionTable::new(),
            state,
        }
    }

    /// The device service record, once registration succeeded.
    pub fn registration(&self) -> Option<GioDevice> {
        self.state.registered()
    }
}

/// Register on the device service, retrying until it succeeds or the
/// connection is torn down.
async fn register_until_done(
    state: Arc<VaseState>,
    service: Arc<dyn DeviceService>,
    peripheral_id: PeripheralId,
    room: String,
    mut teardown: SignalListener,
) {
    loop {
        let attempt = tokio::select! {
            biased;
            _ = teardown.fired() => return,
            result = service.register(&peripheral_id, &room) => result,
        };

        match attempt {
            Ok(device) => {
                state.set_registered(Some(device));
                return;
            }
            Err(e) => log::warn!(
                "Failed to register {} on the device service, retrying in {:?}: {}",
                peripheral_id,
                REGISTRATION_RETRY,
                e
            ),
        }

        tokio::select! {
            biased;
            _ = teardown.fired() => return,
            _ = tokio::time::sleep(REGISTRATION_RETRY) => {}
        }
    }
}

#[async_trait]
impl Device for SmartVase {
    fn id(&self) -> &PeripheralId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "smart_vase"
    }

    async fn on_connected(
        &self,
        peripheral: Arc<dyn RemotePeripheral>,
        teardown: SignalListener,
    ) -> Result<(), DeviceError> {
        let registration = self.state.device_service.clone().map(|service| {
            tokio::spawn(register_until_done(
                Arc::clone(&self.state),
                service,
                self.id.clone(),
                self.ctx.room.clone(),
                teardown.clone(),
            ))
        });

        let profile: Arc<dyn GattProfile> = self.state.clone();
        let outcome = match session::establish(
            &peripheral,
            profile,
            &self.actions,
            &self.ctx.sink,
            &teardown,
            self.ctx.mtu,
        )
        .await
        {
            Ok(discovered) => {
                log::info!("{} ({}) ready, {} characteristics", self.name, self.id, discovered.len());
                session::hold(&self.actions, teardown).await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Some(registration) = registration {
            registration.abort();
        }
        outcome
    }

    async fn on_disconnected(&self, _peripheral: Arc<dyn RemotePeripheral>) -> Result<(), DeviceError> {
        log::info!("{} ({}) disconnected", self.name, self.id);
        Ok(())
    }

    async fn available_characteristics(&self) -> Vec<Characteristic> {
        self.state.characteristics.clone()
    }

    async fn trigger_action(&self, name: &str, data: ActionData) -> Result<(), DeviceError> {
        self.actions.trigger(name, data).await
    }
}

/// Recognizes micro:bits by their advertised name.
#[derive(Default)]
pub struct SmartVaseFactory;

impl DeviceFactory for SmartVaseFactory {
    fn kind(&self) -> &'static str {
        "smart_vase"
    }

    fn recognizes(&self, adv: &Advertisement) -> bool {
        adv.name_contains(NAME_FRAGMENT)
    }

    fn build(&self, adv: &Advertisement, ctx: &DeviceContext) -> Arc<dyn Device> {
        Arc::new(SmartVase::new(adv, ctx.clone()))
    }
}
