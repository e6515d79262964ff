//! GATT session setup shared by every device variant
//!
//! A session walks a connected peripheral in a fixed order: MTU, services,
//! characteristics, descriptors. It then opens action channels and subscribes
//! to notifications. Only the MTU and service steps are fatal; everything
//! below them fails per service or per characteristic.

use std::sync::Arc;

use uuid::Uuid;

use super::action::{ActionEncoder, ActionTable};
use super::{Characteristic, Decoder, DeviceError};
use crate::ble::{NotificationHandler, RemoteCharacteristic, RemotePeripheral, RemoteService};
use crate::callback::ReadingSink;
use crate::model::{PeripheralId, Reading};
use crate::signal::SignalListener;

/// What a device variant expects to find on its peripheral.
pub(crate) trait GattProfile: Send + Sync {
    /// Services to discover; `None` discovers all of them.
    fn service_filter(&self) -> Option<Vec<Uuid>>;

    /// Characteristics to discover within a service; `None` discovers all.
    fn characteristic_filter(&self, service: &RemoteService) -> Option<Vec<Uuid>>;

    /// The action backed by a writable characteristic, if any.
    fn action_for(&self, characteristic: &RemoteCharacteristic) -> Option<(String, ActionEncoder)>;

    fn decoder_for(&self, characteristic: &RemoteCharacteristic) -> Option<Decoder>;

    /// Called from the notification path for every decoded reading, before
    /// it is handed to the sink. Must not block.
    fn on_reading(&self, _peripheral_id: &PeripheralId, _reading: &Reading) {}
}

/// Set the session up. Returns the characteristics that were discovered.
pub(crate) async fn establish(
    peripheral: &Arc<dyn RemotePeripheral>,
    profile: Arc<dyn GattProfile>,
    actions: &ActionTable,
    sink: &ReadingSink,
    teardown: &SignalListener,
    mtu: u16,
) -> Result<Vec<Characteristic>, DeviceError> {
    let id = peripheral.id().clone();

    peripheral
        .set_mtu(mtu)
        .await
        .map_err(|source| DeviceError::ConnectionSetup { stage: "set MTU", source })?;

    let service_filter = profile.service_filter();
    let services = peripheral
        .discover_services(service_filter.as_deref())
        .await
        .map_err(|source| DeviceError::ConnectionSetup {
            stage: "discover services",
            source,
        })?;
    log::info!("Discovered {} services on {}", services.len(), id);

    let mut discovered = Vec::new();
    for service in &services {
        let filter = profile.characteristic_filter(service);
        let characteristics = match peripheral.discover_characteristics(service, filter.as_deref()).await {
            Ok(characteristics) => characteristics,
            Err(source) => {
                let e = DeviceError::CharacteristicDiscovery {
                    service: service.uuid,
                    source,
                };
                log::warn!("{} on {}, skipping service", e, id);
                continue;
            }
        };

        for characteristic in characteristics {
            if let Err(e) = peripheral.discover_descriptors(&characteristic).await {
                log::warn!(
                    "Failed to discover descriptors of {} on {}: {}",
                    characteristic.uuid,
                    id,
                    e
                );
                continue;
            }
            discovered.push(characteristic);
        }
    }

    let mut exposed = Vec::with_capacity(discovered.len());
    for characteristic in discovered {
        if characteristic.properties.is_writable() {
            if let Some((name, encode)) = profile.action_for(&characteristic) {
                actions
                    .open(
                        name,
                        Arc::clone(peripheral),
                        characteristic.clone(),
                        encode,
                        teardown.clone(),
                    )
                    .await;
            }
        }

        let decode = profile.decoder_for(&characteristic);
        if characteristic.properties.is_notifiable() {
            if let Some(decode) = decode.clone() {
                let handler = notification_handler(id.clone(), decode, Arc::clone(&profile), sink.clone());
                if let Err(e) = peripheral.subscribe(&characteristic, handler).await {
                    log::warn!("Failed to subscribe to {} on {}: {}", characteristic.uuid, id, e);
                }
            }
        }

        let name = if characteristic.name.is_empty() {
            characteristic.uuid.to_string()
        } else {
            characteristic.name.clone()
        };
        exposed.push(Characteristic {
            uuid: characteristic.uuid,
            name,
            decode,
        });
    }

    Ok(exposed)
}

/// Wait for teardown, then close every action channel and join its writer.
pub(crate) async fn hold(actions: &ActionTable, mut teardown: SignalListener) {
    teardown.fired().await;
    actions.close_all().await;
}

fn notification_handler(
    id: PeripheralId,
    decode: Decoder,
    profile: Arc<dyn GattProfile>,
    sink: ReadingSink,
) -> NotificationHandler {
    Box::new(move |bytes: Vec<u8>| {
        if let Some(reading) = decode(&bytes) {
            profile.on_reading(&id, &reading);
            sink.emit(id.clone(), reading);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimBleHost, SimPeripheral};
    use crate::ble::{BleHost, CharProperties};
    use crate::callback::{callback_fn, CallbackRegistry};
    use crate::model::{format_bytes, ActionData};
    use crate::signal::Signal;
    use tokio::sync::mpsc;

    const SENSORS: Uuid = Uuid::from_u128(0x100);
    const LEVEL: Uuid = Uuid::from_u128(0x101);
    const SWITCH: Uuid = Uuid::from_u128(0x102);
    const SPARE: Uuid = Uuid::from_u128(0x200);
    const SPARE_LEVEL: Uuid = Uuid::from_u128(0x201);

    fn low_byte(data: &ActionData) -> Vec<u8> {
        vec![data.value as u8]
    }

    struct Everything;

    impl GattProfile for Everything {
        fn service_filter(&self) -> Option<Vec<Uuid>> {
            None
        }

        fn characteristic_filter(&self, _service: &RemoteService) -> Option<Vec<Uuid>> {
            None
        }

        fn action_for(&self, characteristic: &RemoteCharacteristic) -> Option<(String, ActionEncoder)> {
            let encode: ActionEncoder = low_byte;
            Some((characteristic.uuid.to_string(), encode))
        }

        fn decoder_for(&self, characteristic: &RemoteCharacteristic) -> Option<Decoder> {
            let name = characteristic.uuid.to_string();
            let decode: Decoder = Arc::new(move |b: &[u8]| Some(Reading::new(name.clone(), format_bytes(b), "")));
            Some(decode)
        }
    }

    async fn connect(sim: SimPeripheral) -> (Arc<SimPeripheral>, Arc<dyn RemotePeripheral>) {
        let host = SimBleHost::new();
        let id = PeripheralId::new("p1");
        let sim = host.add_peripheral(sim).await;
        host.connect(&id).await.unwrap();
        (sim, host.peripheral(&id).await.unwrap())
    }

    fn sensor_peripheral() -> SimPeripheral {
        SimPeripheral::new("p1")
            .with_service(
                SENSORS,
                "sensors",
                &[
                    (LEVEL, "level", CharProperties::NOTIFY),
                    (SWITCH, "switch", CharProperties::WRITE),
                ],
            )
            .with_service(SPARE, "spare", &[(SPARE_LEVEL, "", CharProperties::NOTIFY)])
    }

    #[tokio::test]
    async fn test_establish_subscribes_and_opens_actions() {
        let (sim, peripheral) = connect(sensor_peripheral()).await;
        let registry = Arc::new(CallbackRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .add(
                "recorder",
                callback_fn(move |_, reading| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(reading);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let teardown = Signal::new();
        let actions = ActionTable::new();
        let characteristics = establish(
            &peripheral,
            Arc::new(Everything),
            &actions,
            &ReadingSink::new(registry),
            &teardown.listener(),
            500,
        )
        .await
        .unwrap();

        assert_eq!(sim.negotiated_mtu(), 500);
        assert_eq!(characteristics.len(), 3);
        // Unnamed characteristics are named after their UUID.
        assert!(characteristics.iter().any(|c| c.name == SPARE_LEVEL.to_string()));
        assert!(sim.is_subscribed(LEVEL).await);
        assert!(sim.is_subscribed(SPARE_LEVEL).await);
        assert_eq!(actions.names().await, vec![SWITCH.to_string()]);

        assert!(sim.notify(LEVEL, &[1, 2]).await);
        let reading = rx.recv().await.unwrap();
        assert_eq!(reading.name, LEVEL.to_string());
        assert_eq!(reading.value.to_string(), "[1 2]");

        teardown.fire();
        hold(&actions, teardown.listener()).await;
        assert!(actions.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_mtu_failure_is_fatal() {
        let (_sim, peripheral) = connect(sensor_peripheral().failing_mtu()).await;
        let teardown = Signal::new();
        let err = establish(
            &peripheral,
            Arc::new(Everything),
            &ActionTable::new(),
            &ReadingSink::new(Arc::new(CallbackRegistry::new())),
            &teardown.listener(),
            500,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DeviceError::ConnectionSetup { stage: "set MTU", .. }));
    }

    #[tokio::test]
    async fn test_service_discovery_failure_is_fatal() {
        let (_sim, peripheral) = connect(sensor_peripheral().failing_service_discovery()).await;
        let teardown = Signal::new();
        let err = establish(
            &peripheral,
            Arc::new(Everything),
            &ActionTable::new(),
            &ReadingSink::new(Arc::new(CallbackRegistry::new())),
            &teardown.listener(),
            500,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DeviceError::ConnectionSetup { stage: "discover services", .. }));
    }

    #[tokio::test]
    async fn test_partial_discovery_failures_are_skipped() {
        let (sim, peripheral) = connect(
            sensor_peripheral()
                .failing_characteristic_discovery(SPARE)
                .failing_descriptor_discovery(SWITCH),
        )
        .await;
        let teardown = Signal::new();
        let actions = ActionTable::new();
        let characteristics = establish(
            &peripheral,
            Arc::new(Everything),
            &actions,
            &ReadingSink::new(Arc::new(CallbackRegistry::new())),
            &teardown.listener(),
            500,
        )
        .await
        .unwrap();

        let uuids: Vec<Uuid> = characteristics.iter().map(|c| c.uuid).collect();
        assert_eq!(uuids, vec![LEVEL]);
        assert!(sim.is_subscribed(LEVEL).await);
        assert!(!sim.is_subscribed(SPARE_LEVEL).await);
        assert!(actions.names().await.is_empty());

        teardown.fire();
        hold(&actions, teardown.listener()).await;
    }
}
