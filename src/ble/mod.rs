//! BLE host layer
//!
//! Provides the host-stack abstraction traits, an in-process simulated host
//! for testing and demos, and (behind the `ble-central` feature) a host backed
//! by btleplug.

#[cfg(feature = "ble-central")]
pub mod central;
pub mod host;
pub mod simulated;

pub use host::{
    AdapterState, Advertisement, BleHost, CharProperties, HostEvent, NotificationHandler,
    RemoteCharacteristic, RemotePeripheral, RemoteService,
};

use thiserror::Error;

use crate::model::PeripheralId;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("MTU negotiation failed: {0}")]
    MtuError(String),

    #[error("Unknown peripheral {0}")]
    UnknownPeripheral(PeripheralId),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation not supported by this host: {0}")]
    Unsupported(&'static str),
}
