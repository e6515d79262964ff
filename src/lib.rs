// Fog node - BLE sensor gateway for the Giò Plants platform

pub mod ble;
pub mod callback;
pub mod config;
pub mod connection;
pub mod device;
pub mod device_service;
pub mod model;
pub mod runner;
pub mod server;
pub mod signal;
pub mod transport;

pub use callback::{CallbackError, CallbackRegistry};
pub use config::Config;
pub use connection::ConnectionRegistry;
pub use device::{Device, DeviceError};
pub use model::{PeripheralId, Reading};
pub use runner::TransportRunner;
pub use transport::{BleTransport, Transport};
