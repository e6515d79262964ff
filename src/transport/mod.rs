//! Transports
//!
//! A transport owns one radio technology end to end: discovery, connection
//! lifecycle and the devices it produces. The runner starts every transport
//! with the same shutdown signal.

pub mod ble;

pub use ble::{BleTransport, TransportState, DEFAULT_SCAN_PERIOD};

use async_trait::async_trait;
use thiserror::Error;

use crate::ble::BleError;
use crate::signal::SignalListener;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("BLE host error: {0}")]
    Host(#[from] BleError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run until `shutdown` fires. Returns once every connection the
    /// transport opened has been torn down.
    async fn start(&self, shutdown: SignalListener) -> Result<(), TransportError>;
}
