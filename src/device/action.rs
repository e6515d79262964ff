//! Action channels
//!
//! Every action a device exposes is backed by a single-slot mailbox and a
//! writer task that owns the characteristic it writes to. Triggering an action
//! waits for the mailbox slot. While the slot is taken, that is until the
//! writer finishes its in-flight write and the settle delay after it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;

use super::DeviceError;
use crate::ble::{RemoteCharacteristic, RemotePeripheral};
use crate::model::ActionData;
use crate::signal::SignalListener;

/// Pause after each write before the next request is taken from the mailbox.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Turns an action request into the bytes written to the characteristic.
pub type ActionEncoder = fn(&ActionData) -> Vec<u8>;

/// Named action channels of one connected device.
pub struct ActionTable {
    channels: RwLock<HashMap<String, mpsc::Sender<ActionData>>>,
    writers: Mutex<JoinSet<()>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            writers: Mutex::new(JoinSet::new()),
        }
    }

    /// Open a channel and start its writer task. The writer stops when the
    /// channel is closed or `teardown` fires.
    pub async fn open(
        &self,
        name: impl Into<String>,
        peripheral: Arc<dyn RemotePeripheral>,
        characteristic: RemoteCharacteristic,
        encode: ActionEncoder,
        teardown: SignalListener,
    ) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(1);

        self.writers
            .lock()
            .await
            .spawn(write_loop(name.clone(), peripheral, characteristic, encode, rx, teardown));

        if self.channels.write().await.insert(name.clone(), tx).is_some() {
            log::warn!("Action {} was already open, replaced", name);
        }
    }

    /// Queue a request on the named channel.
    ///
    /// Returns as soon as the request sits in the slot. A full slot is not
    /// an error: the call waits for the writer to take the pending request,
    /// which is at most one write plus [`SETTLE_DELAY`] away.
    pub async fn trigger(&self, name: &str, data: ActionData) -> Result<(), DeviceError> {
        let tx = {
            let channels = self.channels.read().await;
            channels
                .get(name)
                .cloned()
                .ok_or_else(|| DeviceError::ActionNotRecognized(name.to_string()))?
        };

        tx.send(data)
            .await
            .map_err(|_| DeviceError::ActionChannelClosed(name.to_string()))
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.channels.read().await.contains_key(name)
    }

    /// Close every channel and wait for the writer tasks to finish.
    pub async fn close_all(&self) {
        self.channels.write().await.clear();

        let mut writers = self.writers.lock().await;
        while let Some(result) = writers.join_next().await {
            if let Err(e) = result {
                log::warn!("Action writer task failed: {}", e);
            }
        }
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_loop(
    name: String,
    peripheral: Arc<dyn RemotePeripheral>,
    characteristic: RemoteCharacteristic,
    encode: ActionEncoder,
    mut rx: mpsc::Receiver<ActionData>,
    mut teardown: SignalListener,
) {
    loop {
        let data = tokio::select! {
            biased;
            _ = teardown.fired() => break,
            request = rx.recv() => match request {
                Some(data) => data,
                None => break,
            },
        };

        let payload = encode(&data);
        match peripheral.write(&characteristic, &payload, true).await {
            Ok(()) => log::info!(
                "Action {} wrote {:?} to {} on {}",
                name,
                payload,
                characteristic.uuid,
                peripheral.id()
            ),
            Err(e) => log::warn!("Action {} failed on {}: {}", name, peripheral.id(), e),
        }

        tokio::select! {
            biased;
            _ = teardown.fired() => break,
            _ = tokio::time::sleep(SETTLE_DELAY) => {}
        }
    }
    log::debug!("Action writer {} on {} stopped", name, peripheral.id());
}
