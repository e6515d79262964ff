//! Callback registry: fan-out of readings to external subscribers
//!
//! Subscribers are keyed twice: by a generated UUID, used for removal, and
//! by a subscriber key (typically the URL readings are posted to), used to
//! reject duplicate registrations. A subscriber whose delivery fails is
//! pruned once the fan-out round it failed in has completed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{PeripheralId, Reading};

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("{key} already registered")]
    AlreadyRegistered { key: String, id: Uuid },

    #[error("Callback delivery failed: {0}")]
    Delivery(String),
}

/// Future returned by a delivery function.
pub type Delivery = BoxFuture<'static, Result<(), CallbackError>>;

/// Delivers one reading to one subscriber.
pub type Callback = Arc<dyn Fn(PeripheralId, Reading) -> Delivery + Send + Sync>;

/// Wrap an async closure into a [`Callback`].
pub fn callback_fn<F, Fut>(f: F) -> Callback
where
    F: Fn(PeripheralId, Reading) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    Arc::new(move |peripheral_id, reading| -> Delivery { Box::pin(f(peripheral_id, reading)) })
}

struct Registration {
    id: Uuid,
    deliver: Callback,
}

/// Concurrency-safe subscriber map.
pub struct CallbackRegistry {
    /// subscriber key -> registration
    callbacks: Mutex<HashMap<String, Registration>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// The id registered for a subscriber key, if any.
    pub async fn id_for(&self, key: &str) -> Option<Uuid> {
        let callbacks = self.callbacks.lock().await;
        callbacks.get(key).map(|r| r.id)
    }

    /// Register a subscriber. Fails with [`CallbackError::AlreadyRegistered`],
    /// carrying the existing id, if the key is taken.
    pub async fn add(&self, key: impl Into<String>, deliver: Callback) -> Result<Uuid, CallbackError> {
        let key = key.into();
        let mut callbacks = self.callbacks.lock().await;

        if let Some(existing) = callbacks.get(&key) {
            return Err(CallbackError::AlreadyRegistered { key, id: existing.id });
        }

        let id = Uuid::new_v4();
        log::info!("Registered callback {} for {}", id, key);
        callbacks.insert(key, Registration { id, deliver });
        Ok(id)
    }

    /// Remove a subscriber by id. Unknown ids are ignored.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut callbacks = self.callbacks.lock().await;
        let before = callbacks.len();
        callbacks.retain(|_, r| r.id != id);
        before != callbacks.len()
    }

    pub async fn len(&self) -> usize {
        self.callbacks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.callbacks.lock().await.is_empty()
    }

    /// Deliver a reading to every subscriber registered when the round starts.
    ///
    /// Deliveries run concurrently and outside the registry lock. Subscribers
    /// whose delivery failed are removed after the round; returns how many.
    pub async fn dispatch(&self, peripheral_id: &PeripheralId, reading: &Reading) -> usize {
        let round: Vec<(Uuid, String, Callback)> = {
            let callbacks = self.callbacks.lock().await;
            callbacks
                .iter()
                .map(|(key, r)| (r.id, key.clone(), Arc::clone(&r.deliver)))
                .collect()
        };

        if round.is_empty() {
            log::warn!("No callbacks to call for reading {} from {}", reading.name, peripheral_id);
            return 0;
        }

        let results = join_all(
            round
                .iter()
                .map(|(_, _, deliver)| deliver(peripheral_id.clone(), reading.clone())),
        )
        .await;

        let failed: Vec<(Uuid, &str)> = round
            .iter()
            .zip(results)
            .filter_map(|((id, key, _), result)| match result {
                Ok(()) => None,
                Err(e) => {
                    log::warn!("Removing callback {} due to errors: {}", key, e);
                    Some((*id, key.as_str()))
                }
            })
            .collect();

        if failed.is_empty() {
            return 0;
        }

        let mut callbacks = self.callbacks.lock().await;
        let mut pruned = 0;
        for (id, key) in failed {
            // Only prune the registration that failed, not a newer one under the same key.
            if callbacks.get(key).map_or(false, |r| r.id == id) {
                callbacks.remove(key);
                pruned += 1;
            }
        }
        pruned
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle devices use to publish readings into the fan-out path.
#[derive(Clone)]
pub struct ReadingSink {
    callbacks: Arc<CallbackRegistry>,
}

impl ReadingSink {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self { callbacks }
    }

    /// Hand a reading to the fan-out path without waiting for delivery.
    ///
    /// Safe to call from a notification handler; must be called within a
    /// tokio runtime.
    pub fn emit(&self, peripheral_id: PeripheralId, reading: Reading) {
        log::info!("Reading produced by {}: {}", peripheral_id, reading);
        let callbacks = Arc::clone(&self.callbacks);
        tokio::spawn(async move {
            callbacks.dispatch(&peripheral_id, &reading).await;
        });
    }
}
