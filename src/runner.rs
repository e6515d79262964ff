//! Transport runner
//!
//! Starts every registered transport on its own task with a listener of one
//! shared shutdown signal, and stops them all together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::signal::Signal;
use crate::transport::Transport;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Transport runner is already running")]
    AlreadyRunning,
}

pub struct TransportRunner {
    transports: Vec<Arc<dyn Transport>>,
    shutdown: Signal,
    running: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl TransportRunner {
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            shutdown: Signal::new(),
            running: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Register a transport. Only transports added before [`run`](Self::run)
    /// are started.
    pub fn add(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start every transport. Returns once they are spawned.
    pub async fn run(&self) -> Result<(), RunnerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyRunning);
        }

        let mut tasks = self.tasks.lock().await;
        for transport in &self.transports {
            let transport = Arc::clone(transport);
            let shutdown = self.shutdown.listener();
            tasks.spawn(async move {
                log::info!("Starting {} transport", transport.name());
                match transport.start(shutdown).await {
                    Ok(()) => log::info!("{} transport stopped", transport.name()),
                    Err(e) => log::error!("{} transport failed: {}", transport.name(), e),
                }
            });
        }
        log::info!("Transport runner started {} transports", self.transports.len());
        Ok(())
    }

    /// Signal shutdown and wait for every transport to exit. Returns
    /// immediately if the runner never ran.
    pub async fn stop(&self) {
        self.shutdown.fire();

        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("Transport task failed: {}", e);
            }
        }
    }
}

impl Default for TransportRunner {
    fn default() -> Self {
        Self::new()
    }
}
