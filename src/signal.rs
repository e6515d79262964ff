//! Single-fire broadcast signal
//!
//! Used both as the per-connection teardown signal and as the shutdown
//! signal shared by every transport of a runner. Firing is idempotent and
//! every listener, including ones created after the signal fired, observes it.
//!
//! [`shutdown_requested`] bridges process signals into the same shutdown path.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// The firing side of a signal. Cloning shares the same signal.
#[derive(Clone, Debug)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        let mut fired_now = false;
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                fired_now = true;
                true
            }
        });
        fired_now
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> SignalListener {
        SignalListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// The waiting side of a signal.
#[derive(Clone, Debug)]
pub struct SignalListener {
    rx: watch::Receiver<bool>,
}

impl SignalListener {
    /// Wait until the signal fires. Returns immediately if it already has.
    ///
    /// A signal whose every [`Signal`] handle has been dropped counts as fired.
    /// Cancel safe.
    pub async fn fired(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Resolve once the process is asked to stop, naming what asked.
///
/// The SIGTERM handler is installed before this returns, so a termination
/// request arriving before the future is first polled is not lost.
#[cfg(unix)]
pub fn shutdown_requested() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        let interrupted = tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => return "SIGTERM",
        };
        if let Err(e) = interrupted {
            log::error!("Failed to listen for Ctrl-C, waiting for SIGTERM only: {}", e);
            terminate.recv().await;
            return "SIGTERM";
        }
        "Ctrl-C"
    })
}

#[cfg(not(unix))]
pub fn shutdown_requested() -> std::io::Result<impl Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_wakes_all_listeners() {
        let signal = Signal::new();
        let mut a = signal.listener();
        let mut b = signal.listener();

        let waiter_a = tokio::spawn(async move { a.fired().await });
        let waiter_b = tokio::spawn(async move { b.fired().await });

        assert!(signal.fire());
        waiter_a.await.unwrap();
        waiter_b.await.unwrap();
    }

    #[tokio::test]
    async fn test_fire_is_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_late_listener_sees_fired_signal() {
        let signal = Signal::new();
        signal.fire();

        let mut late = signal.listener();
        assert!(late.is_fired());
        tokio::time::timeout(Duration::from_millis(50), late.fired())
            .await
            .expect("already fired signal must not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfired_signal_blocks() {
        let signal = Signal::new();
        let mut listener = signal.listener();

        let result = tokio::time::timeout(Duration::from_secs(1), listener.fired()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropped_signal_counts_as_fired() {
        let signal = Signal::new();
        let mut listener = signal.listener();
        drop(signal);
        listener.fired().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let requested = shutdown_requested().unwrap();
        // SAFETY: raising a signal this process has a handler for.
        let raised = unsafe { libc::raise(libc::SIGTERM) };
        assert_eq!(raised, 0);

        let cause = tokio::time::timeout(Duration::from_secs(5), requested)
            .await
            .expect("SIGTERM must request shutdown");
        assert_eq!(cause, "SIGTERM");
    }
}
