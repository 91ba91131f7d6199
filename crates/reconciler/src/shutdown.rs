//! Shutdown signalling for controllers.
//!
//! Controllers stop taking new keys once signalled and let in-flight passes
//! finish; no pass is cancelled midway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{error, info};

/// Broadcasts a one-shot stop signal to every controller.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    initiated: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receiver to hand to [`crate::Controller::run`].
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }

    /// Signal every subscriber. Repeated calls are ignored.
    pub fn trigger(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(subscribers = self.tx.receiver_count(), "Shutting down controllers");
        self.tx.send_replace(true);
    }

    /// Trigger on SIGTERM or Ctrl+C.
    pub fn install_signal_handlers(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};

                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "Failed to install SIGTERM handler");
                        return;
                    }
                };

                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => info!("Received SIGINT"),
                        Err(e) => {
                            error!(error = %e, "Failed to listen for Ctrl+C");
                            return;
                        }
                    },
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                info!("Received Ctrl+C");
            }

            shutdown.trigger();
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until `rx` reports shutdown or its sender is gone.
pub(crate) async fn wait_for(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
