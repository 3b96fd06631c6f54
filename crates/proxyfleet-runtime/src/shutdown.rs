//! Interrupt/terminate handling for the control loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Receiving side: the control loop sleeps on this between ticks.
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    rx: Receiver<()>,
}

/// Sending side, handed to the signal handler (or to a test).
#[derive(Clone)]
pub struct ShutdownTrigger {
    requested: Arc<AtomicBool>,
    tx: SyncSender<()>,
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // A full channel already holds a wakeup.
        let _ = self.tx.try_send(());
    }
}

impl ShutdownSignal {
    pub fn new() -> (Self, ShutdownTrigger) {
        let requested = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(1);
        (
            Self {
                requested: requested.clone(),
                rx,
            },
            ShutdownTrigger { requested, tx },
        )
    }

    /// Route SIGINT and SIGTERM to this signal.
    pub fn install() -> Result<Self> {
        let (signal, trigger) = Self::new();
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            trigger.fire();
        })
        .context("Failed to install signal handler")?;
        Ok(signal)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`. Returns true if shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_requested(),
        }
    }
}
