//! Process-wide stop signal for workers and downstream connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Every worker's accept loop and audit timer, and every downstream
/// connection task, holds a receiver. Clones share one trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Fire once; repeated calls (SIGINT after SIGTERM) do nothing.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::info!(listeners = self.tx.receiver_count(), "Stopping workers");
        if self.tx.send(()).is_err() {
            tracing::debug!("No task was waiting for shutdown");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Tasks still holding a receiver.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
