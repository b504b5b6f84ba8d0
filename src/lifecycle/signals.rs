//! Unix signals the control task reacts to.
//!
//! SIGTERM and SIGINT stop the proxy. SIGHUP reloads the route table.

use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

pub struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
}

impl Signals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal of interest.
    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.terminate.recv() => {
                tracing::info!("SIGTERM received");
                SignalEvent::Shutdown
            }
            _ = self.interrupt.recv() => {
                tracing::info!("SIGINT received");
                SignalEvent::Shutdown
            }
            _ = self.hangup.recv() => {
                tracing::info!("SIGHUP received");
                SignalEvent::Reload
            }
        }
    }
}
