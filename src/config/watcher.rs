//! Route table reload on config file change or SIGHUP.
//!
//! The notify callback runs on the watcher's own thread; it only loads and
//! validates, then hands the result to the control task over a channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::RouterConfig;

pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<RouterConfig>,
}

impl ConfigWatcher {
    /// Watcher for `path` and the receiver of every config that loads and
    /// validates after a change.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<RouterConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            update_tx,
        };
        (watcher, update_rx)
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        ReloadHandle {
            path: self.path.clone(),
            update_tx: self.update_tx.clone(),
        }
    }

    /// Start watching. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let handle = self.reload_handle();
        let on_event = move |res: notify::Result<Event>| match res {
            Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                tracing::info!(path = ?handle.path, "Config file changed");
                handle.reload();
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Config watch error"),
        };

        let config = Config::default().with_poll_interval(Duration::from_secs(2));
        let mut watcher = RecommendedWatcher::new(on_event, config)?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Watching config file");
        Ok(watcher)
    }
}

/// Loads the config file on demand and publishes it when valid.
#[derive(Clone)]
pub struct ReloadHandle {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<RouterConfig>,
}

impl ReloadHandle {
    pub fn reload(&self) {
        match load_config(&self.path) {
            Ok(config) => {
                if self.update_tx.send(config).is_err() {
                    tracing::debug!("Config update receiver gone");
                }
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Reload rejected, keeping current routes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_publishes_valid_config() {
        let path = std::env::temp_dir().join(format!("sip-router-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "concurrency = 3\n").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(&path);
        watcher.reload_handle().reload();
        let config = rx.try_recv().unwrap();
        assert_eq!(config.concurrency, 3);

        std::fs::write(&path, "concurrency = 0\n").unwrap();
        watcher.reload_handle().reload();
        assert!(rx.try_recv().is_err());

        let _ = std::fs::remove_file(&path);
    }
}
