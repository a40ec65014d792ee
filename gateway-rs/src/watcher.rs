//! Rules file watcher for hot reload.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{GatewayError, Result};
use crate::rules::RuleSet;

/// Monitors the rules file and emits every version that parses.
///
/// The parent directory is watched rather than the file itself so editors
/// that save by rename keep triggering reloads.
pub struct RulesWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<RuleSet>,
}

impl RulesWatcher {
    /// Returns the watcher and a receiver for parsed rule sets.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<RuleSet>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !relevant {
                        return;
                    }
                    debug!(path = ?path, kind = ?event.kind, "Rules file changed");
                    match RuleSet::from_file(&path) {
                        Ok(rules) => {
                            let _ = tx.send(rules);
                        }
                        Err(e) => error!(error = %e, "Failed to read rules, keeping current snapshot"),
                    }
                }
                Err(e) => error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| GatewayError::Config(format!("Failed to create rules watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::Config(format!("Failed to watch {}: {}", dir.display(), e)))?;

        info!(path = ?self.path, "Rules watcher started");
        Ok(watcher)
    }
}
