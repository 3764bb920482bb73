//! Debounced hot reload of the policy file.
//!
//! The corpus carries no file-notification dependency, so the watcher polls
//! the file's mtime. A detected change waits out a 300 ms debounce before
//! reloading, collapsing editor write bursts into one reload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::PolicyManager;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

/// Lifecycle handle for the policy file watcher. `stop` is idempotent and
/// the background task never keeps the process alive past shutdown.
pub struct PolicyWatcher {
    manager: Arc<PolicyManager>,
    stopped: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PolicyWatcher {
    #[must_use]
    pub fn new(manager: Arc<PolicyManager>) -> Self {
        Self {
            manager,
            stopped: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Start watching. Calling start on a running watcher is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::Release);

        let manager = Arc::clone(&self.manager);
        let stopped = Arc::clone(&self.stopped);
        *handle = Some(tokio::spawn(async move {
            let mut last_seen = file_mtime(&manager);
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                if stopped.load(Ordering::Acquire) {
                    return;
                }

                let current = file_mtime(&manager);
                if current == last_seen {
                    continue;
                }

                // Debounce: let the write settle, then take whatever mtime
                // the file has at the end of the window.
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                last_seen = file_mtime(&manager);
                let report = manager.reload();
                tracing::info!(
                    policies = report.policies_loaded,
                    errors = report.errors.len(),
                    "policy file reloaded"
                );
            }
        }));
    }

    /// Stop watching. Safe to call repeatedly or without a prior start.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PolicyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn file_mtime(manager: &PolicyManager) -> Option<SystemTime> {
    std::fs::metadata(manager.path())
        .and_then(|meta| meta.modified())
        .ok()
}
