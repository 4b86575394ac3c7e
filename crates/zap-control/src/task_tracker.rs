//! Task tracking for proxy background tasks
//!
//! Keeps the JoinHandle of each proxy's accept loop so the loop can be
//! aborted when the proxy is closed.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

use crate::lock;

/// Tracks background tasks keyed by proxy name
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Track a task, aborting any previous one under the same name
    pub fn register(&self, name: String, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        if let Some(old_handle) = tasks.insert(name, handle) {
            old_handle.abort();
        }
    }

    /// Abort and forget the task under `name`
    pub fn unregister(&self, name: &str) {
        if let Some(handle) = lock(&self.tasks).remove(name) {
            handle.abort();
        }
    }

    pub fn abort_all(&self) {
        for (_, handle) in lock(&self.tasks).drain() {
            handle.abort();
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
