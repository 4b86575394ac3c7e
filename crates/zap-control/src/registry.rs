//! Registry of active control sessions keyed by run id

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

use crate::control::Control;

/// At most one control session per run id
#[derive(Default)]
pub struct ControlManager {
    controls: RwLock<HashMap<String, Control>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `ctl` under `run_id`, returning the session it replaced
    ///
    /// The previous occupant is told it was replaced before the new entry
    /// becomes visible; its teardown runs on its own.
    pub async fn add(&self, run_id: &str, ctl: Control) -> Option<Control> {
        let mut controls = self.controls.write().await;
        let old = controls.get(run_id).cloned();
        if let Some(old) = &old {
            info!(run_id = %run_id, "replacing existing control session");
            old.replaced(&ctl);
        }
        controls.insert(run_id.to_string(), ctl);
        old
    }

    /// Remove `run_id` only if it still maps to `ctl`
    pub async fn del(&self, run_id: &str, ctl: &Control) -> bool {
        let mut controls = self.controls.write().await;
        match controls.get(run_id) {
            Some(current) if current.ptr_eq(ctl) => {
                controls.remove(run_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get_by_id(&self, run_id: &str) -> Option<Control> {
        self.controls.read().await.get(run_id).cloned()
    }

    /// Close every session and forget them all
    pub async fn close(&self) {
        let mut controls = self.controls.write().await;
        for (_, ctl) in controls.drain() {
            ctl.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.controls.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
