//! Metrics sink for server events

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::lock;

/// Receives server lifecycle events
///
/// All methods default to doing nothing.
pub trait MetricsSink: Send + Sync {
    fn new_client(&self) {}

    fn close_client(&self) {}

    fn new_proxy(&self, _name: &str, _proxy_type: &str) {}

    fn close_proxy(&self, _name: &str, _proxy_type: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// In-memory counters
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    clients: AtomicI64,
    proxies: Mutex<HashMap<String, String>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> i64 {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn proxy_count(&self) -> usize {
        lock(&self.proxies).len()
    }

    pub fn proxy_type(&self, name: &str) -> Option<String> {
        lock(&self.proxies).get(name).cloned()
    }
}

impl MetricsSink for MemoryMetrics {
    fn new_client(&self) {
        self.clients.fetch_add(1, Ordering::SeqCst);
    }

    fn close_client(&self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }

    fn new_proxy(&self, name: &str, proxy_type: &str) {
        lock(&self.proxies).insert(name.to_string(), proxy_type.to_string());
    }

    fn close_proxy(&self, name: &str, _proxy_type: &str) {
        lock(&self.proxies).remove(name);
    }
}
