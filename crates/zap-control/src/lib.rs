//! Server core of the zap relay
//!
//! Accepts client connections, runs one control session per logged-in
//! client, pools their work connections, and routes visitor connections to
//! the internal listeners of secret proxies.
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod hook;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod service;
pub mod task_tracker;
pub mod visitor;

pub use config::{generate_response_error_string, HttpPluginConfig, ServerConfig, ServerTransportConfig};
pub use control::{Control, ControlContext, ControlError, ControlState};
pub use dispatcher::{async_handler, handler, Dispatcher, DispatcherError, Handler};
pub use hook::{HookContent, HookError, HookManager, HookResponse, HttpPlugin, Op, Plugin};
pub use metrics::{MemoryMetrics, MetricsSink, NoopMetrics};
pub use proxy::{ProxyError, ProxyManager, ProxyRegistrar};
pub use registry::ControlManager;
pub use service::{Service, ServiceError};
pub use task_tracker::TaskTracker;
pub use visitor::{Admission, RejectedConn, VisitorError, VisitorManager};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
