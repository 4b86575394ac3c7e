//! Hook pipeline for protocol events
//!
//! Plugins are consulted in registration order for the events they support.
//! Each may pass the content through, rewrite it for the next plugin, or
//! reject the event outright.

mod http;

pub use http::HttpPlugin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use zap_proto::{CloseProxy, Login, NewProxy, NewWorkConn, Ping};

/// Protocol events a plugin can hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Login,
    NewProxy,
    CloseProxy,
    Ping,
    NewWorkConn,
    NewUserConn,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Login => "Login",
            Op::NewProxy => "NewProxy",
            Op::CloseProxy => "CloseProxy",
            Op::Ping => "Ping",
            Op::NewWorkConn => "NewWorkConn",
            Op::NewUserConn => "NewUserConn",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the client an event belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    pub user: String,
    pub metas: HashMap<String, String>,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginContent {
    #[serde(flatten)]
    pub login: Login,
    pub client_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxyContent {
    pub user: UserInfo,
    #[serde(flatten)]
    pub new_proxy: NewProxy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseProxyContent {
    pub user: UserInfo,
    #[serde(flatten)]
    pub close_proxy: CloseProxy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingContent {
    pub user: UserInfo,
    #[serde(flatten)]
    pub ping: Ping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkConnContent {
    pub user: UserInfo,
    #[serde(flatten)]
    pub new_work_conn: NewWorkConn,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUserConnContent {
    pub user: UserInfo,
    pub proxy_name: String,
    pub proxy_type: String,
    pub remote_addr: String,
}

/// Event payload handed to plugins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookContent {
    Login(LoginContent),
    NewProxy(NewProxyContent),
    CloseProxy(CloseProxyContent),
    Ping(PingContent),
    NewWorkConn(NewWorkConnContent),
    NewUserConn(NewUserConnContent),
}

impl HookContent {
    pub fn op(&self) -> Op {
        match self {
            HookContent::Login(_) => Op::Login,
            HookContent::NewProxy(_) => Op::NewProxy,
            HookContent::CloseProxy(_) => Op::CloseProxy,
            HookContent::Ping(_) => Op::Ping,
            HookContent::NewWorkConn(_) => Op::NewWorkConn,
            HookContent::NewUserConn(_) => Op::NewUserConn,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            HookContent::Login(c) => serde_json::to_value(c),
            HookContent::NewProxy(c) => serde_json::to_value(c),
            HookContent::CloseProxy(c) => serde_json::to_value(c),
            HookContent::Ping(c) => serde_json::to_value(c),
            HookContent::NewWorkConn(c) => serde_json::to_value(c),
            HookContent::NewUserConn(c) => serde_json::to_value(c),
        }
    }

    pub fn from_json(op: Op, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match op {
            Op::Login => HookContent::Login(serde_json::from_value(value)?),
            Op::NewProxy => HookContent::NewProxy(serde_json::from_value(value)?),
            Op::CloseProxy => HookContent::CloseProxy(serde_json::from_value(value)?),
            Op::Ping => HookContent::Ping(serde_json::from_value(value)?),
            Op::NewWorkConn => HookContent::NewWorkConn(serde_json::from_value(value)?),
            Op::NewUserConn => HookContent::NewUserConn(serde_json::from_value(value)?),
        })
    }
}

/// A plugin's verdict on one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResponse {
    Unchanged,
    Rewritten(HookContent),
    Reject(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    /// Rejected by a plugin; carries the plugin's reason
    #[error("{0}")]
    Rejected(String),

    /// A plugin could not be reached or answered garbage
    #[error("send {0} request to plugin error")]
    Plugin(Op),

    #[error("plugin returned {got} content for {op}")]
    UnexpectedContent { op: Op, got: Op },
}

/// Failure inside a single plugin call
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, op: Op) -> bool;

    async fn handle(&self, content: &HookContent) -> Result<HookResponse, PluginError>;
}

/// Ordered plugin chains, one per event
#[derive(Default)]
pub struct HookManager {
    plugins: HashMap<Op, Vec<Arc<dyn Plugin>>>,
}

const ALL_OPS: [Op; 6] = [
    Op::Login,
    Op::NewProxy,
    Op::CloseProxy,
    Op::Ping,
    Op::NewWorkConn,
    Op::NewUserConn,
];

macro_rules! typed_hook {
    ($(#[$doc:meta])* $fn_name:ident, $variant:ident, $content:ty) => {
        $(#[$doc])*
        pub async fn $fn_name(&self, content: $content) -> Result<$content, HookError> {
            match self.run(HookContent::$variant(content)).await? {
                HookContent::$variant(c) => Ok(c),
                other => Err(HookError::UnexpectedContent {
                    op: Op::$variant,
                    got: other.op(),
                }),
            }
        }
    };
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin to the chain of every event it supports
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        for op in ALL_OPS {
            if plugin.supports(op) {
                self.plugins.entry(op).or_default().push(plugin.clone());
            }
        }
    }

    pub fn plugin_count(&self, op: Op) -> usize {
        self.plugins.get(&op).map_or(0, Vec::len)
    }

    /// Run the chain for the content's event
    pub async fn run(&self, mut content: HookContent) -> Result<HookContent, HookError> {
        let op = content.op();
        let Some(plugins) = self.plugins.get(&op).filter(|p| !p.is_empty()) else {
            return Ok(content);
        };

        let reqid = uuid::Uuid::new_v4().simple().to_string();
        debug!(reqid = %reqid, op = %op, "running plugins");

        for plugin in plugins {
            let response = plugin.handle(&content).await.map_err(|e| {
                warn!(
                    reqid = %reqid,
                    plugin = %plugin.name(),
                    "send {} request to plugin error: {}",
                    op,
                    e
                );
                HookError::Plugin(op)
            })?;

            match response {
                HookResponse::Unchanged => {}
                HookResponse::Rewritten(next) => {
                    if next.op() != op {
                        return Err(HookError::UnexpectedContent { op, got: next.op() });
                    }
                    content = next;
                }
                HookResponse::Reject(reason) => {
                    debug!(reqid = %reqid, plugin = %plugin.name(), "rejected: {}", reason);
                    return Err(HookError::Rejected(reason));
                }
            }
        }
        Ok(content)
    }

    typed_hook!(login, Login, LoginContent);
    typed_hook!(new_proxy, NewProxy, NewProxyContent);
    typed_hook!(
        /// Close notifications cannot be vetoed; callers only log failures
        close_proxy,
        CloseProxy,
        CloseProxyContent
    );
    typed_hook!(ping, Ping, PingContent);
    typed_hook!(new_work_conn, NewWorkConn, NewWorkConnContent);
    typed_hook!(new_user_conn, NewUserConn, NewUserConnContent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FnPlugin<F> {
        name: &'static str,
        ops: Vec<Op>,
        calls: AtomicUsize,
        f: F,
    }

    impl<F> FnPlugin<F>
    where
        F: Fn(&HookContent) -> Result<HookResponse, PluginError> + Send + Sync,
    {
        fn new(name: &'static str, ops: Vec<Op>, f: F) -> Arc<Self> {
            Arc::new(Self {
                name,
                ops,
                calls: AtomicUsize::new(0),
                f,
            })
        }
    }

    #[async_trait]
    impl<F> Plugin for FnPlugin<F>
    where
        F: Fn(&HookContent) -> Result<HookResponse, PluginError> + Send + Sync,
    {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, op: Op) -> bool {
            self.ops.contains(&op)
        }

        async fn handle(&self, content: &HookContent) -> Result<HookResponse, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.f)(content)
        }
    }

    fn new_proxy_content(name: &str) -> NewProxyContent {
        NewProxyContent {
            user: UserInfo {
                user: "alice".to_string(),
                ..Default::default()
            },
            new_proxy: NewProxy {
                proxy_name: name.to_string(),
                proxy_type: "tcp".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_no_plugins_is_identity() {
        let manager = HookManager::new();
        let content = new_proxy_content("web");
        assert_eq!(manager.new_proxy(content.clone()).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_chain_sees_rewrites_in_order() {
        let mut manager = HookManager::new();
        manager.register(FnPlugin::new("prefix", vec![Op::NewProxy], |c: &HookContent| {
            let HookContent::NewProxy(mut c) = c.clone() else {
                return Ok(HookResponse::Unchanged);
            };
            c.new_proxy.proxy_name = format!("a.{}", c.new_proxy.proxy_name);
            Ok(HookResponse::Rewritten(HookContent::NewProxy(c)))
        }));
        manager.register(FnPlugin::new("suffix", vec![Op::NewProxy], |c: &HookContent| {
            let HookContent::NewProxy(mut c) = c.clone() else {
                return Ok(HookResponse::Unchanged);
            };
            c.new_proxy.proxy_name = format!("{}.b", c.new_proxy.proxy_name);
            Ok(HookResponse::Rewritten(HookContent::NewProxy(c)))
        }));

        let out = manager.new_proxy(new_proxy_content("web")).await.unwrap();
        assert_eq!(out.new_proxy.proxy_name, "a.web.b");
    }

    #[tokio::test]
    async fn test_reject_short_circuits() {
        let mut manager = HookManager::new();
        let rejecter = FnPlugin::new("deny", vec![Op::NewProxy], |_: &HookContent| {
            Ok(HookResponse::Reject("port not allowed".to_string()))
        });
        let after = FnPlugin::new("after", vec![Op::NewProxy], |_: &HookContent| Ok(HookResponse::Unchanged));
        manager.register(rejecter.clone());
        manager.register(after.clone());

        let err = manager.new_proxy(new_proxy_content("web")).await.unwrap_err();
        assert_eq!(err, HookError::Rejected("port not allowed".to_string()));
        assert_eq!(err.to_string(), "port not allowed");
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_plugin_error_is_generic() {
        let mut manager = HookManager::new();
        manager.register(FnPlugin::new("broken", vec![Op::Ping], |_: &HookContent| {
            Err(PluginError("connection refused to 10.0.0.1".to_string()))
        }));

        let err = manager.ping(PingContent::default()).await.unwrap_err();
        assert_eq!(err, HookError::Plugin(Op::Ping));
        assert_eq!(err.to_string(), "send Ping request to plugin error");
    }

    #[tokio::test]
    async fn test_only_supporting_plugins_run() {
        let mut manager = HookManager::new();
        let login_only = FnPlugin::new("login", vec![Op::Login], |_: &HookContent| Ok(HookResponse::Unchanged));
        manager.register(login_only.clone());
        assert_eq!(manager.plugin_count(Op::Login), 1);
        assert_eq!(manager.plugin_count(Op::Ping), 0);

        manager.ping(PingContent::default()).await.unwrap();
        assert_eq!(login_only.calls.load(Ordering::SeqCst), 0);
        manager.login(LoginContent::default()).await.unwrap();
        assert_eq!(login_only.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rewrite_with_wrong_kind_fails() {
        let mut manager = HookManager::new();
        manager.register(FnPlugin::new("confused", vec![Op::Ping], |_: &HookContent| {
            Ok(HookResponse::Rewritten(HookContent::Login(LoginContent::default())))
        }));
        let err = manager.ping(PingContent::default()).await.unwrap_err();
        assert!(matches!(err, HookError::UnexpectedContent { .. }));
    }

    #[test]
    fn test_content_json_shape() {
        let value = HookContent::NewProxy(new_proxy_content("web"))
            .to_json()
            .unwrap();
        assert_eq!(value["user"]["user"], "alice");
        assert_eq!(value["proxy_name"], "web");
        assert_eq!(value["proxy_type"], "tcp");

        let back = HookContent::from_json(Op::NewProxy, value).unwrap();
        assert_eq!(back, HookContent::NewProxy(new_proxy_content("web")));
    }
}
