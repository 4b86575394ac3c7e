//! Plugin that forwards events to an HTTP endpoint
//!
//! Request body: `{"version": "0.1.0", "op": "<Op>", "content": {...}}`.
//! Response body: `{"reject": bool, "reject_reason": str, "unchange": bool, "content": {...}}`.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::{HookContent, HookResponse, Op, Plugin, PluginError};
use crate::config::HttpPluginConfig;

const PLUGIN_API_VERSION: &str = "0.1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct PluginRequest<'a> {
    version: &'a str,
    op: Op,
    content: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PluginResponse {
    reject: bool,
    reject_reason: String,
    unchange: bool,
    content: Option<serde_json::Value>,
}

pub struct HttpPlugin {
    name: String,
    addr: String,
    path: String,
    ops: Vec<Op>,
}

impl HttpPlugin {
    pub fn new(config: &HttpPluginConfig) -> Self {
        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };
        Self {
            name: config.name.clone(),
            addr: config.addr.clone(),
            path,
            ops: config.ops.clone(),
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<Bytes, PluginError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| PluginError(format!("connect to {} failed: {}", self.addr, e)))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| PluginError(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("plugin connection closed: {}", e);
            }
        });

        let request = Request::post(self.path.as_str())
            .header("host", self.addr.as_str())
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| PluginError(format!("build request failed: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| PluginError(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PluginError(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        Ok(response
            .into_body()
            .collect()
            .await
            .map_err(|e| PluginError(format!("read response body failed: {}", e)))?
            .to_bytes())
    }
}

#[async_trait]
impl Plugin for HttpPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, op: Op) -> bool {
        self.ops.contains(&op)
    }

    async fn handle(&self, content: &HookContent) -> Result<HookResponse, PluginError> {
        let op = content.op();
        let request = PluginRequest {
            version: PLUGIN_API_VERSION,
            op,
            content: content
                .to_json()
                .map_err(|e| PluginError(format!("encode content failed: {}", e)))?,
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| PluginError(format!("encode request failed: {}", e)))?;

        let raw = tokio::time::timeout(REQUEST_TIMEOUT, self.post(body))
            .await
            .map_err(|_| PluginError("request timed out".to_string()))??;

        let response: PluginResponse = serde_json::from_slice(&raw)
            .map_err(|e| PluginError(format!("decode response failed: {}", e)))?;

        if response.reject {
            return Ok(HookResponse::Reject(response.reject_reason));
        }
        match response.content {
            Some(value) if !response.unchange => HookContent::from_json(op, value)
                .map(HookResponse::Rewritten)
                .map_err(|e| PluginError(format!("decode content failed: {}", e))),
            _ => Ok(HookResponse::Unchanged),
        }
    }
}
