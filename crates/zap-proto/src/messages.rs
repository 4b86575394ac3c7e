//! Protocol message types
//!
//! Every control-plane payload is a plain struct; [`Message`] is the closed set
//! of them. The concrete variant travelling on the wire is identified only by
//! the frame's type byte (see [`crate::codec::MsgCtl`]), so the structs carry
//! no tag of their own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

/// Identity and capability record sent once per control connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Login {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    pub os: String,
    pub arch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
    /// Empty on first login; the server assigns one
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metas: HashMap<String, String>,
    pub pool_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Proxy declaration sent by a client over its control connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: String,
    #[serde(skip_serializing_if = "is_false")]
    pub use_encryption: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub use_compression: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metas: HashMap<String, String>,

    // tcp
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub remote_port: u16,

    // stcp
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sk: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_users: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CloseProxy {
    pub proxy_name: String,
}

/// First message on a work connection dialed by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewWorkConn {
    pub run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReqWorkConn {}

/// Sent by the server on a pooled work connection right before user traffic
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StartWorkConn {
    pub proxy_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dst_addr: String,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub src_port: u16,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub dst_port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// First message on a visitor connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewVisitorConn {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    pub use_encryption: bool,
    pub use_compression: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ping {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Pong {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Discriminant of [`Message`], used as the key of the type registry and of
/// dispatcher handler tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Login,
    LoginResp,
    NewProxy,
    NewProxyResp,
    CloseProxy,
    NewWorkConn,
    ReqWorkConn,
    StartWorkConn,
    NewVisitorConn,
    NewVisitorConnResp,
    Ping,
    Pong,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Login,
        MessageKind::LoginResp,
        MessageKind::NewProxy,
        MessageKind::NewProxyResp,
        MessageKind::CloseProxy,
        MessageKind::NewWorkConn,
        MessageKind::ReqWorkConn,
        MessageKind::StartWorkConn,
        MessageKind::NewVisitorConn,
        MessageKind::NewVisitorConnResp,
        MessageKind::Ping,
        MessageKind::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Login => "Login",
            MessageKind::LoginResp => "LoginResp",
            MessageKind::NewProxy => "NewProxy",
            MessageKind::NewProxyResp => "NewProxyResp",
            MessageKind::CloseProxy => "CloseProxy",
            MessageKind::NewWorkConn => "NewWorkConn",
            MessageKind::ReqWorkConn => "ReqWorkConn",
            MessageKind::StartWorkConn => "StartWorkConn",
            MessageKind::NewVisitorConn => "NewVisitorConn",
            MessageKind::NewVisitorConnResp => "NewVisitorConnResp",
            MessageKind::Ping => "Ping",
            MessageKind::Pong => "Pong",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main control protocol message enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Login(_) => MessageKind::Login,
            Message::LoginResp(_) => MessageKind::LoginResp,
            Message::NewProxy(_) => MessageKind::NewProxy,
            Message::NewProxyResp(_) => MessageKind::NewProxyResp,
            Message::CloseProxy(_) => MessageKind::CloseProxy,
            Message::NewWorkConn(_) => MessageKind::NewWorkConn,
            Message::ReqWorkConn(_) => MessageKind::ReqWorkConn,
            Message::StartWorkConn(_) => MessageKind::StartWorkConn,
            Message::NewVisitorConn(_) => MessageKind::NewVisitorConn,
            Message::NewVisitorConnResp(_) => MessageKind::NewVisitorConnResp,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
        }
    }

    /// Serialize the payload (without framing)
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Message::Login(m) => serde_json::to_vec(m),
            Message::LoginResp(m) => serde_json::to_vec(m),
            Message::NewProxy(m) => serde_json::to_vec(m),
            Message::NewProxyResp(m) => serde_json::to_vec(m),
            Message::CloseProxy(m) => serde_json::to_vec(m),
            Message::NewWorkConn(m) => serde_json::to_vec(m),
            Message::ReqWorkConn(m) => serde_json::to_vec(m),
            Message::StartWorkConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConnResp(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
        }
    }

    /// Deserialize a payload whose variant is already known from the type byte
    pub fn from_payload(kind: MessageKind, payload: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            MessageKind::Login => Message::Login(serde_json::from_slice(payload)?),
            MessageKind::LoginResp => Message::LoginResp(serde_json::from_slice(payload)?),
            MessageKind::NewProxy => Message::NewProxy(serde_json::from_slice(payload)?),
            MessageKind::NewProxyResp => Message::NewProxyResp(serde_json::from_slice(payload)?),
            MessageKind::CloseProxy => Message::CloseProxy(serde_json::from_slice(payload)?),
            MessageKind::NewWorkConn => Message::NewWorkConn(serde_json::from_slice(payload)?),
            MessageKind::ReqWorkConn => Message::ReqWorkConn(serde_json::from_slice(payload)?),
            MessageKind::StartWorkConn => {
                Message::StartWorkConn(serde_json::from_slice(payload)?)
            }
            MessageKind::NewVisitorConn => {
                Message::NewVisitorConn(serde_json::from_slice(payload)?)
            }
            MessageKind::NewVisitorConnResp => {
                Message::NewVisitorConnResp(serde_json::from_slice(payload)?)
            }
            MessageKind::Ping => Message::Ping(serde_json::from_slice(payload)?),
            MessageKind::Pong => Message::Pong(serde_json::from_slice(payload)?),
        })
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_from_payload!(
    Login,
    LoginResp,
    NewProxy,
    NewProxyResp,
    CloseProxy,
    NewWorkConn,
    ReqWorkConn,
    StartWorkConn,
    NewVisitorConn,
    NewVisitorConnResp,
    Ping,
    Pong,
);
