//! Zap Protocol Definitions
//!
//! This crate defines the control messages exchanged between zap clients and
//! servers, and the type-byte framed codec that carries them.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, MsgCtl, HEADER_LEN};
pub use messages::*;

/// Protocol version announced in Login and LoginResp
pub const PROTOCOL_VERSION: &str = "0.1.0";
