//! Codec for encoding/decoding control messages
//!
//! Frame format: `[type: u8][length: i64 big-endian][payload: JSON]`

use crate::messages::{Message, MessageKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the `[type][length]` frame header
pub const HEADER_LEN: usize = 9;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown message type byte: 0x{0:02x}")]
    UnknownType(u8),

    #[error("Message kind {0} is not registered")]
    UnregisteredKind(MessageKind),

    #[error("Type byte 0x{0:02x} is already registered")]
    DuplicateType(u8),

    #[error("Message kind {0} is already registered")]
    DuplicateKind(MessageKind),

    #[error("Message kind {0} has no type byte")]
    MissingKind(MessageKind),

    #[error("Message length out of range: {0}")]
    LengthOutOfRange(i64),

    #[error("Truncated message: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// True when the peer simply went away between frames
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Bijective registry between type bytes and message kinds
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct MsgCtl {
    type_map: HashMap<u8, MessageKind>,
    type_byte_map: HashMap<MessageKind, u8>,
    max_msg_length: i64,
}

impl MsgCtl {
    /// Default upper bound of a frame payload
    pub const DEFAULT_MAX_MSG_LENGTH: i64 = 10240;

    /// Standard type byte assignment
    pub const STANDARD_TYPES: [(u8, MessageKind); 12] = [
        (b'o', MessageKind::Login),
        (b'1', MessageKind::LoginResp),
        (b'p', MessageKind::NewProxy),
        (b'2', MessageKind::NewProxyResp),
        (b'c', MessageKind::CloseProxy),
        (b'w', MessageKind::NewWorkConn),
        (b'r', MessageKind::ReqWorkConn),
        (b's', MessageKind::StartWorkConn),
        (b'v', MessageKind::NewVisitorConn),
        (b'3', MessageKind::NewVisitorConnResp),
        (b'h', MessageKind::Ping),
        (b'4', MessageKind::Pong),
    ];

    /// Empty registry
    pub fn new() -> Self {
        Self {
            type_map: HashMap::new(),
            type_byte_map: HashMap::new(),
            max_msg_length: Self::DEFAULT_MAX_MSG_LENGTH,
        }
    }

    /// Registry with every message kind under its standard type byte
    pub fn standard() -> Result<Self, CodecError> {
        Self::from_table(&Self::STANDARD_TYPES)
    }

    /// Build a registry from a table, requiring a complete bijection
    pub fn from_table(table: &[(u8, MessageKind)]) -> Result<Self, CodecError> {
        let mut ctl = Self::new();
        for (type_byte, kind) in table {
            ctl.register(*type_byte, *kind)?;
        }
        ctl.ensure_complete()?;
        Ok(ctl)
    }

    /// Register one kind under one type byte; rejects reuse in either direction
    pub fn register(&mut self, type_byte: u8, kind: MessageKind) -> Result<(), CodecError> {
        if self.type_map.contains_key(&type_byte) {
            return Err(CodecError::DuplicateType(type_byte));
        }
        if self.type_byte_map.contains_key(&kind) {
            return Err(CodecError::DuplicateKind(kind));
        }
        self.type_map.insert(type_byte, kind);
        self.type_byte_map.insert(kind, type_byte);
        Ok(())
    }

    /// Fail unless every message kind has a type byte
    pub fn ensure_complete(&self) -> Result<(), CodecError> {
        match MessageKind::ALL
            .iter()
            .find(|kind| !self.type_byte_map.contains_key(kind))
        {
            Some(kind) => Err(CodecError::MissingKind(*kind)),
            None => Ok(()),
        }
    }

    pub fn with_max_msg_length(mut self, length: i64) -> Self {
        self.max_msg_length = length;
        self
    }

    pub fn max_msg_length(&self) -> i64 {
        self.max_msg_length
    }

    pub fn kind_of(&self, type_byte: u8) -> Option<MessageKind> {
        self.type_map.get(&type_byte).copied()
    }

    pub fn type_byte_of(&self, kind: MessageKind) -> Option<u8> {
        self.type_byte_map.get(&kind).copied()
    }

    fn check_length(&self, length: i64) -> Result<usize, CodecError> {
        if length < 0 || length > self.max_msg_length {
            return Err(CodecError::LengthOutOfRange(length));
        }
        Ok(length as usize)
    }

    /// Encode a message into one complete frame
    pub fn encode(&self, msg: &Message) -> Result<Bytes, CodecError> {
        let type_byte = self
            .type_byte_of(msg.kind())
            .ok_or(CodecError::UnregisteredKind(msg.kind()))?;
        let payload = msg.to_payload()?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(type_byte);
        buf.put_i64(payload.len() as i64);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error. The header is validated before the payload is buffered.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let type_byte = buf[0];
        let kind = self
            .kind_of(type_byte)
            .ok_or(CodecError::UnknownType(type_byte))?;

        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 8];
        length_bytes.copy_from_slice(&buf[1..HEADER_LEN]);
        let length = self.check_length(i64::from_be_bytes(length_bytes))?;

        if buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(length);

        Ok(Some(Message::from_payload(kind, &payload)?))
    }

    /// Decode exactly one frame from a complete buffer
    ///
    /// Unlike [`MsgCtl::decode`], a short buffer is an error here.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Message, CodecError> {
        let mut buf = BytesMut::from(frame);
        match self.decode(&mut buf)? {
            Some(msg) => Ok(msg),
            None if frame.len() < HEADER_LEN => Err(CodecError::Truncated {
                expected: HEADER_LEN,
                got: frame.len(),
            }),
            None => Err(CodecError::Truncated {
                expected: i64::from_be_bytes(frame[1..HEADER_LEN].try_into().unwrap_or_default())
                    as usize,
                got: frame.len() - HEADER_LEN,
            }),
        }
    }

    /// Read one frame from a stream
    pub async fn read_msg<R>(&self, reader: &mut R) -> Result<Message, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let type_byte = reader.read_u8().await?;
        let kind = self
            .kind_of(type_byte)
            .ok_or(CodecError::UnknownType(type_byte))?;

        let length = self.check_length(reader.read_i64().await?)?;

        let mut payload = vec![0u8; length];
        let mut got = 0;
        while got < length {
            let n = reader.read(&mut payload[got..]).await?;
            if n == 0 {
                return Err(CodecError::Truncated {
                    expected: length,
                    got,
                });
            }
            got += n;
        }

        Ok(Message::from_payload(kind, &payload)?)
    }

    /// Write one frame to a stream with a single write call
    pub async fn write_msg<W>(&self, writer: &mut W, msg: &Message) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = self.encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Default for MsgCtl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;

    fn ctl() -> MsgCtl {
        MsgCtl::standard().unwrap()
    }

    #[test]
    fn test_standard_table_is_bijective() {
        let ctl = ctl();
        for kind in MessageKind::ALL {
            let byte = ctl.type_byte_of(kind).unwrap();
            assert_eq!(ctl.kind_of(byte), Some(kind));
        }
    }

    #[test]
    fn test_duplicate_type_byte_rejected() {
        let mut ctl = MsgCtl::new();
        ctl.register(b'o', MessageKind::Login).unwrap();
        let err = ctl.register(b'o', MessageKind::Ping).unwrap_err();
        assert!(matches!(err, CodecError::DuplicateType(b'o')));
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut ctl = MsgCtl::new();
        ctl.register(b'o', MessageKind::Login).unwrap();
        let err = ctl.register(b'x', MessageKind::Login).unwrap_err();
        assert!(matches!(err, CodecError::DuplicateKind(MessageKind::Login)));
    }

    #[test]
    fn test_incomplete_table_rejected() {
        let err = MsgCtl::from_table(&MsgCtl::STANDARD_TYPES[..11]).unwrap_err();
        assert!(matches!(err, CodecError::MissingKind(MessageKind::Pong)));
    }

    #[test]
    fn test_encode_decode() {
        let msg = Message::Ping(Ping {
            privilege_key: "key".to_string(),
            timestamp: 12345,
        });

        let encoded = ctl().encode(&msg).unwrap();
        assert_eq!(encoded[0], b'h');
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = ctl().decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_encode_unregistered_kind() {
        let mut partial = MsgCtl::new();
        partial.register(b'h', MessageKind::Ping).unwrap();
        let err = partial.encode(&Message::Pong(Pong::default())).unwrap_err();
        assert!(matches!(err, CodecError::UnregisteredKind(MessageKind::Pong)));
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = Message::Pong(Pong {
            error: "boom".to_string(),
        });
        let encoded = ctl().encode(&msg).unwrap();

        // Only provide the header
        let mut buf = BytesMut::from(&encoded[..HEADER_LEN]);
        assert_eq!(ctl().decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[HEADER_LEN..]);
        assert_eq!(ctl().decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = BytesMut::from(&b"Z\0\0\0\0\0\0\0\x02{}"[..]);
        let err = ctl().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(b'Z')));
    }

    #[test]
    fn test_decode_negative_length() {
        let mut frame = vec![b'h'];
        frame.extend_from_slice(&(-1i64).to_be_bytes());
        let err = ctl().decode_frame(&frame).unwrap_err();
        assert!(matches!(err, CodecError::LengthOutOfRange(-1)));
    }

    #[test]
    fn test_decode_oversize_length() {
        let mut frame = vec![b'h'];
        frame.extend_from_slice(&(i64::MAX).to_be_bytes());
        let err = ctl().decode_frame(&frame).unwrap_err();
        assert!(matches!(err, CodecError::LengthOutOfRange(i64::MAX)));

        let small = ctl().with_max_msg_length(4);
        let frame = small.encode(&Message::Ping(Ping::default())).unwrap();
        assert!(small.decode_frame(&frame).is_ok());
        let frame = small
            .encode(&Message::Pong(Pong {
                error: "long error".to_string(),
            }))
            .unwrap();
        assert!(matches!(
            small.decode_frame(&frame),
            Err(CodecError::LengthOutOfRange(_))
        ));
    }

    #[test]
    fn test_decode_frame_truncated() {
        let frame = ctl()
            .encode(&Message::CloseProxy(CloseProxy {
                proxy_name: "web".to_string(),
            }))
            .unwrap();
        let err = ctl().decode_frame(&frame[..frame.len() - 2]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = Message::Ping(Ping::default());
        let msg2 = Message::ReqWorkConn(ReqWorkConn {});

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ctl().encode(&msg1).unwrap());
        buf.extend_from_slice(&ctl().encode(&msg2).unwrap());

        assert_eq!(ctl().decode(&mut buf).unwrap(), Some(msg1));
        assert_eq!(ctl().decode(&mut buf).unwrap(), Some(msg2));
        assert_eq!(ctl().decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let ctl = ctl();
        let msg = Message::NewProxy(NewProxy {
            proxy_name: "ssh".to_string(),
            proxy_type: "tcp".to_string(),
            remote_port: 6000,
            ..Default::default()
        });

        ctl.write_msg(&mut a, &msg).await.unwrap();
        let read = ctl.read_msg(&mut b).await.unwrap();
        assert_eq!(read, msg);
    }

    #[tokio::test]
    async fn test_stream_truncated() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let ctl = ctl();
        let frame = ctl
            .encode(&Message::Pong(Pong {
                error: "x".repeat(32),
            }))
            .unwrap();
        a.write_all(&frame[..frame.len() - 5]).await.unwrap();
        drop(a);

        let err = ctl.read_msg(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[tokio::test]
    async fn test_stream_oversize_rejected_before_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let ctl = ctl();
        // Declares a huge payload that never arrives
        let mut header = vec![b'p'];
        header.extend_from_slice(&(1i64 << 40).to_be_bytes());
        a.write_all(&header).await.unwrap();

        let err = ctl.read_msg(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::LengthOutOfRange(_)));
    }

    #[tokio::test]
    async fn test_stream_eof_between_frames() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = ctl().read_msg(&mut b).await.unwrap_err();
        assert!(err.is_eof());
    }
}
