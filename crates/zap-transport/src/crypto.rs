//! Per-frame AES-GCM encryption over a byte stream
//!
//! Every write is sealed as one frame:
//!
//! ```text
//! [u32 length, big-endian][12-byte nonce][ciphertext + 16-byte tag]
//! ```
//!
//! where `length` covers nonce and ciphertext. A fresh random nonce is drawn
//! for every frame. Reads always consume a whole frame before any plaintext
//! is released, so tampered or truncated frames never leak partial output.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

type Aes192Gcm = AesGcm<Aes192, U12>;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const LENGTH_LEN: usize = 4;

/// Largest plaintext accepted in one frame
pub const MAX_PLAINTEXT_LEN: usize = 64 * 1024;

const MAX_FRAME_BODY: usize = NONCE_LEN + MAX_PLAINTEXT_LEN + TAG_LEN;

/// Buffer size used when relaying plaintext into frames
const RELAY_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length {0}, expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),

    #[error("Short buffer: copied {copied} of {frame_len} plaintext bytes")]
    ShortBuffer { copied: usize, frame_len: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Decryption failed")]
    Decrypt,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Channel failed after an earlier decrypt or framing error")]
    ChannelFailed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<CryptoError> for io::Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

enum CipherKind {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// AEAD cipher chosen by key length
pub struct Cipher {
    kind: CipherKind,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self.kind {
            CipherKind::Aes128(_) => 128,
            CipherKind::Aes192(_) => 192,
            CipherKind::Aes256(_) => 256,
        };
        f.debug_struct("Cipher").field("bits", &bits).finish()
    }
}

impl Cipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());
        let kind = match key.len() {
            16 => CipherKind::Aes128(Box::new(Aes128Gcm::new_from_slice(key).map_err(invalid)?)),
            24 => CipherKind::Aes192(Box::new(Aes192Gcm::new_from_slice(key).map_err(invalid)?)),
            32 => CipherKind::Aes256(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?)),
            n => return Err(CryptoError::InvalidKeyLength(n)),
        };
        Ok(Self { kind })
    }

    /// 256-bit cipher keyed by SHA-256 of a shared secret
    pub fn from_secret(secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Self {
            kind: CipherKind::Aes256(Box::new(Aes256Gcm::new(&key.into()))),
        }
    }

    fn encrypt(&self, nonce: &Nonce<U12>, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.kind {
            CipherKind::Aes128(c) => c.encrypt(nonce, plaintext),
            CipherKind::Aes192(c) => c.encrypt(nonce, plaintext),
            CipherKind::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| CryptoError::Encrypt)
    }

    fn decrypt(&self, nonce: &Nonce<U12>, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.kind {
            CipherKind::Aes128(c) => c.decrypt(nonce, ciphertext),
            CipherKind::Aes192(c) => c.decrypt(nonce, ciphertext),
            CipherKind::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CryptoError::Decrypt)
    }

    /// Seal a plaintext into a complete frame, length header included
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CryptoError::InvalidFrame(format!(
                "plaintext of {} bytes exceeds {}",
                plaintext.len(),
                MAX_PLAINTEXT_LEN
            )));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self.encrypt(Nonce::from_slice(&nonce_bytes), plaintext)?;

        let body_len = NONCE_LEN + ciphertext.len();
        let mut frame = Vec::with_capacity(LENGTH_LEN + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a frame body (nonce followed by ciphertext)
    pub fn open_body(&self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidFrame(format!(
                "frame body of {} bytes is too short",
                body.len()
            )));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.decrypt(Nonce::from_slice(nonce), ciphertext)
    }

    /// Open a complete frame as produced by [`Cipher::seal`]
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < LENGTH_LEN {
            return Err(CryptoError::InvalidFrame("missing length header".to_string()));
        }
        let (header, body) = frame.split_at(LENGTH_LEN);
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if declared != body.len() {
            return Err(CryptoError::InvalidFrame(format!(
                "declared length {} does not match body of {} bytes",
                declared,
                body.len()
            )));
        }
        self.open_body(body)
    }
}

/// A byte stream whose writes and reads are sealed frames
///
/// Reads and writes are each serialized by their own lock, so the stream can
/// be shared between a reading and a writing task. A decrypt or framing error
/// poisons the stream: every later read or write fails with `ChannelFailed`.
pub struct EncryptedStream<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    cipher: Cipher,
    failed: AtomicBool,
}

impl<S> std::fmt::Debug for EncryptedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStream")
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl<S> EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Wrap `inner`; the key must be 16, 24 or 32 bytes
    pub fn new(inner: S, key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self::with_cipher(inner, Cipher::new(key)?))
    }

    pub fn with_cipher(inner: S, cipher: Cipher) -> Self {
        let (reader, writer) = tokio::io::split(inner);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cipher,
            failed: AtomicBool::new(false),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn check_failed(&self) -> Result<(), CryptoError> {
        if self.is_failed() {
            return Err(CryptoError::ChannelFailed);
        }
        Ok(())
    }

    /// Seal `plaintext` as one frame and write it
    pub async fn write_frame(&self, plaintext: &[u8]) -> Result<(), CryptoError> {
        self.check_failed()?;
        let frame = self.cipher.seal(plaintext)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one whole frame and return its plaintext
    ///
    /// Returns `Ok(None)` on a clean end of stream before a frame header.
    pub async fn read_frame_vec(&self) -> Result<Option<Vec<u8>>, CryptoError> {
        self.check_failed()?;
        let result = self.read_one_frame().await;
        if let Err(CryptoError::Decrypt | CryptoError::InvalidFrame(_)) = &result {
            self.failed.store(true, Ordering::Release);
        }
        result
    }

    async fn read_one_frame(&self) -> Result<Option<Vec<u8>>, CryptoError> {
        let mut reader = self.reader.lock().await;
        // A concurrent reader may have failed while this one waited on the lock
        self.check_failed()?;

        let mut header = [0u8; LENGTH_LEN];
        let mut got = 0;
        while got < LENGTH_LEN {
            let n = reader.read(&mut header[got..]).await?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(CryptoError::InvalidFrame("truncated length header".to_string()));
            }
            got += n;
        }

        let body_len = u32::from_be_bytes(header) as usize;
        if !(NONCE_LEN + TAG_LEN..=MAX_FRAME_BODY).contains(&body_len) {
            return Err(CryptoError::InvalidFrame(format!(
                "frame length {body_len} out of range"
            )));
        }

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                CryptoError::InvalidFrame("truncated frame".to_string())
            } else {
                CryptoError::Io(e)
            }
        })?;
        drop(reader);

        self.cipher.open_body(&body).map(Some)
    }

    /// Read one frame into `buf`
    ///
    /// When `buf` is smaller than the frame's plaintext, the prefix that fits
    /// is copied and `ShortBuffer` is returned; the rest of that frame is
    /// discarded. `Ok(0)` signals end of stream.
    pub async fn read_frame(&self, buf: &mut [u8]) -> Result<usize, CryptoError> {
        let Some(plaintext) = self.read_frame_vec().await? else {
            return Ok(0);
        };
        if plaintext.len() > buf.len() {
            buf.copy_from_slice(&plaintext[..buf.len()]);
            return Err(CryptoError::ShortBuffer {
                copied: buf.len(),
                frame_len: plaintext.len(),
            });
        }
        buf[..plaintext.len()].copy_from_slice(&plaintext);
        Ok(plaintext.len())
    }

    pub async fn shutdown(&self) -> Result<(), CryptoError> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    /// Relay between this stream and a plaintext peer until both directions end
    ///
    /// Returns (plaintext bytes read from self, plaintext bytes written to self).
    pub async fn join<T>(self, other: T) -> io::Result<(u64, u64)>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut other_reader, mut other_writer) = tokio::io::split(other);

        let inbound = async {
            let mut total = 0u64;
            while let Some(plaintext) = self.read_frame_vec().await? {
                other_writer.write_all(&plaintext).await?;
                total += plaintext.len() as u64;
            }
            other_writer.shutdown().await?;
            Ok::<_, io::Error>(total)
        };

        let outbound = async {
            let mut total = 0u64;
            let mut buf = vec![0u8; RELAY_CHUNK];
            loop {
                let n = other_reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                self.write_frame(&buf[..n]).await?;
                total += n as u64;
            }
            self.shutdown().await?;
            Ok::<_, io::Error>(total)
        };

        tokio::try_join!(inbound, outbound).map_err(|e| {
            debug!("encrypted relay ended with error: {}", e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn test_key_lengths() {
        assert!(Cipher::new(&[0u8; 16]).is_ok());
        assert!(Cipher::new(&[0u8; 24]).is_ok());
        assert!(Cipher::new(&[0u8; 32]).is_ok());
        assert!(matches!(
            Cipher::new(&[0u8; 20]),
            Err(CryptoError::InvalidKeyLength(20))
        ));
        assert!(matches!(
            Cipher::new(&[]),
            Err(CryptoError::InvalidKeyLength(0))
        ));
    }

    #[test]
    fn test_frame_layout() {
        let cipher = Cipher::new(&key()).unwrap();
        let frame = cipher.seal(b"hello").unwrap();
        let declared = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, NONCE_LEN + 5 + TAG_LEN);
        assert_eq!(frame.len(), 4 + declared);
    }

    #[test]
    fn test_nonce_is_fresh_per_frame() {
        let cipher = Cipher::new(&key()).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a[4..4 + NONCE_LEN], b[4..4 + NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let frame = Cipher::new(&key()).unwrap().seal(b"secret").unwrap();
        let other = Cipher::new(&[8u8; 32]).unwrap();
        assert!(matches!(other.open(&frame), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_secret_derived_key() {
        let a = Cipher::from_secret("sk");
        let b = Cipher::from_secret("sk");
        let frame = a.seal(b"payload").unwrap();
        assert_eq!(b.open(&frame).unwrap(), b"payload");
        assert!(Cipher::from_secret("other").open(&frame).is_err());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let left = EncryptedStream::new(a, &key()).unwrap();
        let right = EncryptedStream::new(b, &key()).unwrap();

        left.write_frame(b"first").await.unwrap();
        left.write_frame(b"second frame").await.unwrap();

        let mut buf = [0u8; 64];
        let n = right.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = right.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second frame");

        drop(left);
        assert_eq!(right.read_frame(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_short_buffer() {
        let (a, b) = tokio::io::duplex(4096);
        let left = EncryptedStream::new(a, &key()).unwrap();
        let right = EncryptedStream::new(b, &key()).unwrap();

        left.write_frame(b"0123456789").await.unwrap();
        left.write_frame(b"next").await.unwrap();

        let mut small = [0u8; 4];
        let err = right.read_frame(&mut small).await.unwrap_err();
        assert!(matches!(
            err,
            CryptoError::ShortBuffer {
                copied: 4,
                frame_len: 10
            }
        ));
        assert_eq!(&small, b"0123");

        // The next frame starts cleanly
        let n = right.read_frame(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"next");
    }

    #[tokio::test]
    async fn test_tampered_stream_is_fatal() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let right = EncryptedStream::new(b, &key()).unwrap();

        let mut frame = Cipher::new(&key()).unwrap().seal(b"data").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        raw.write_all(&frame).await.unwrap();

        let valid = Cipher::new(&key()).unwrap().seal(b"after").unwrap();
        raw.write_all(&valid).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(
            right.read_frame(&mut buf).await,
            Err(CryptoError::Decrypt)
        ));
        assert!(right.is_failed());

        // The valid frame queued behind the tampered one is never released
        assert!(matches!(
            right.read_frame_vec().await,
            Err(CryptoError::ChannelFailed)
        ));
        assert!(matches!(
            right.write_frame(b"reply").await,
            Err(CryptoError::ChannelFailed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let right = EncryptedStream::new(b, &key()).unwrap();

        let frame = Cipher::new(&key()).unwrap().seal(b"data").unwrap();
        raw.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(raw);

        let mut buf = [0u8; 64];
        assert!(matches!(
            right.read_frame(&mut buf).await,
            Err(CryptoError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_declared_length() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let right = EncryptedStream::new(b, &key()).unwrap();
        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let valid = Cipher::new(&key()).unwrap().seal(b"after").unwrap();
        raw.write_all(&valid).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(
            right.read_frame(&mut buf).await,
            Err(CryptoError::InvalidFrame(_))
        ));
        assert!(matches!(
            right.read_frame(&mut buf).await,
            Err(CryptoError::ChannelFailed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let left = std::sync::Arc::new(EncryptedStream::new(a, &key()).unwrap());
        let right = EncryptedStream::new(b, &key()).unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let left = left.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..16 {
                    left.write_frame(&[i; 1000]).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for _ in 0..128 {
            let frame = right.read_frame_vec().await.unwrap().unwrap();
            assert_eq!(frame.len(), 1000);
            assert!(frame.iter().all(|b| *b == frame[0]));
        }
    }

    #[tokio::test]
    async fn test_join_relays_plaintext() {
        let (visitor_raw, relay_raw) = tokio::io::duplex(1 << 16);
        let (service, mut service_peer) = tokio::io::duplex(1 << 16);

        let visitor = EncryptedStream::new(visitor_raw, &key()).unwrap();
        let relay = EncryptedStream::new(relay_raw, &key()).unwrap();
        let relay_task = tokio::spawn(relay.join(service));

        visitor.write_frame(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        service_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        service_peer.write_all(b"pong").await.unwrap();
        let reply = visitor.read_frame_vec().await.unwrap().unwrap();
        assert_eq!(reply, b"pong");

        visitor.shutdown().await.unwrap();
        drop(service_peer);
        let (inbound, outbound) = relay_task.await.unwrap().unwrap();
        assert_eq!((inbound, outbound), (4, 4));
    }

    proptest! {
        #[test]
        fn open_inverts_seal(plaintext in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let cipher = Cipher::new(&key()).unwrap();
            let frame = cipher.seal(&plaintext).unwrap();
            prop_assert_eq!(cipher.open(&frame).unwrap(), plaintext);
        }

        #[test]
        fn any_bit_flip_is_rejected(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            bit in any::<proptest::sample::Index>(),
        ) {
            let cipher = Cipher::new(&key()).unwrap();
            let mut frame = cipher.seal(&plaintext).unwrap();
            let bit = bit.index(frame.len() * 8);
            frame[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(cipher.open(&frame).is_err());
        }
    }
}
