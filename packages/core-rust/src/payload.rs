//! Payload compression and encryption applied around the frame header flags.
//!
//! Outbound order is encrypt, then compress; inbound order is the reverse.
//! Only framed messages are transformed, since header-less messages have no
//! flag byte to record what was done.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::frame::{FLAG_COMPRESSED, FLAG_ENCRYPTED};
use crate::message::Message;

const NONCE_LEN: usize = 12;

/// Errors raised while sealing or unsealing a payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("gzip compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("gzip decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decompressed payload exceeds {limit} bytes")]
    DecompressedTooLarge { limit: usize },
    #[error("payload encryption failed")]
    Encrypt,
    #[error("payload decryption failed")]
    Decrypt,
    #[error("payload is flagged encrypted but no cipher is configured")]
    MissingCipher,
}

/// Symmetric cipher used for the encrypted flag.
pub trait PayloadCipher: Send + Sync + fmt::Debug {
    /// Encrypts `plain`, returning a self-contained sealed buffer.
    ///
    /// # Errors
    ///
    /// Returns `PayloadError::Encrypt` if the cipher rejects the input.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, PayloadError>;

    /// Reverses [`PayloadCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `PayloadError::Decrypt` on truncated or tampered input.
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, PayloadError>;
}

/// ChaCha20-Poly1305 with a random 96-bit nonce prepended to each payload.
pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChaChaCipher")
    }
}

impl PayloadCipher for ChaChaCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, PayloadError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain)
            .map_err(|_| PayloadError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, PayloadError> {
        if sealed.len() < NONCE_LEN {
            return Err(PayloadError::Decrypt);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| PayloadError::Decrypt)
    }
}

/// Gzip-compresses `data`.
///
/// # Errors
///
/// Returns `PayloadError::Compress` if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).map_err(PayloadError::Compress)?;
    encoder.finish().map_err(PayloadError::Compress)
}

/// Inflates gzip `data`, refusing to produce more than `limit` bytes.
///
/// # Errors
///
/// Returns `PayloadError::Decompress` on corrupt input and
/// `PayloadError::DecompressedTooLarge` when the output would exceed `limit`.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, PayloadError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(PayloadError::Decompress)?;
    if out.len() > limit {
        return Err(PayloadError::DecompressedTooLarge { limit });
    }
    Ok(out)
}

/// Process-wide payload policy: automatic encryption, automatic compression
/// above a length threshold, and the inverse transforms on receipt.
#[derive(Debug, Clone)]
pub struct PayloadTransform {
    auto_encrypt: bool,
    auto_compress_len: u32,
    max_payload: u32,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl PayloadTransform {
    /// A transform that never seals outbound payloads but can still unseal
    /// compressed input up to `max_payload` bytes.
    #[must_use]
    pub fn new(max_payload: u32) -> Self {
        Self {
            auto_encrypt: false,
            auto_compress_len: 0,
            max_payload,
            cipher: None,
        }
    }

    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    #[must_use]
    pub fn with_auto_encrypt(mut self, enabled: bool) -> Self {
        self.auto_encrypt = enabled;
        self
    }

    /// Compress outbound payloads of at least `threshold` bytes; 0 disables.
    #[must_use]
    pub fn with_auto_compress(mut self, threshold: u32) -> Self {
        self.auto_compress_len = threshold;
        self
    }

    #[must_use]
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Applies outbound transforms in place.
    ///
    /// Encryption runs first when enabled and the message is not already
    /// flagged encrypted. Compression then runs when the (possibly encrypted)
    /// payload meets the threshold and is not already flagged compressed.
    ///
    /// # Errors
    ///
    /// Fails if auto-encryption is on without a cipher, or if a transform fails.
    pub fn seal(&self, msg: &mut Message) -> Result<(), PayloadError> {
        let Some(head) = msg.head else {
            return Ok(());
        };

        if self.auto_encrypt && !head.is_encrypted() {
            let cipher = self.cipher.as_ref().ok_or(PayloadError::MissingCipher)?;
            let sealed = cipher.encrypt(&msg.payload)?;
            msg.set_payload(sealed);
            set_flag(msg, FLAG_ENCRYPTED);
        }

        let threshold = self.auto_compress_len as usize;
        if threshold > 0 && msg.payload.len() >= threshold && !head.is_compressed() {
            let packed = compress(&msg.payload)?;
            msg.set_payload(packed);
            set_flag(msg, FLAG_COMPRESSED);
        }
        Ok(())
    }

    /// Reverses [`PayloadTransform::seal`]: decompress, then decrypt.
    ///
    /// # Errors
    ///
    /// Returns the first transform failure; the message should be dropped.
    pub fn unseal(&self, msg: &mut Message) -> Result<(), PayloadError> {
        let Some(head) = msg.head else {
            return Ok(());
        };

        if head.is_compressed() && !msg.payload.is_empty() {
            let plain = decompress(&msg.payload, self.max_payload as usize)?;
            msg.set_payload(plain);
            clear_flag(msg, FLAG_COMPRESSED);
        }

        if head.is_encrypted() && !msg.payload.is_empty() {
            let cipher = self.cipher.as_ref().ok_or(PayloadError::MissingCipher)?;
            let plain = cipher.decrypt(&msg.payload)?;
            msg.set_payload(plain);
            clear_flag(msg, FLAG_ENCRYPTED);
        }
        Ok(())
    }
}

fn set_flag(msg: &mut Message, flag: u8) {
    if let Some(head) = msg.head.as_mut() {
        head.flags |= flag;
    }
}

fn clear_flag(msg: &mut Message, flag: u8) {
    if let Some(head) = msg.head.as_mut() {
        head.flags &= !flag;
    }
}
