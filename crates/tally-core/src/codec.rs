//! Wire codec: serialize, compress, then optionally sign and encrypt.
//!
//! The signature is computed over the plaintext JSON, before compression,
//! while encryption is applied to the compressed bytes. Both are optional
//! and independent of each other.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::crypto::{self, Signer};
use crate::error::{CoreError, Result};
use crate::pool::BufferPool;
use crate::store::Snapshot;
use crate::types::Metric;

/// Value of the `Content-Encoding` header for compressed bodies.
pub const CONTENT_ENCODING_GZIP: &str = "gzip";
/// Header carrying the hex HMAC of the uncompressed JSON.
pub const HASH_HEADER: &str = "HashSHA256";
/// Header marking an RSA-encrypted body.
pub const ENCRYPTED_HEADER: &str = "X-Encrypted";
/// Value of [`ENCRYPTED_HEADER`] for RSA bodies.
pub const ENCRYPTED_RSA: &str = "rsa";
/// Header carrying the sender's outbound IP.
pub const REAL_IP_HEADER: &str = "X-Real-IP";

/// An encoded batch, ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Compressed, possibly encrypted body.
    pub body: Vec<u8>,
    /// Hex HMAC of the plaintext JSON, when a signing key is set.
    pub signature: Option<String>,
    /// True when the body is RSA-encrypted.
    pub encrypted: bool,
}

/// Encodes metric batches for delivery.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    signer: Option<Signer>,
    public_key: Option<Arc<RsaPublicKey>>,
    pool: BufferPool,
}

impl Encoder {
    /// Creates an encoder that only serializes and compresses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signs every payload with the given HMAC key.
    #[must_use]
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Encrypts every payload with the given RSA public key.
    #[must_use]
    pub fn with_public_key(mut self, key: RsaPublicKey) -> Self {
        self.public_key = Some(Arc::new(key));
        self
    }

    /// Returns true if payloads are signed.
    #[must_use]
    pub const fn signs(&self) -> bool {
        self.signer.is_some()
    }

    /// Returns true if payloads are encrypted.
    #[must_use]
    pub const fn encrypts(&self) -> bool {
        self.public_key.is_some()
    }

    /// Encodes a snapshot, counters first.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, compression, signing or encryption fails.
    pub fn encode_snapshot(&self, snapshot: &Snapshot) -> Result<EncodedPayload> {
        self.encode(&snapshot.to_metrics())
    }

    /// Encodes a batch of records.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, compression, signing or encryption fails.
    pub fn encode(&self, metrics: &[Metric]) -> Result<EncodedPayload> {
        let json = serialize(metrics)?;
        let signature = self.signer.as_ref().map(|s| s.sign(&json)).transpose()?;
        let compressed = compress_with(&self.pool, &json)?;

        let (body, encrypted) = match &self.public_key {
            Some(key) => (crypto::encrypt(key, &compressed)?, true),
            None => (compressed, false),
        };

        Ok(EncodedPayload {
            body,
            signature,
            encrypted,
        })
    }
}

/// Reverses [`Encoder::encode`] on the receiving side.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    signer: Option<Signer>,
    private_key: Option<Arc<RsaPrivateKey>>,
}

impl Decoder {
    /// Creates a decoder that only decompresses and parses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies signatures with the given HMAC key.
    #[must_use]
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Decrypts bodies with the given RSA private key.
    #[must_use]
    pub fn with_private_key(mut self, key: RsaPrivateKey) -> Self {
        self.private_key = Some(Arc::new(key));
        self
    }

    /// Decodes a payload back into records.
    ///
    /// The signature is checked only when both a key and a signature are present.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption, decompression, verification or parsing fails.
    pub fn decode(&self, payload: &EncodedPayload) -> Result<Vec<Metric>> {
        let compressed = if payload.encrypted {
            let key = self.private_key.as_ref().ok_or_else(|| CoreError::Crypto {
                reason: "encrypted payload but no private key configured".to_string(),
            })?;
            crypto::decrypt(key, &payload.body)?
        } else {
            payload.body.clone()
        };

        let json = decompress(&compressed)?;
        if let (Some(signer), Some(signature)) = (&self.signer, &payload.signature) {
            signer.verify(&json, signature)?;
        }
        deserialize(&json)
    }
}

/// Serializes records as a JSON array.
///
/// # Errors
///
/// Returns `CoreError::Serialization` on failure.
pub fn serialize(metrics: &[Metric]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(metrics)?)
}

/// Parses a JSON array of records.
///
/// # Errors
///
/// Returns `CoreError::Serialization` if the bytes are not a JSON array of records.
pub fn deserialize(json: &[u8]) -> Result<Vec<Metric>> {
    Ok(serde_json::from_slice(json)?)
}

/// gzip-compresses `data`.
///
/// # Errors
///
/// Returns `CoreError::Compression` on failure.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    compress_with(&BufferPool::new(0), data)
}

fn compress_with(pool: &BufferPool, data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = pool.get();
    let mut encoder = GzEncoder::new(&mut *buf, Compression::default());
    encoder.write_all(data).map_err(compression_error)?;
    encoder.finish().map_err(compression_error)?;
    Ok(buf.to_vec())
}

fn compression_error(err: std::io::Error) -> CoreError {
    CoreError::Compression {
        reason: err.to_string(),
    }
}

/// Decompresses a gzip stream.
///
/// # Errors
///
/// Returns `CoreError::Compression` if `data` is not valid gzip.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(compression_error)?;
    Ok(out)
}

/// Decompresses a gzip stream, refusing output larger than `max` bytes.
///
/// # Errors
///
/// Returns `CoreError::Compression` if `data` is not valid gzip or expands
/// past `max`.
pub fn decompress_limited(data: &[u8], max: usize) -> Result<Vec<u8>> {
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(max));
    GzDecoder::new(data)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(compression_error)?;
    if out.len() > max {
        return Err(CoreError::Compression {
            reason: format!("decompressed body exceeds {max} bytes"),
        });
    }
    Ok(out)
}
