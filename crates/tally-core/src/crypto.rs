//! Payload signing and encryption.
//!
//! - [`Signer`]: HMAC-SHA256 over the uncompressed JSON, carried as hex
//! - [`encrypt`] / [`decrypt`]: RSA PKCS#1 v1.5 over the compressed body
//!
//! PKCS#1 v1.5 encrypts at most `k - 11` bytes per operation, where `k` is
//! the modulus size in bytes. Larger inputs are split into consecutive
//! plaintext blocks and the `k`-byte ciphertext blocks are concatenated.

use std::fmt;
use std::path::Path;

use hmac::{Hmac, Mac};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Encrypt;
pub use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{CoreError, Result};

type HmacSha256 = Hmac<Sha256>;

/// PKCS#1 v1.5 padding overhead in bytes.
const PKCS1_PADDING: usize = 11;

/// HMAC-SHA256 signer holding a shared secret.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl Signer {
    /// Creates a signer from a shared secret.
    #[must_use]
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    fn mac(&self, data: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|e| CoreError::Signature {
            reason: e.to_string(),
        })?;
        mac.update(data);
        Ok(mac)
    }

    /// Computes the hex-encoded HMAC of `data`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Signature` if the MAC cannot be keyed.
    pub fn sign(&self, data: &[u8]) -> Result<String> {
        Ok(hex::encode(self.mac(data)?.finalize().into_bytes()))
    }

    /// Checks a hex-encoded HMAC against `data` in constant time.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Signature` if the hex is malformed or the MAC differs.
    pub fn verify(&self, data: &[u8], signature: &str) -> Result<()> {
        let expected = hex::decode(signature.trim()).map_err(|e| CoreError::Signature {
            reason: format!("malformed signature: {e}"),
        })?;
        self.mac(data)?
            .verify_slice(&expected)
            .map_err(|_| CoreError::Signature {
                reason: "signature mismatch".to_string(),
            })
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("key", &"[redacted]").finish()
    }
}

/// Parses an RSA public key from PEM.
///
/// Accepts a PKIX `PUBLIC KEY` block and falls back to PKCS#1 `RSA PUBLIC KEY`.
///
/// # Errors
///
/// Returns `CoreError::Crypto` if neither encoding parses.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CoreError::Crypto {
            reason: format!("invalid PEM public key: {e}"),
        })
}

/// Parses an RSA private key from PEM.
///
/// Accepts a PKCS#1 `RSA PRIVATE KEY` block and falls back to PKCS#8.
///
/// # Errors
///
/// Returns `CoreError::Crypto` if neither encoding parses.
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| CoreError::Crypto {
            reason: format!("invalid PEM private key: {e}"),
        })
}

/// Reads an RSA public key from a PEM file.
///
/// # Errors
///
/// Returns `CoreError::Key` if the file cannot be read or parsed.
pub fn load_public_key(path: impl AsRef<Path>) -> Result<RsaPublicKey> {
    let path = path.as_ref();
    read_key(path).and_then(|pem| parse_public_key_pem(&pem).map_err(|e| key_error(path, e)))
}

/// Reads an RSA private key from a PEM file.
///
/// # Errors
///
/// Returns `CoreError::Key` if the file cannot be read or parsed.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<RsaPrivateKey> {
    let path = path.as_ref();
    read_key(path).and_then(|pem| parse_private_key_pem(&pem).map_err(|e| key_error(path, e)))
}

fn read_key(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| key_error(path, e))
}

fn key_error(path: &Path, err: impl fmt::Display) -> CoreError {
    CoreError::Key {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Encrypts `data` with PKCS#1 v1.5, block by block.
///
/// # Errors
///
/// Returns `CoreError::Crypto` if any block fails to encrypt.
pub fn encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    let block = key.size().saturating_sub(PKCS1_PADDING);
    if block == 0 {
        return Err(CoreError::Crypto {
            reason: "RSA key too small".to_string(),
        });
    }

    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(data.len().div_ceil(block).max(1) * key.size());
    // An empty payload still produces one block so the receiver sees ciphertext.
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(block).collect()
    };
    for chunk in chunks {
        let sealed = key
            .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| CoreError::Crypto {
                reason: format!("encryption failed: {e}"),
            })?;
        out.extend_from_slice(&sealed);
    }
    Ok(out)
}

/// Decrypts a concatenation of PKCS#1 v1.5 blocks.
///
/// # Errors
///
/// Returns `CoreError::Crypto` if the input is not a whole number of blocks
/// or any block fails to decrypt.
pub fn decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let block = key.size();
    if data.is_empty() || data.len() % block != 0 {
        return Err(CoreError::Crypto {
            reason: format!("ciphertext length {} is not a multiple of {block}", data.len()),
        });
    }

    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(block) {
        let opened = key
            .decrypt(Pkcs1v15Encrypt, chunk)
            .map_err(|e| CoreError::Crypto {
                reason: format!("decryption failed: {e}"),
            })?;
        out.extend_from_slice(&opened);
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::*;

    mod signer_tests {
        use super::*;

        #[test]
        fn sign_is_deterministic_hex() {
            let signer = Signer::new("secret");
            let a = signer.sign(b"payload").unwrap();
            let b = signer.sign(b"payload").unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), 64);
            assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn verify_accepts_own_signature() {
            let signer = Signer::new("secret");
            let sig = signer.sign(b"payload").unwrap();
            signer.verify(b"payload", &sig).unwrap();
        }

        #[test]
        fn verify_rejects_other_key() {
            let sig = Signer::new("secret").sign(b"payload").unwrap();
            let err = Signer::new("other").verify(b"payload", &sig).unwrap_err();
            assert!(matches!(err, CoreError::Signature { .. }));
        }

        #[test]
        fn verify_rejects_tampered_data() {
            let signer = Signer::new("secret");
            let sig = signer.sign(b"payload").unwrap();
            assert!(signer.verify(b"payl0ad", &sig).is_err());
        }

        #[test]
        fn verify_rejects_malformed_hex() {
            let err = Signer::new("secret").verify(b"payload", "zz").unwrap_err();
            assert!(err.to_string().contains("malformed signature"));
        }

        #[test]
        fn debug_redacts_key() {
            let debug = format!("{:?}", Signer::new("hunter2"));
            assert!(!debug.contains("hunter2"));
        }
    }

    mod rsa_tests {
        use super::*;
        use crate::crypto::test_keys::private_key;
        use rsa::pkcs1::EncodeRsaPrivateKey;
        use rsa::pkcs8::{EncodePublicKey, LineEnding};
        use std::io::Write;

        #[test]
        fn small_payload_is_one_block() {
            let private = private_key();
            let public = RsaPublicKey::from(private);
            let sealed = encrypt(&public, b"hello").unwrap();
            assert_eq!(sealed.len(), public.size());
            assert_eq!(decrypt(private, &sealed).unwrap(), b"hello");
        }

        #[test]
        fn large_payload_spans_blocks() {
            let private = private_key();
            let public = RsaPublicKey::from(private);
            let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

            let sealed = encrypt(&public, &data).unwrap();
            let block = public.size() - PKCS1_PADDING;
            assert_eq!(sealed.len(), data.len().div_ceil(block) * public.size());
            assert_eq!(decrypt(private, &sealed).unwrap(), data);
        }

        #[test]
        fn truncated_ciphertext_is_rejected() {
            let private = private_key();
            let public = RsaPublicKey::from(private);
            let sealed = encrypt(&public, b"hello").unwrap();
            assert!(decrypt(private, &sealed[1..]).is_err());
        }

        #[test]
        fn garbage_ciphertext_is_rejected() {
            let private = private_key();
            let garbage = vec![7u8; private.size()];
            assert!(matches!(
                decrypt(private, &garbage),
                Err(CoreError::Crypto { .. })
            ));
        }

        #[test]
        fn keys_load_from_pem_files() {
            let private = private_key();
            let public = RsaPublicKey::from(private);

            let mut priv_file = tempfile::NamedTempFile::new().unwrap();
            priv_file
                .write_all(private.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes())
                .unwrap();
            let mut pub_file = tempfile::NamedTempFile::new().unwrap();
            pub_file
                .write_all(public.to_public_key_pem(LineEnding::LF).unwrap().as_bytes())
                .unwrap();

            assert_eq!(load_private_key(priv_file.path()).unwrap(), *private);
            assert_eq!(load_public_key(pub_file.path()).unwrap(), public);
        }

        #[test]
        fn missing_key_file_is_key_error() {
            let err = load_public_key("/nonexistent/key.pem").unwrap_err();
            assert!(matches!(err, CoreError::Key { .. }));
        }

        #[test]
        fn invalid_pem_is_rejected() {
            assert!(parse_public_key_pem("not a key").is_err());
            assert!(parse_private_key_pem("not a key").is_err());
        }
    }
}
