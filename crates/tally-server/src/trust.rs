//! Who and what the server accepts.
//!
//! A [`TrustPolicy`] bundles the optional subnet filter, the shared HMAC
//! key and the RSA private key. Each check is skipped when its piece is not
//! configured.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tally_core::Signer;
use tally_core::crypto::{self, RsaPrivateKey};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

/// Trust settings shared by the ingest surfaces.
#[derive(Clone, Default)]
pub struct TrustPolicy {
    subnet: Option<IpNet>,
    signer: Option<Signer>,
    private_key: Option<Arc<RsaPrivateKey>>,
}

impl TrustPolicy {
    /// Creates a policy that trusts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the policy from configuration, loading the private key if one
    /// is named.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if the key file cannot be read or parsed.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut policy = Self::new();
        if let Some(subnet) = config.trusted_subnet {
            policy = policy.with_subnet(subnet);
        }
        if let Some(key) = config.key.as_deref().filter(|k| !k.is_empty()) {
            policy = policy.with_signer(Signer::new(key));
        }
        if let Some(path) = &config.crypto_key {
            policy = policy.with_private_key(crypto::load_private_key(path)?);
        }
        Ok(policy)
    }

    /// Restricts ingest to callers inside `subnet`.
    #[must_use]
    pub const fn with_subnet(mut self, subnet: IpNet) -> Self {
        self.subnet = Some(subnet);
        self
    }

    /// Enables hash verification and response signing.
    #[must_use]
    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Enables decryption of `X-Encrypted: rsa` bodies.
    #[must_use]
    pub fn with_private_key(mut self, key: RsaPrivateKey) -> Self {
        self.private_key = Some(Arc::new(key));
        self
    }

    /// Returns the trusted subnet, if any.
    #[must_use]
    pub const fn subnet(&self) -> Option<&IpNet> {
        self.subnet.as_ref()
    }

    /// Returns the HMAC signer, if a key is configured.
    #[must_use]
    pub const fn signer(&self) -> Option<&Signer> {
        self.signer.as_ref()
    }

    /// Returns the RSA private key, if configured.
    #[must_use]
    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.private_key.as_deref()
    }

    /// Checks the caller's declared address against the subnet.
    ///
    /// Passes everything when no subnet is configured.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::BadRequest` if the address is missing or not an
    /// IP, and `ServerError::Untrusted` if it falls outside the subnet.
    pub fn admit(&self, real_ip: Option<&str>) -> Result<()> {
        let Some(subnet) = &self.subnet else {
            return Ok(());
        };
        let raw = real_ip
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::BadRequest("missing X-Real-IP header".to_string()))?;
        let ip = parse_ip(raw)
            .ok_or_else(|| ServerError::BadRequest(format!("invalid X-Real-IP: {raw}")))?;
        if subnet.contains(&ip) {
            Ok(())
        } else {
            Err(ServerError::Untrusted(ip.to_string()))
        }
    }
}

impl std::fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustPolicy")
            .field("subnet", &self.subnet)
            .field("signs", &self.signer.is_some())
            .field("decrypts", &self.private_key.is_some())
            .finish()
    }
}

/// Parses an address, folding IPv4-mapped IPv6 into plain IPv4.
#[must_use]
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    let ip: IpAddr = raw.trim().parse().ok()?;
    Some(match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    })
}
