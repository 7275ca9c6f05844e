//! Delivery of metric batches to the server.
//!
//! Two transports are provided:
//! - [`HttpTransport`]: gzip JSON on `POST /updates/`, optionally signed and encrypted
//! - [`RpcTransport`]: an `UpdateMetrics` frame on `POST /rpc`
//!
//! Both attach the agent's outbound IP for the server's subnet check. A
//! failed delivery is reported to the caller and never retried here.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tally_core::codec::{
    CONTENT_ENCODING_GZIP, ENCRYPTED_HEADER, ENCRYPTED_RSA, HASH_HEADER, REAL_IP_HEADER,
};
use tally_core::rpc::{
    METHOD_UPDATE_METRICS, REAL_IP_METADATA, RPC_PATH, RpcRequest, RpcResponse,
    UpdateMetricsParams,
};
use tally_core::crypto::load_public_key;
use tally_core::{Encoder, Metric, Signer};
use tokio::net::{UdpSocket, lookup_host};
use tracing::debug;

use crate::config::{AgentConfig, TransportKind};
use crate::error::{AgentError, Result};

/// Boxed future returned by [`Transport::deliver`].
pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Trait for batch delivery backends.
pub trait Transport: Send + Sync {
    /// Delivers one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails, the request cannot be sent, or the
    /// server rejects it.
    fn deliver<'a>(&'a self, batch: &'a [Metric]) -> DeliveryFuture<'a>;

    /// Returns the name of this transport for logging purposes.
    fn name(&self) -> &'static str;
}

/// Returns the local IP the OS would use to reach `address` (`host:port`).
///
/// A UDP socket is connected toward the target; no packet is sent. IPv4
/// targets are preferred when the host resolves to both families.
///
/// # Errors
///
/// Returns an error if the host does not resolve or no route exists.
pub async fn outbound_ip(address: &str) -> Result<IpAddr> {
    let host_port = address
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let targets: Vec<SocketAddr> = lookup_host(host_port)
        .await
        .map_err(|e| AgentError::Transport(format!("cannot resolve {host_port}: {e}")))?
        .collect();
    let target = targets
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| targets.first())
        .copied()
        .ok_or_else(|| AgentError::Transport(format!("no addresses for {host_port}")))?;

    let bind: SocketAddr = if target.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Posts gzip-compressed JSON batches to `/updates/`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    address: String,
    url: String,
    encoder: Encoder,
}

impl HttpTransport {
    /// Creates a transport for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, encoder: Encoder, timeout: Duration) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client: build_client(timeout)?,
            address: base.to_string(),
            url: format!("{base}/updates/"),
            encoder,
        })
    }

    /// Returns the endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, batch: &[Metric]) -> Result<()> {
        let payload = self.encoder.encode(batch)?;
        let ip = outbound_ip(&self.address).await?;

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, CONTENT_ENCODING_GZIP)
            .header(REAL_IP_HEADER, ip.to_string());
        if payload.encrypted {
            request = request.header(ENCRYPTED_HEADER, ENCRYPTED_RSA);
        }
        if let Some(signature) = &payload.signature {
            request = request.header(HASH_HEADER, signature.as_str());
        }

        let response = request.body(payload.body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(url = %self.url, metrics = batch.len(), "batch delivered");
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn deliver<'a>(&'a self, batch: &'a [Metric]) -> DeliveryFuture<'a> {
        Box::pin(self.send(batch))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Calls `UpdateMetrics` on the server's RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcTransport {
    client: reqwest::Client,
    address: String,
    url: String,
}

impl RpcTransport {
    /// Creates a transport for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client: build_client(timeout)?,
            address: base.to_string(),
            url: format!("{base}{RPC_PATH}"),
        })
    }

    async fn call(&self, batch: &[Metric]) -> Result<()> {
        let params = UpdateMetricsParams {
            metrics: batch.to_vec(),
        };
        let request = RpcRequest {
            id: uuid::Uuid::new_v4().to_string(),
            method: METHOD_UPDATE_METRICS.to_string(),
            params: Some(serde_json::to_value(&params).map_err(tally_core::CoreError::from)?),
        };
        let ip = outbound_ip(&self.address).await?;

        let response = self
            .client
            .post(&self.url)
            .header(REAL_IP_METADATA, ip.to_string())
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Rejected {
                status: status.as_u16(),
            });
        }

        let reply: RpcResponse = response.json().await?;
        if let Some(error) = reply.error {
            return Err(AgentError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        debug!(url = %self.url, metrics = batch.len(), id = %reply.id, "rpc batch delivered");
        Ok(())
    }
}

impl Transport for RpcTransport {
    fn deliver<'a>(&'a self, batch: &'a [Metric]) -> DeliveryFuture<'a> {
        Box::pin(self.call(batch))
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

/// Builds the transport selected by `config`.
///
/// The RSA public key is loaded here so a bad key path fails at startup.
///
/// # Errors
///
/// Returns an error if the key cannot be loaded or the client cannot be built.
pub fn build_transport(config: &AgentConfig) -> Result<Arc<dyn Transport>> {
    let base = config.base_url();
    match config.transport {
        TransportKind::Http => {
            let mut encoder = Encoder::new();
            if let Some(key) = &config.key {
                encoder = encoder.with_signer(Signer::new(key));
            }
            if let Some(path) = &config.crypto_key {
                encoder = encoder.with_public_key(load_public_key(path)?);
            }
            Ok(Arc::new(HttpTransport::new(
                &base,
                encoder,
                config.request_timeout,
            )?))
        }
        TransportKind::Rpc => Ok(Arc::new(RpcTransport::new(&base, config.request_timeout)?)),
    }
}
