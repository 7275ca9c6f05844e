//! Request pipeline for the ingest routes.
//!
//! Layers run outermost first: subnet check, RSA decryption, gzip
//! decompression, hash verification, then the handler and finally the
//! synchronous snapshot. Bodies are buffered whole because every stage
//! after the subnet check needs the complete payload.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tally_core::codec::{
    CONTENT_ENCODING_GZIP, ENCRYPTED_HEADER, ENCRYPTED_RSA, HASH_HEADER, REAL_IP_HEADER,
};
use tally_core::{Signer, codec, crypto};
use tracing::warn;

use crate::error::{Result, ServerError};
use crate::state::AppState;

/// Largest request body the pipeline will buffer.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Address the request came from, attached to every request.
///
/// Taken from the socket when the server runs with connect info, otherwise
/// from `X-Real-IP`. Empty when neither is available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIp(pub String);

/// Attaches [`CallerIp`] to the request.
pub async fn caller_ip(mut request: Request, next: Next) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .or_else(|| header_str(request.headers(), REAL_IP_HEADER).map(str::to_string))
        .unwrap_or_default();
    request.extensions_mut().insert(CallerIp(ip));
    next.run(request).await
}

/// Rejects callers whose `X-Real-IP` is outside the trusted subnet.
pub async fn check_subnet(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let real_ip = header_str(request.headers(), REAL_IP_HEADER);
    if let Err(e) = state.trust.admit(real_ip) {
        warn!(real_ip = ?real_ip, error = %e, "ingest refused");
        return e.into_response();
    }
    next.run(request).await
}

/// Decrypts bodies marked `X-Encrypted: rsa`.
pub async fn decrypt_body(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if header_str(request.headers(), ENCRYPTED_HEADER) != Some(ENCRYPTED_RSA) {
        return next.run(request).await;
    }
    let result = rewrite_body(request, |ciphertext| {
        let key = state.trust.private_key().ok_or_else(|| {
            ServerError::BadRequest("encrypted body but no private key configured".to_string())
        })?;
        crypto::decrypt(key, &ciphertext)
            .map_err(|e| ServerError::BadRequest(format!("cannot decrypt body: {e}")))
    })
    .await;
    match result {
        Ok(mut request) => {
            request.headers_mut().remove(ENCRYPTED_HEADER);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Decompresses bodies sent with `Content-Encoding: gzip`.
pub async fn gunzip_body(request: Request, next: Next) -> Response {
    if header_str(request.headers(), CONTENT_ENCODING.as_str()) != Some(CONTENT_ENCODING_GZIP) {
        return next.run(request).await;
    }
    let result = rewrite_body(request, |compressed| {
        codec::decompress_limited(&compressed, MAX_BODY_BYTES)
            .map_err(|e| ServerError::BadRequest(format!("cannot decompress body: {e}")))
    })
    .await;
    match result {
        Ok(mut request) => {
            request.headers_mut().remove(CONTENT_ENCODING);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Verifies `HashSHA256` against the plaintext body and signs the response.
///
/// Both steps need a configured key. A request without the header is let
/// through unverified.
pub async fn verify_and_sign(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(signer) = state.trust.signer() else {
        return next.run(request).await;
    };

    let request = match header_str(request.headers(), HASH_HEADER).map(str::to_string) {
        Some(signature) => {
            let verified = rewrite_body(request, |body| {
                signer
                    .verify(&body, &signature)
                    .map_err(|_| ServerError::BadRequest("hash differs".to_string()))?;
                Ok(body.to_vec())
            })
            .await;
            match verified {
                Ok(request) => request,
                Err(e) => return e.into_response(),
            }
        }
        None => request,
    };

    let response = next.run(request).await;
    match sign_response(signer, response).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Writes a snapshot after a successful ingest when persistence is
/// synchronous.
pub async fn persist_after_ingest(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if response.status().is_success() {
        state.persistence.after_ingest().await;
    }
    response
}

async fn sign_response(signer: &Signer, response: Response) -> Result<Response> {
    let (mut parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ServerError::Internal(format!("cannot read response body: {e}")))?;
    let signature = signer.sign(&bytes)?;
    let value = HeaderValue::from_str(&signature)
        .map_err(|e| ServerError::Internal(format!("invalid signature header: {e}")))?;
    let name = HeaderName::from_bytes(HASH_HEADER.as_bytes())
        .map_err(|e| ServerError::Internal(format!("invalid signature header: {e}")))?;
    parts.headers.insert(name, value);
    Ok(Response::from_parts(parts, Body::from(bytes)))
}

async fn rewrite_body<F>(request: Request, transform: F) -> Result<Request>
where
    F: FnOnce(Bytes) -> Result<Vec<u8>>,
{
    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ServerError::BadRequest(format!("cannot read body: {e}")))?;
    let rewritten = transform(bytes)?;
    parts.headers.remove(CONTENT_LENGTH);
    Ok(Request::from_parts(parts, Body::from(rewritten)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
