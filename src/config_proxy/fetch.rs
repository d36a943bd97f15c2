//! Upstream client config fetch.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tracing::debug;

/// Inbound headers copied onto the upstream request. Everything else the
/// client sent is left behind.
pub const FORWARDED_HEADERS: [&str; 3] = ["x-riot-entitlements-jwt", "user-agent", "authorization"];

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("upstream request to {0} failed: {1}")]
    Request(String, reqwest::Error),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Only the allowlisted headers present in `inbound`.
pub fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = inbound.get(name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}

/// GET `base_url` + `path_and_query`, carrying over the allowlisted headers.
pub async fn fetch_config(
    client: &reqwest::Client,
    base_url: &str,
    path_and_query: &str,
    inbound: &HeaderMap,
) -> Result<UpstreamResponse, FetchError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);
    debug!(url = %url, "Fetching client config");

    let response = client
        .get(&url)
        .headers(forwarded_headers(inbound))
        .send()
        .await
        .map_err(|e| FetchError::Request(url.clone(), e))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| FetchError::Request(url.clone(), e))?;

    debug!(url = %url, status = status.as_u16(), bytes = body.len(), "Fetched client config");
    Ok(UpstreamResponse { status, body })
}
