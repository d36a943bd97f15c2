//! Chat region lookup through the geo affinity service.
//!
//! The service answers with a compact signed token (`header.payload.signature`).
//! Only the payload is decoded to read the `affinity` claim. The signature is
//! NOT verified: the token comes straight from the service over TLS and the
//! region only picks which real chat host we dial.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_AFFINITY_URL: &str = "https://riot-geo.pas.si.riotgames.com/pas/v1/service/chat";

/// The only claim we care about. Everything else in the payload is ignored.
#[derive(Deserialize, Debug)]
struct AffinityClaims {
    affinity: Option<String>,
}

#[derive(Error, Debug)]
pub enum AffinityError {
    #[error("affinity request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("affinity service answered with status {0}")]
    Status(u16),

    #[error("token does not have three segments")]
    MalformedToken,

    #[error("invalid base64 in token payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("token payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token payload has no 'affinity' claim")]
    MissingClaim,
}

/// Read the `affinity` claim out of a compact token without verifying it.
pub fn region_from_token(token: &str) -> Result<String, AffinityError> {
    let mut segments = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AffinityError::MalformedToken);
    };

    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    let claims: AffinityClaims = serde_json::from_slice(&decoded)?;
    claims.affinity.ok_or(AffinityError::MissingClaim)
}

/// Client for the affinity service.
#[derive(Debug, Clone)]
pub struct AffinityResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl AffinityResolver {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Ask the service for the caller's region, authenticating with the
    /// client's own `Authorization` header.
    pub async fn lookup(&self, authorization: Option<&str>) -> Result<String, AffinityError> {
        let mut request = self.client.get(&self.endpoint);
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AffinityError::Status(status.as_u16()));
        }
        let token = response.text().await?;
        region_from_token(&token)
    }

    /// Like [`lookup`](Self::lookup) but failures only cost us the affinity
    /// correction, so they are logged and swallowed.
    pub async fn resolve(&self, authorization: Option<&str>) -> Option<String> {
        match self.lookup(authorization).await {
            Ok(region) => {
                debug!(region = %region, "Resolved chat affinity");
                Some(region)
            }
            Err(e) => {
                warn!(error = %e, "Chat affinity lookup failed, keeping fallback host");
                None
            }
        }
    }
}
