//! Rewriting of the client configuration document.
//!
//! The document is handled as a generic JSON object so unknown keys survive
//! untouched and in order. Only the chat routing fields are changed, and each
//! change is a plain overwrite, so running the rewrite twice is harmless.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::ChatDestination;

/// Address the client is redirected to.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

const CHAT_HOST: &str = "chat.host";
const CHAT_PORT: &str = "chat.port";
const CHAT_AFFINITIES: &str = "chat.affinities";
const CHAT_AFFINITY_ENABLED: &str = "chat.affinity.enabled";
const CHAT_ALLOW_BAD_CERT: &str = "chat.allow_bad_cert.enabled";

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("config document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config document is not a JSON object")]
    NotAnObject,

    #[error("'{field}' should be {expected}")]
    UnexpectedType {
        field: String,
        expected: &'static str,
    },

    #[error("'chat.port' value {0} is not a valid port")]
    InvalidPort(String),
}

fn unexpected(field: &str, expected: &'static str) -> RewriteError {
    RewriteError::UnexpectedType {
        field: field.to_string(),
        expected,
    }
}

/// Parse an upstream body into a config document.
pub fn parse_config(body: &[u8]) -> Result<Map<String, Value>, RewriteError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(RewriteError::NotAnObject),
    }
}

/// Whether the rewrite will want an affinity region for this document.
pub fn affinity_lookup_needed(doc: &Map<String, Value>) -> Result<bool, RewriteError> {
    if !doc.contains_key(CHAT_AFFINITIES) {
        return Ok(false);
    }
    match doc.get(CHAT_AFFINITY_ENABLED) {
        None => Ok(false),
        Some(Value::Bool(enabled)) => Ok(*enabled),
        Some(_) => Err(unexpected(CHAT_AFFINITY_ENABLED, "a boolean")),
    }
}

/// Point every chat route in `doc` at the local relay.
///
/// `affinity_region` is the region claimed by the affinity service, if one
/// was looked up. Returns the real destination when the document carried
/// both a host and a port.
pub fn rewrite_config(
    doc: &mut Map<String, Value>,
    relay_port: u16,
    affinity_region: Option<&str>,
) -> Result<Option<ChatDestination>, RewriteError> {
    let mut host = match doc.get(CHAT_HOST) {
        None => None,
        Some(Value::String(host)) => Some(host.clone()),
        Some(_) => return Err(unexpected(CHAT_HOST, "a string")),
    };
    if host.is_some() {
        doc.insert(CHAT_HOST.to_string(), Value::from(LOOPBACK_HOST));
    }

    let port = match doc.get(CHAT_PORT) {
        None => None,
        Some(Value::Number(n)) => {
            let port = n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| RewriteError::InvalidPort(n.to_string()))?;
            Some(port)
        }
        Some(_) => return Err(unexpected(CHAT_PORT, "an integer")),
    };
    if port.is_some() {
        doc.insert(CHAT_PORT.to_string(), Value::from(relay_port));
    }

    if let Some(affinities) = doc.get_mut(CHAT_AFFINITIES) {
        let affinities = affinities
            .as_object_mut()
            .ok_or_else(|| unexpected(CHAT_AFFINITIES, "an object"))?;

        if let Some(region) = affinity_region {
            match affinities.get(region) {
                Some(Value::String(affinity_host)) => host = Some(affinity_host.clone()),
                Some(_) => return Err(unexpected(&format!("{CHAT_AFFINITIES}.{region}"), "a string")),
                None => {}
            }
        }

        // Client-side fallback may pick any region, so all of them go local
        for value in affinities.values_mut() {
            *value = Value::from(LOOPBACK_HOST);
        }
    }

    if doc.contains_key(CHAT_ALLOW_BAD_CERT) {
        doc.insert(CHAT_ALLOW_BAD_CERT.to_string(), Value::Bool(true));
    }

    Ok(match (host, port) {
        (Some(host), Some(port)) => Some(ChatDestination { host, port }),
        _ => None,
    })
}
