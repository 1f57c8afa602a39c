//! Macaroon cookie encoding and the persistent cookie jar artifact.
//!
//! The `juju` CLI inside the container reads its authentication cookies from
//! a JSON file in the format of Go's persistent cookie jar, so the entries
//! written here use that field layout verbatim.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while building cookie artifacts.
#[derive(Debug, Clone, Error)]
pub enum CookieError {
    #[error("cannot install tokens for {url}: {reason}")]
    Url { url: String, reason: String },

    #[error("cannot encode macaroons: {0}")]
    Encode(String),
}

/// One cookie entry in the jar file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Secure")]
    pub secure: bool,
    #[serde(rename = "HttpOnly")]
    pub http_only: bool,
    #[serde(rename = "Persistent")]
    pub persistent: bool,
    #[serde(rename = "HostOnly")]
    pub host_only: bool,
    #[serde(rename = "Expires")]
    pub expires: String,
    #[serde(rename = "Creation")]
    pub creation: String,
    #[serde(rename = "LastAccess")]
    pub last_access: String,
    #[serde(rename = "Updated")]
    pub updated: String,
    #[serde(rename = "CanonicalHost")]
    pub canonical_host: String,
}

/// The name/value pair encoding one macaroon chain as an HTTP cookie:
/// the value is the base64 of the chain's JSON form, the name is derived
/// from its digest so distinct chains never collide.
pub fn macaroon_cookie(chain: &[Value]) -> Result<(String, String), CookieError> {
    let json = serde_json::to_vec(chain).map_err(|err| CookieError::Encode(err.to_string()))?;
    let digest = hex::encode(Sha256::digest(&json));
    let name = format!("macaroon-{}", &digest[..32]);
    let value = STANDARD.encode(&json);
    Ok((name, value))
}

/// Serialize the full cookie jar holding one entry per macaroon URL.
pub fn marshal_jar(macaroons: &HashMap<String, Vec<Value>>) -> Result<Vec<u8>, CookieError> {
    let mut urls: Vec<&String> = macaroons.keys().collect();
    urls.sort();
    let now = Utc::now();
    let stamp = now.to_rfc3339();
    let expires = (now + Duration::hours(24)).to_rfc3339();
    let mut entries = Vec::with_capacity(urls.len());
    for url_text in urls {
        let url: Url = url_text.parse().map_err(|err| CookieError::Url {
            url: url_text.clone(),
            reason: format!("{err}"),
        })?;
        let host = url.host_str().unwrap_or_default().to_string();
        let (name, value) = macaroon_cookie(&macaroons[url_text])?;
        entries.push(Entry {
            name,
            value,
            domain: host.clone(),
            path: "/".to_string(),
            secure: url.scheme() == "https",
            http_only: false,
            persistent: true,
            host_only: true,
            expires: expires.clone(),
            creation: stamp.clone(),
            last_access: stamp.clone(),
            updated: stamp.clone(),
            canonical_host: host,
        });
    }
    serde_json::to_vec(&entries).map_err(|err| CookieError::Encode(err.to_string()))
}
