//! Wire types for the LXD REST API.
//!
//! Only the slices of the API this server drives are modeled; see
//! <https://documentation.ubuntu.com/lxd/latest/rest-api/> for the full
//! surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::Error;

/// The common response envelope wrapping every LXD reply.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Envelope {
    /// Decode an envelope, turning `type: error` documents into [`Error::Api`].
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|err| Error::Payload(format!("cannot decode response envelope: {err}")))?;
        if envelope.kind == "error" {
            return Err(Error::Api {
                code: envelope.error_code,
                message: envelope.error,
            });
        }
        Ok(envelope)
    }

    /// The trailing identifier of the `operation` field
    /// (`/1.0/operations/<id>` for async responses).
    pub fn operation_id(&self) -> Result<&str, Error> {
        match self.operation.rsplit('/').next() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(Error::Payload(format!(
                "response carries no operation: {:?}",
                self.operation
            ))),
        }
    }

    /// Deserialize the metadata document.
    pub fn decode_metadata<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.metadata.clone())
            .map_err(|err| Error::Payload(format!("cannot decode response metadata: {err}")))
    }
}

/// A container document as returned by `GET /1.0/containers`.
#[derive(Debug, Deserialize)]
pub(crate) struct ContainerInfo {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

/// Body of `POST /1.0/containers`.
#[derive(Debug, Serialize)]
pub(crate) struct CreateRequest<'a> {
    pub name: &'a str,
    pub source: CreateSource<'a>,
    pub profiles: &'a [String],
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSource<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub alias: &'a str,
}

/// Body of `PUT /1.0/containers/{name}/state`.
#[derive(Debug, Serialize)]
pub(crate) struct StateUpdate<'a> {
    pub action: &'a str,
    pub timeout: i64,
}

/// Metadata of `GET /1.0/containers/{name}/state`.
#[derive(Debug, Deserialize)]
pub(crate) struct ContainerState {
    #[serde(default)]
    pub network: HashMap<String, Network>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Network {
    #[serde(default)]
    pub addresses: Vec<Address>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Address {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub address: String,
}

/// Body of `POST /1.0/containers/{name}/exec`.
#[derive(Debug, Serialize)]
pub(crate) struct ExecRequest<'a> {
    pub command: &'a [String],
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
    pub interactive: bool,
}

/// An operation document, as embedded in async responses and returned by
/// `GET /1.0/operations/{id}/wait`.
#[derive(Debug, Deserialize)]
pub(crate) struct Operation {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Operation {
    /// Whether the operation completed successfully.
    pub fn succeeded(&self) -> bool {
        self.err.is_empty() && self.status_code < 400
    }

    /// The stream secret for the given exec file descriptor.
    pub fn fd_secret(&self, fd: &str) -> Result<&str, Error> {
        self.metadata
            .get("fds")
            .and_then(|fds| fds.get(fd))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Payload(format!("exec operation exposes no websocket for fd {fd:?}"))
            })
    }

    /// The numeric return code recorded by an exec operation.
    pub fn return_code(&self) -> Result<i64, Error> {
        self.metadata
            .get("return")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                Error::Payload(format!(
                    "cannot retrieve return code from exec operation metadata {}",
                    self.metadata
                ))
            })
    }
}
