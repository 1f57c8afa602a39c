//! Message types for the jujushell WebSocket API.
//!
//! Clients drive a session through two JSON requests over the upgraded
//! connection, in order:
//!
//! ```text
//! --> {"operation": "login", "username": "admin", "password": "secret"}
//! <-- {"operation": "login", "code": "ok", "message": "logged in as \"admin\""}
//! --> {"operation": "start"}
//! <-- {"operation": "start", "code": "ok", "message": "session is ready"}
//! ```
//!
//! After the `start` response the connection carries raw terminal frames in
//! both directions. Every server reply, including the `/status/` readiness
//! document, is a [`Response`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation name for the login request.
pub const OP_LOGIN: &str = "login";
/// Operation name for the start request.
pub const OP_START: &str = "start";
/// Operation name used by the readiness document.
pub const OP_STATUS: &str = "status";

/// A login request, the first message of every session.
///
/// Either `username` and `password` are both set, or `macaroons` maps cookie
/// URLs to macaroon slices for external identities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Login {
    pub operation: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub macaroons: HashMap<String, Vec<Value>>,
}

/// A start request, sent after a successful login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Start {
    pub operation: String,
}

/// A server response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub code: ResponseCode,
    #[serde(default)]
    pub message: String,
}

impl Response {
    /// A successful response to the given operation.
    pub fn ok(operation: &str, message: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.to_string()),
            code: ResponseCode::Ok,
            message: message.into(),
        }
    }

    /// An error response to the given operation.
    pub fn error(operation: &str, message: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.to_string()),
            code: ResponseCode::Error,
            message: message.into(),
        }
    }
}

/// A server response code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseCode {
    Ok,
    Error,
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseCode::Ok => write!(f, "ok"),
            ResponseCode::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_codes_are_lowercase() {
        let resp = Response::ok(OP_LOGIN, "logged in as \"admin\"");
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            text,
            r#"{"operation":"login","code":"ok","message":"logged in as \"admin\""}"#
        );

        let resp = Response::error(OP_START, "boom");
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            text,
            r#"{"operation":"start","code":"error","message":"boom"}"#
        );
    }

    #[test]
    fn login_decodes_with_missing_fields() {
        let req: Login = serde_json::from_str(r#"{"operation": "login"}"#).unwrap();
        assert_eq!(req.operation, OP_LOGIN);
        assert!(req.username.is_empty());
        assert!(req.password.is_empty());
        assert!(req.macaroons.is_empty());
    }

    #[test]
    fn login_decodes_macaroons() {
        let req: Login = serde_json::from_str(
            r#"{"operation": "login", "macaroons": {"https://id.example/": [{"i": "x"}]}}"#,
        )
        .unwrap();
        assert_eq!(req.macaroons.len(), 1);
        assert_eq!(req.macaroons["https://id.example/"].len(), 1);
    }

    #[test]
    fn response_without_operation_round_trips() {
        let text = r#"{"code":"ok","message":"server is ready"}"#;
        let resp: Response = serde_json::from_str(text).unwrap();
        assert_eq!(resp.code, ResponseCode::Ok);
        assert!(resp.operation.is_none());
        assert_eq!(serde_json::to_string(&resp).unwrap(), text);
    }
}
