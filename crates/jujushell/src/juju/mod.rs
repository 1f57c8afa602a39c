//! Controller client adapter.
//!
//! Authenticates users against the Juju controller and marshals the client
//! configuration artifacts (`accounts.yaml`, `controllers.yaml`, the cookie
//! jar) that are later injected into containers.

pub mod cookies;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use cookies::CookieError;

/// The name assigned locally to the Juju controller.
pub const CONTROLLER_NAME: &str = "ctrl";

/// Delay between controller dial attempts.
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Overall controller dial deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Credentials for logging into the Juju controller.
///
/// Either `username` and `password` hold a local user's credentials, or
/// `macaroons` maps cookie URLs to macaroon slices for external users. The
/// contents must never be logged.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub macaroons: HashMap<String, Vec<Value>>,
}

/// Information about the Juju controller, produced by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// The authenticated local or external user.
    pub user: String,
    /// The local name of the controller.
    pub controller_name: String,
    /// The controller's unique identifier.
    pub controller_uuid: String,
    /// The CA certificate validating the controller, in PEM format.
    pub ca_cert: String,
    /// `host:port` addresses of the controller endpoints.
    pub endpoints: Vec<String>,
}

/// Authentication failures.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("either credential pair or identity tokens must be provided")]
    MissingCredentials,

    #[error(transparent)]
    Macaroons(#[from] CookieError),

    #[error("invalid controller CA certificate: {0}")]
    BadCert(String),

    #[error("cannot authenticate user: {0}")]
    Rejected(String),

    #[error("cannot reach the controller: {0}")]
    Dial(String),

    #[error("unexpected controller response: {0}")]
    Protocol(String),
}

/// The authentication seam, so that the session handler can be exercised
/// without a live controller.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        addrs: &[String],
        creds: &Credentials,
        cert: &str,
    ) -> Result<Info, AuthError>;
}

/// [`Authenticator`] dialing the real controller.
#[derive(Debug, Default)]
pub struct ControllerAuthenticator;

#[async_trait]
impl Authenticator for ControllerAuthenticator {
    async fn authenticate(
        &self,
        addrs: &[String],
        creds: &Credentials,
        cert: &str,
    ) -> Result<Info, AuthError> {
        authenticate(addrs, creds, cert).await
    }
}

/// Log into the Juju controller at the given addresses with the given
/// credentials, returning information about the controller.
///
/// The dial retries every 500 ms for up to 15 seconds; the connection is
/// not kept alive, its only product is the returned [`Info`].
pub async fn authenticate(
    addrs: &[String],
    creds: &Credentials,
    cert: &str,
) -> Result<Info, AuthError> {
    let use_macaroons = !creds.macaroons.is_empty();
    if !use_macaroons && (creds.username.is_empty() || creds.password.is_empty()) {
        return Err(AuthError::MissingCredentials);
    }

    // Install the macaroons as cookies on their URLs before dialing.
    let jar = Arc::new(reqwest::cookie::Jar::default());
    let mut urls: Vec<&String> = creds.macaroons.keys().collect();
    urls.sort();
    for url_text in urls {
        let url: Url = url_text.parse().map_err(|err| CookieError::Url {
            url: url_text.clone(),
            reason: format!("{err}"),
        })?;
        let (name, value) = cookies::macaroon_cookie(&creds.macaroons[url_text])?;
        jar.add_cookie_str(&format!("{name}={value}; Path=/"), &url);
    }

    let mut builder = reqwest::Client::builder()
        .cookie_provider(Arc::clone(&jar))
        .timeout(DIAL_TIMEOUT);
    if !cert.is_empty() {
        let ca = reqwest::Certificate::from_pem(cert.as_bytes())
            .map_err(|err| AuthError::BadCert(err.to_string()))?;
        builder = builder.add_root_certificate(ca);
    }
    let client = builder
        .build()
        .map_err(|err| AuthError::Dial(err.to_string()))?;

    let request = LoginRequest {
        auth_tag: if use_macaroons {
            None
        } else {
            Some(format!("user-{}", creds.username))
        },
        credentials: if use_macaroons {
            None
        } else {
            Some(creds.password.clone())
        },
        macaroons: creds.macaroons.values().cloned().collect(),
    };

    let deadline = tokio::time::Instant::now() + DIAL_TIMEOUT;
    let mut last_error = "no controller address provided".to_string();
    loop {
        for addr in addrs {
            let url = format!("https://{addr}/api/login");
            match client.post(&url).json(&request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let result: LoginResult = response
                            .json()
                            .await
                            .map_err(|err| AuthError::Protocol(err.to_string()))?;
                        return Ok(Info::from_login(result, cert));
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(AuthError::Rejected("invalid credentials".to_string()));
                    }
                    last_error = format!("{url}: unexpected status {status}");
                }
                Err(err) => last_error = format!("{url}: {err}"),
            }
        }
        if tokio::time::Instant::now() + DIAL_RETRY_DELAY >= deadline {
            return Err(AuthError::Dial(last_error));
        }
        tokio::time::sleep(DIAL_RETRY_DELAY).await;
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest {
    #[serde(rename = "auth-tag", skip_serializing_if = "Option::is_none")]
    auth_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credentials: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    macaroons: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct LoginResult {
    #[serde(rename = "user-tag")]
    user_tag: String,
    #[serde(rename = "controller-tag", default)]
    controller_tag: String,
    #[serde(default)]
    servers: Vec<Vec<HostPort>>,
}

#[derive(Debug, Deserialize)]
struct HostPort {
    value: String,
    port: u16,
}

impl Info {
    fn from_login(result: LoginResult, cert: &str) -> Self {
        let user = strip_tag(&result.user_tag, "user-");
        let controller_uuid = strip_tag(&result.controller_tag, "controller-");
        let endpoints = result
            .servers
            .iter()
            .flatten()
            .map(|hp| format!("{}:{}", hp.value, hp.port))
            .collect();
        Self {
            user,
            controller_name: CONTROLLER_NAME.to_string(),
            controller_uuid,
            ca_cert: cert.to_string(),
            endpoints,
        }
    }
}

fn strip_tag(tag: &str, prefix: &str) -> String {
    tag.strip_prefix(prefix).unwrap_or(tag).to_string()
}

/// Encode the controller account so that it is suitable as the content of
/// the Juju `accounts.yaml` file.
pub fn marshal_accounts(
    controller_name: &str,
    username: &str,
    password: &str,
) -> Result<Vec<u8>, serde_yaml::Error> {
    #[derive(Serialize)]
    struct Accounts<'a> {
        controllers: HashMap<&'a str, Account<'a>>,
    }
    #[derive(Serialize)]
    struct Account<'a> {
        user: &'a str,
        password: &'a str,
    }
    let mut controllers = HashMap::new();
    controllers.insert(
        controller_name,
        Account {
            user: username,
            password,
        },
    );
    serde_yaml::to_string(&Accounts { controllers }).map(String::into_bytes)
}

/// Encode the controller information so that it is suitable as the content
/// of the Juju `controllers.yaml` file.
pub fn marshal_controllers(info: &Info) -> Result<Vec<u8>, serde_yaml::Error> {
    #[derive(Serialize)]
    struct Controllers<'a> {
        controllers: HashMap<&'a str, Details<'a>>,
        #[serde(rename = "current-controller")]
        current_controller: &'a str,
    }
    #[derive(Serialize)]
    struct Details<'a> {
        uuid: &'a str,
        #[serde(rename = "api-endpoints")]
        api_endpoints: &'a [String],
        #[serde(rename = "ca-cert")]
        ca_cert: &'a str,
    }
    let mut controllers = HashMap::new();
    controllers.insert(
        info.controller_name.as_str(),
        Details {
            uuid: &info.controller_uuid,
            api_endpoints: &info.endpoints,
            ca_cert: &info.ca_cert,
        },
    );
    serde_yaml::to_string(&Controllers {
        controllers,
        current_controller: &info.controller_name,
    })
    .map(String::into_bytes)
}
