//! The per-connection session state machine.
//!
//! Each upgraded connection walks through login, start and attach:
//!
//! 1. `login` — authenticate against the Juju controller and, when an
//!    allowed-users list is configured, gate on membership.
//! 2. `start` — dial LXD, ensure the user's container, wait for the
//!    in-container terminal service to answer its status endpoint.
//! 3. attach — dial the terminal service WebSocket and proxy frames until
//!    either side goes away, feeding the idle registry on client activity.
//!
//! Every failure up to the start of proxying is reported to the client as a
//! single `error` response before the connection closes. Failures after
//! attaching are only logged; the container is left to the idle timer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response as HttpResponse;
use jujushell_protocol::{Login, OP_LOGIN, OP_START, Response, ResponseCode, Start};
use log::{debug, info};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::ensure;
use crate::juju::{AuthError, Credentials, Info};
use crate::lxd;
use crate::metrics::InstrumentedClient;
use crate::poll::{self, PollError, Probe};
use crate::proxy;

use super::AppState;

/// Frame ceiling for client connections, in both directions.
const FRAME_SIZE: usize = 65536;
/// Terminal service readiness poll cadence.
const READY_ATTEMPTS: usize = 100;
const READY_INTERVAL: Duration = Duration::from_millis(100);

/// Failures terminating a session.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Malformed or out-of-order client message.
    #[error("{0}")]
    Protocol(String),

    /// The authenticated user is not in the allowed set.
    #[error("user {0:?} is not allowed to access the service")]
    Forbidden(String),

    /// The controller rejected the credentials.
    #[error("cannot log into juju: {0}")]
    Auth(#[from] AuthError),

    /// Container provisioning or credential injection failed.
    #[error(transparent)]
    Ensure(#[from] ensure::Error),

    /// The backend could not be reached.
    #[error(transparent)]
    Backend(#[from] lxd::Error),

    /// The terminal service never became ready.
    #[error("{0}")]
    Readiness(String),

    /// Mid-session I/O failure while proxying.
    #[error("{0}")]
    Proxy(String),

    /// The client connection itself failed.
    #[error("{0}")]
    Connection(String),
}

impl SessionError {
    /// The metrics label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            SessionError::Protocol(_) => "protocol",
            SessionError::Forbidden(_) | SessionError::Auth(_) => "auth",
            SessionError::Ensure(err) => err.category(),
            SessionError::Backend(err) => err.category(),
            SessionError::Readiness(_) => "readiness-timeout",
            SessionError::Proxy(_) => "proxy",
            SessionError::Connection(_) => "connection",
        }
    }
}

/// Handler for `GET /ws/`. Any origin is accepted; origin enforcement is a
/// deployment concern of the fronting TLS terminator.
pub async fn serve_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> HttpResponse {
    ws.max_message_size(FRAME_SIZE)
        .max_frame_size(FRAME_SIZE)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    info!("WebSocket connection established");
    state.metrics.requests_in_flight.inc();
    match run_session(Transport::new(socket), &state).await {
        Ok(()) => {
            state.metrics.requests_total.with_label_values(&["ok"]).inc();
            info!("closing WebSocket connection");
        }
        Err(err) => {
            info!("session terminated: {err}");
            state.metrics.observe_error(err.category());
            state
                .metrics
                .requests_total
                .with_label_values(&["error"])
                .inc();
        }
    }
    state.metrics.requests_in_flight.dec();
}

async fn run_session(mut conn: Transport, state: &AppState) -> Result<(), SessionError> {
    let (info, creds) = handle_login(&mut conn, state).await?;
    info!(
        "user {} authenticated against {:?}",
        info.user, state.juju.addrs
    );
    let (name, addr) = handle_start(&mut conn, state, &info, &creds).await?;
    info!("session started for {} at {addr}", info.user);
    attach(conn, state, &name, &addr).await
}

/// Check the user's controller credentials and, if an allowed-users list is
/// configured, their membership in it.
async fn handle_login(
    conn: &mut Transport,
    state: &AppState,
) -> Result<(Info, Credentials), SessionError> {
    let req: Login = match conn.read_json().await {
        Ok(req) => req,
        Err(err) => return Err(conn.fail(OP_LOGIN, err).await),
    };
    if req.operation != OP_LOGIN {
        let err = SessionError::Protocol(format!(
            "invalid operation {:?}: expected {OP_LOGIN:?}",
            req.operation
        ));
        return Err(conn.fail(OP_LOGIN, err).await);
    }
    let creds = Credentials {
        username: req.username,
        password: req.password,
        macaroons: req.macaroons,
    };
    debug!("authenticating to the controller at {:?}", state.juju.addrs);
    let info = match state
        .auth
        .authenticate(&state.juju.addrs, &creds, &state.juju.cert)
        .await
    {
        Ok(info) => info,
        Err(err) => return Err(conn.fail(OP_LOGIN, err.into()).await),
    };
    if !is_user_allowed(&info.user, &state.svc.allowed_users) {
        return Err(conn.fail(OP_LOGIN, SessionError::Forbidden(info.user)).await);
    }
    conn.ok(OP_LOGIN, &format!("logged in as {:?}", info.user))
        .await?;
    Ok((info, creds))
}

/// Ensure a container for the user and wait for its terminal service.
async fn handle_start(
    conn: &mut Transport,
    state: &AppState,
    info: &Info,
    creds: &Credentials,
) -> Result<(String, String), SessionError> {
    let req: Start = match conn.read_json().await {
        Ok(req) => req,
        Err(err) => return Err(conn.fail(OP_START, err).await),
    };
    if req.operation != OP_START {
        let err = SessionError::Protocol(format!(
            "invalid operation {:?}: expected {OP_START:?}",
            req.operation
        ));
        return Err(conn.fail(OP_START, err).await);
    }

    debug!("connecting to the LXD server");
    let client = match state.connector.connect().await {
        Ok(client) => client,
        Err(err) => return Err(conn.fail(OP_START, err.into()).await),
    };
    let client: Arc<dyn lxd::Client> = Arc::new(InstrumentedClient::new(
        client,
        Arc::clone(&state.metrics),
    ));

    debug!(
        "setting up the LXD instance with image {} and profiles {:?}",
        state.lxd.image_name, state.lxd.profiles
    );
    let (name, addr) = match state
        .ensurer
        .ensure(
            client,
            &state.lxd.image_name,
            &state.lxd.profiles,
            info,
            creds,
        )
        .await
    {
        Ok(pair) => pair,
        Err(err) => return Err(conn.fail(OP_START, err.into()).await),
    };

    let url = format!("http://{addr}:{}/status", state.svc.term_port);
    debug!("waiting for the terminal service at {url}");
    if let Err(err) = wait_ready(&url).await {
        return Err(conn.fail(OP_START, err).await);
    }
    conn.ok(OP_START, "session is ready").await?;
    Ok((name, addr))
}

/// Dial the in-container terminal service and proxy frames until either
/// side closes.
async fn attach(
    conn: Transport,
    state: &AppState,
    name: &str,
    addr: &str,
) -> Result<(), SessionError> {
    let active = state.registry.get(name);
    active.set_active();

    // The path is the one served by the Terminado service in the container.
    let url = format!("ws://{addr}:{}/websocket", state.svc.term_port);
    debug!("connecting to the terminal service at {url}");
    let (upstream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|err| SessionError::Connection(format!("cannot dial {url}: {err}")))?;

    let mut client_socket = conn.into_socket();
    if !state.svc.welcome_message.is_empty() {
        client_socket
            .send(Message::Text(state.svc.welcome_message.clone().into()))
            .await
            .map_err(|err| SessionError::Connection(err.to_string()))?;
    }

    state.store.add_conn(addr);
    debug!("starting the proxy");
    let result = proxy::copy(client_socket, upstream, || active.set_active()).await;
    state.store.remove_conn(addr);
    result.map_err(|err| SessionError::Proxy(err.to_string()))
}

/// Poll the terminal service status endpoint until it reports readiness.
/// Network failures count as "not yet listening" and are retried; only a
/// malformed answer or running out of attempts is fatal.
async fn wait_ready(url: &str) -> Result<(), SessionError> {
    let client = reqwest::Client::new();
    let last_error = Arc::new(Mutex::new("the service never answered".to_string()));
    let result = poll::poll(READY_INTERVAL, READY_ATTEMPTS, || {
        let client = client.clone();
        let url = url.to_string();
        let last_error = Arc::clone(&last_error);
        async move {
            match client.get(&url).send().await {
                Ok(response) => match response.json::<Response>().await {
                    Ok(doc) if doc.code == ResponseCode::Ok => Probe::Ready(()),
                    Ok(doc) => Probe::Fatal(SessionError::Readiness(format!(
                        "invalid response from {url}: {:?}",
                        doc.code.to_string()
                    ))),
                    Err(err) => Probe::Fatal(SessionError::Readiness(format!(
                        "cannot decode response from {url}: {err}"
                    ))),
                },
                Err(err) => {
                    *last_error.lock().unwrap_or_else(PoisonError::into_inner) = err.to_string();
                    Probe::NotReady
                }
            }
        }
    })
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(PollError::Fatal(err)) => Err(err),
        Err(PollError::TimedOut) => {
            let last = last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            Err(SessionError::Readiness(format!("cannot get {url}: {last}")))
        }
    }
}

/// Whether the given user may access the service. An empty allowed list
/// admits everyone; comparison is case-sensitive and exact.
fn is_user_allowed(user: &str, allowed: &[String]) -> bool {
    allowed.is_empty() || allowed.iter().any(|candidate| candidate == user)
}

/// A JSON transport over the upgraded connection.
struct Transport {
    socket: WebSocket,
}

impl Transport {
    fn new(socket: WebSocket) -> Self {
        Self { socket }
    }

    fn into_socket(self) -> WebSocket {
        self.socket
    }

    async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, SessionError> {
        loop {
            match self.socket.recv().await {
                None => return Err(SessionError::Connection("connection closed".to_string())),
                Some(Err(err)) => return Err(SessionError::Connection(err.to_string())),
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|err| {
                        SessionError::Protocol(format!("cannot decode request: {err}"))
                    });
                }
                Some(Ok(Message::Binary(data))) => {
                    return serde_json::from_slice(&data).map_err(|err| {
                        SessionError::Protocol(format!("cannot decode request: {err}"))
                    });
                }
                // Control frames are answered by the transport layer.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn send(&mut self, resp: &Response) -> Result<(), SessionError> {
        let text =
            serde_json::to_string(resp).map_err(|err| SessionError::Connection(err.to_string()))?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| SessionError::Connection(err.to_string()))
    }

    async fn ok(&mut self, operation: &str, message: &str) -> Result<(), SessionError> {
        debug!("sending ok response to {operation:?}");
        self.send(&Response::ok(operation, message)).await
    }

    /// Report the failure to the client (best effort) and hand it back.
    async fn fail(&mut self, operation: &str, err: SessionError) -> SessionError {
        debug!("sending error response to {operation:?}: {err}");
        let _ = self.send(&Response::error(operation, err.to_string())).await;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowed_list_admits_everyone() {
        assert!(is_user_allowed("who@external", &[]));
        assert!(is_user_allowed("anyone", &[]));
    }

    #[test]
    fn allowed_list_matches_exactly() {
        let allowed = vec!["alice".to_string(), "bob@external".to_string()];
        assert!(is_user_allowed("alice", &allowed));
        assert!(is_user_allowed("bob@external", &allowed));
        assert!(!is_user_allowed("carol", &allowed));
        // Comparison is case-sensitive.
        assert!(!is_user_allowed("Alice", &allowed));
        assert!(!is_user_allowed("bob", &allowed));
    }

    #[test]
    fn error_messages_match_the_protocol() {
        let err = SessionError::Forbidden("bob".to_string());
        assert_eq!(
            err.to_string(),
            "user \"bob\" is not allowed to access the service"
        );
        let err = SessionError::Protocol(format!(
            "invalid operation {:?}: expected {OP_LOGIN:?}",
            "start"
        ));
        assert_eq!(
            err.to_string(),
            "invalid operation \"start\": expected \"login\""
        );
    }

    #[test]
    fn categories_cover_the_taxonomy() {
        assert_eq!(SessionError::Protocol(String::new()).category(), "protocol");
        assert_eq!(SessionError::Forbidden(String::new()).category(), "auth");
        assert_eq!(
            SessionError::Auth(AuthError::MissingCredentials).category(),
            "auth"
        );
        assert_eq!(
            SessionError::Readiness(String::new()).category(),
            "readiness-timeout"
        );
        assert_eq!(SessionError::Proxy(String::new()).category(), "proxy");
        assert_eq!(
            SessionError::Backend(lxd::Error::AddrTimeout("ts".into())).category(),
            "backend"
        );
    }
}
