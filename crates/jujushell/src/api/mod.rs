//! The HTTP surface: WebSocket upgrade, readiness and metrics.

pub mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use axum::{Json, Router};
use jujushell_protocol::{Response, ResponseCode};
use log::error;

use crate::ensure::Ensurer;
use crate::juju::Authenticator;
use crate::lxd::{self, Connector};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::store::InMemory;

/// Port the in-container terminal service listens on.
pub const TERMSERVER_PORT: u16 = 8765;

/// Parameters for interacting with the Juju controller.
pub struct JujuParams {
    /// Addresses of the current Juju controller.
    pub addrs: Vec<String>,
    /// The controller CA certificate in PEM format.
    pub cert: String,
}

/// Parameters used for creating LXD containers.
pub struct LxdParams {
    /// The LXD image to create containers from.
    pub image_name: String,
    /// The LXD profiles to apply.
    pub profiles: Vec<String>,
}

/// Parameters for configuring and running the service.
pub struct SvcParams {
    /// Users allowed to use the service; empty admits everyone.
    pub allowed_users: Vec<String>,
    /// Inactivity period after which containers are stopped; zero disables
    /// the idle stopper.
    pub session_duration: Duration,
    /// Optional text frame sent to clients right after their session
    /// becomes ready.
    pub welcome_message: String,
    /// Port of the in-container terminal service.
    pub term_port: u16,
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub juju: Arc<JujuParams>,
    pub lxd: Arc<LxdParams>,
    pub svc: Arc<SvcParams>,
    pub auth: Arc<dyn Authenticator>,
    pub connector: Arc<dyn Connector>,
    pub ensurer: Arc<Ensurer>,
    pub registry: Arc<Registry>,
    pub store: Arc<InMemory>,
    pub metrics: Arc<Metrics>,
}

/// Assemble the router serving `/ws/`, `/status/` and `/metrics`.
///
/// Seeds the idle registry from the containers currently running on the
/// backend, so sessions that survived a server restart still expire.
pub async fn build_router(
    juju: JujuParams,
    lxd: LxdParams,
    svc: SvcParams,
    auth: Arc<dyn Authenticator>,
    connector: Arc<dyn Connector>,
    store: Arc<InMemory>,
    metrics: Arc<Metrics>,
) -> Result<Router, lxd::Error> {
    let registry = Registry::new(svc.session_duration, Arc::clone(&connector)).await?;
    let state = AppState {
        juju: Arc::new(juju),
        lxd: Arc::new(lxd),
        svc: Arc::new(svc),
        auth,
        connector,
        ensurer: Arc::new(Ensurer::new()),
        registry,
        store,
        metrics,
    };
    Ok(Router::new()
        .route("/ws/", get(session::serve_ws))
        .route("/status/", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state))
}

/// Reports whether the server is ready to accept sessions.
async fn status_handler() -> Json<Response> {
    Json(Response {
        operation: None,
        code: ResponseCode::Ok,
        message: "server is ready".to_string(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> HttpResponse {
    match state.metrics.encode_text() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            error!("cannot encode metrics: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "cannot encode metrics").into_response()
        }
    }
}
