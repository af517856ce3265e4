use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection, ws::rejection::WebSocketUpgradeRejection, State,
        WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::broker::connection::{handle_socket, ConnectionSettings};
use crate::broker::router::{JobOutcome, JobRouter};
use crate::config::AccessToken;

pub const WELCOME_BANNER: &str = "job-fabric broker\n";

#[derive(Clone)]
pub struct HttpState {
    pub router: JobRouter,
    pub access_tokens: Arc<HashMap<String, AccessToken>>,
    pub connections: Arc<ConnectionSettings>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct ApiJobRequest {
    pub job_name: String,
    #[serde(default)]
    pub job_data: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiJobResponse {
    pub success: bool,
    pub result: Option<String>,
}

impl ApiJobResponse {
    fn denied(result: &str) -> Self {
        Self {
            success: false,
            result: Some(result.to_string()),
        }
    }
}

impl From<JobOutcome> for ApiJobResponse {
    fn from(outcome: JobOutcome) -> Self {
        Self {
            success: outcome.success,
            result: outcome.result,
        }
    }
}

pub fn routes(state: HttpState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api", post(api_handler))
        .route("/ran", get(worker_socket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the broker's HTTP routes on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: HttpState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Broker listening");
    }
    axum::serve(listener, routes(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn index_handler() -> &'static str {
    WELCOME_BANNER
}

/// Extract the token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

async fn api_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    payload: Result<Json<ApiJobRequest>, JsonRejection>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiJobResponse::denied("Unauthorized")),
        )
            .into_response();
    };
    let Some(caller) = state.access_tokens.get(token) else {
        tracing::warn!("API request with unknown token");
        return (
            StatusCode::FORBIDDEN,
            Json(ApiJobResponse::denied("Forbidden")),
        )
            .into_response();
    };
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection.into_response(),
    };

    let outcome = state
        .router
        .submit_job(&payload.job_name, &payload.job_data, &caller.name)
        .await;
    Json(ApiJobResponse::from(outcome)).into_response()
}

async fn worker_socket_handler(
    State(state): State<HttpState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(upgrade) => upgrade.on_upgrade(move |socket| {
            handle_socket(socket, state.router, state.connections, state.shutdown)
        }),
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected non-WebSocket request on worker endpoint");
            (StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade").into_response()
        }
    }
}
