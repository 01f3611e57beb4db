//! HTTP/WebSocket edge
//!
//! The routed surface the browser talks to: five WebSocket endpoints
//! bound to the session registry, plus the two OPK HTTP routes (OAuth
//! callback bridge and chooser reverse-proxy).

pub mod listeners;

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::session::{CoreDeps, SessionRegistry};

/// Edge state shared by all routes
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<CoreDeps>,
    pub registry: Arc<SessionRegistry>,
}

/// Build the full router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/terminal", get(listeners::ws_terminal))
        .route("/ws/tunnel", get(listeners::ws_tunnel))
        .route("/ws/files", get(listeners::ws_files))
        .route("/ws/stats", get(listeners::ws_stats))
        .route("/ws/docker", get(listeners::ws_docker))
        .route("/ssh/opkssh-callback", get(opkssh_callback))
        .route("/ssh/opkssh-chooser/{request_id}", get(opkssh_chooser))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// OAuth callback bridge. The provider redirects here; we resolve the
/// request id and GET the subprocess's local `login-callback` with the
/// original query. The subprocess's own handler produces the stdout that
/// advances the auth state machine, so its HTTP status is ignored.
async fn opkssh_callback(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let query = query.unwrap_or_default();

    let Some(request_id) = resolve_request_id(&query) else {
        warn!("OPK callback without a resolvable request id");
        return (
            StatusCode::BAD_REQUEST,
            Html("<h3>Missing authentication request id.</h3>".to_string()),
        );
    };

    debug!(%request_id, "OPK callback received");

    match state.deps.opk.forward_callback(&request_id, &query).await {
        Ok(()) => (
            StatusCode::OK,
            Html(
                "<h3>Authentication complete.</h3>\
                 <p>You can close this tab and return to the terminal.</p>"
                    .to_string(),
            ),
        ),
        Err(e) => {
            warn!(%request_id, "OPK callback forward failed: {}", e);
            (StatusCode::BAD_GATEWAY, Html(format!("<h3>{}</h3>", e)))
        }
    }
}

/// Reverse-proxy the subprocess's provider chooser page
async fn opkssh_chooser(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.deps.opk.chooser_proxy(&request_id).await {
        Ok((status, content_type, body)) => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            if let Some(ct) = content_type {
                response = response.header(header::CONTENT_TYPE, ct);
            }
            response
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            warn!(%request_id, "Chooser proxy failed: {}", e);
            (StatusCode::BAD_GATEWAY, e).into_response()
        }
    }
}

/// The request id arrives either as an explicit parameter or inside the
/// OAuth `state` value
fn resolve_request_id(query: &str) -> Option<String> {
    let mut state_value = None;
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        let key = kv.next()?;
        let value = kv.next().unwrap_or("");
        match key {
            "requestId" | "request_id" => return Some(value.to_string()),
            "state" => state_value = Some(value.to_string()),
            _ => {}
        }
    }
    state_value.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_from_explicit_param() {
        assert_eq!(
            resolve_request_id("code=abc&requestId=req-1").as_deref(),
            Some("req-1")
        );
        assert_eq!(
            resolve_request_id("request_id=req-2&code=x").as_deref(),
            Some("req-2")
        );
    }

    #[test]
    fn request_id_falls_back_to_oauth_state() {
        assert_eq!(
            resolve_request_id("code=abc&state=req-3").as_deref(),
            Some("req-3")
        );
    }

    #[test]
    fn missing_request_id() {
        assert_eq!(resolve_request_id("code=abc"), None);
        assert_eq!(resolve_request_id(""), None);
        assert_eq!(resolve_request_id("state="), None);
    }
}
