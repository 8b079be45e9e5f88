//! WebSocket-Endpunkt mit Auth-Gate im Handshake
//!
//! Der Token wird vor dem Upgrade geprueft. Abgelehnte Handshakes
//! bekommen 401 mit dem Ablehnungsgrund, waehrend des Shutdowns 503.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use vitalink_auth::{token_extrahieren, AuthError, Identitaet};
use vitalink_protocol::ErrorCode;

use crate::connection::ClientConnection;
use crate::server_state::SignalingState;

/// Router mit der Route `/ws`
pub fn ws_router(state: Arc<SignalingState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<SignalingState>>,
    headers: HeaderMap,
    Query(parameter): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.ist_heruntergefahren() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "code": ErrorCode::InternalError, "message": "Server is shutting down" } })),
        )
            .into_response();
    }

    let identitaet = match handshake_pruefen(&state, &headers, parameter.get("token").map(String::as_str)) {
        Ok(i) => i,
        Err(e) => {
            tracing::info!(fehler = %e, "Handshake abgelehnt");
            return abgelehnt(&e);
        }
    };

    ws.on_upgrade(move |socket| async move {
        let handle = match state.verbindung_oeffnen(&identitaet) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(user_id = %identitaet.user_id, fehler = %e, "Verbindung nicht registriert");
                return;
            }
        };
        ClientConnection::neu(state).verarbeiten(socket, handle).await;
    })
}

/// Prueft den Token aus Header oder dem dekodierten Query-Feld `token`
pub fn handshake_pruefen(
    state: &SignalingState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Identitaet, AuthError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let token = token_extrahieren(authorization, query_token)?;
    state.jwt.pruefen(&token)
}

fn abgelehnt(fehler: &AuthError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": ErrorCode::AuthenticationFailed,
                "message": fehler.grund(),
            }
        })),
    )
        .into_response()
}
