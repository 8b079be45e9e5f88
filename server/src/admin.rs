//! Admin-HTTP-Schnittstelle
//!
//! Alle Routen unter `/admin` verlangen einen Bearer-Token, dessen Rolle
//! Vollzugriff hat. Fehler kommen als `{error:{code, message}}`.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use vitalink_auth::{token_extrahieren, Identitaet};
use vitalink_core::UserId;
use vitalink_protocol::{ErrorCode, Prioritaet};
use vitalink_signaling::{
    Besuch, NeueBenachrichtigung, RollenZugriff, SignalingError, SignalingState,
};

/// Axum-State der Admin-Routen
#[derive(Clone)]
pub struct AdminState {
    pub signaling: Arc<SignalingState>,
    /// Dieselbe Richtlinie, die der Kern fuer Besuchszugriffe fragt
    pub zugriff: RollenZugriff,
}

impl AdminState {
    pub fn neu(signaling: Arc<SignalingState>, zugriff: RollenZugriff) -> Self {
        Self { signaling, zugriff }
    }
}

/// Erstellt den `/admin`-Router
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/verbindungen", get(verbindungen_auflisten))
        .route("/admin/benutzer/:id/trennen", post(benutzer_trennen))
        .route("/admin/benutzer/:id/benachrichtigen", post(benutzer_benachrichtigen))
        .route("/admin/besuche", post(besuch_registrieren))
        .route("/admin/shutdown", post(herunterfahren))
        .route("/admin/statistik", get(statistik))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Hilfsfunktionen
// ---------------------------------------------------------------------------

fn fehler(status: StatusCode, code: ErrorCode, meldung: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": meldung } })),
    )
        .into_response()
}

/// Prueft Token und Vollzugriff-Rolle aus den Request-Headern
fn admin_pruefen(headers: &HeaderMap, state: &AdminState) -> Result<Identitaet, Response> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let identitaet = token_extrahieren(authorization, None)
        .and_then(|token| state.signaling.jwt.pruefen(&token))
        .map_err(|e| {
            fehler(
                StatusCode::UNAUTHORIZED,
                ErrorCode::AuthenticationFailed,
                e.grund(),
            )
        })?;

    if !state.zugriff.hat_vollzugriff(&identitaet.rolle) {
        tracing::warn!(
            user_id = %identitaet.user_id,
            rolle = %identitaet.rolle,
            "Admin-Zugriff verweigert"
        );
        return Err(fehler(
            StatusCode::FORBIDDEN,
            ErrorCode::AccessDenied,
            "Admin role required",
        ));
    }
    Ok(identitaet)
}

fn signaling_fehler(e: &SignalingError) -> Response {
    let status = match e {
        SignalingError::NichtGefunden(_) => StatusCode::NOT_FOUND,
        SignalingError::ZugriffVerweigert(_) => StatusCode::FORBIDDEN,
        SignalingError::UngueltigeAnfrage(_) => StatusCode::BAD_REQUEST,
        SignalingError::BrokerNichtVerfuegbar(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if e.ist_intern() {
        tracing::error!(fehler = %e, "Admin-Anfrage fehlgeschlagen");
    }
    fehler(status, e.code(), &e.client_meldung())
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

async fn verbindungen_auflisten(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(r) = admin_pruefen(&headers, &state) {
        return r;
    }
    let statistik = state.signaling.registry.statistik();
    (StatusCode::OK, Json(statistik)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct TrennenBody {
    pub reason: Option<String>,
}

async fn benutzer_trennen(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<TrennenBody>>,
) -> Response {
    let admin = match admin_pruefen(&headers, &state) {
        Ok(a) => a,
        Err(r) => return r,
    };
    let grund = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Disconnected by administrator".to_string());

    let user_id = UserId::neu(id);
    let getrennt = state.signaling.benutzer_trennen(&user_id, &grund);
    tracing::info!(admin = %admin.user_id, user_id = %user_id, getrennt, "Admin-Trennung");

    (StatusCode::OK, Json(json!({ "disconnected": getrennt }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct BenachrichtigenBody {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub priority: Prioritaet,
    pub title: String,
    pub message: String,
    pub data: Option<Value>,
}

async fn benutzer_benachrichtigen(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BenachrichtigenBody>,
) -> Response {
    if let Err(r) = admin_pruefen(&headers, &state) {
        return r;
    }

    let mut neu = NeueBenachrichtigung::neu(body.typ, body.title, body.message)
        .mit_prioritaet(body.priority);
    if let Some(daten) = body.data {
        neu = neu.mit_daten(daten);
    }

    match state
        .signaling
        .benachrichtigungen
        .benachrichtigung_senden(&UserId::neu(id), neu)
        .await
    {
        Ok(notification_id) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "notificationId": notification_id })),
        )
            .into_response(),
        Err(e) => signaling_fehler(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BesuchBody {
    pub visit_id: String,
    pub patient_id: String,
    pub provider_id: String,
}

async fn besuch_registrieren(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(body): Json<BesuchBody>,
) -> Response {
    if let Err(r) = admin_pruefen(&headers, &state) {
        return r;
    }
    if body.visit_id.trim().is_empty() {
        return fehler(StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, "visitId is required");
    }

    state.zugriff.besuch_registrieren(
        body.visit_id.clone(),
        Besuch {
            patient: UserId::neu(body.patient_id),
            behandler: UserId::neu(body.provider_id),
        },
    );
    (StatusCode::CREATED, Json(json!({ "visitId": body.visit_id }))).into_response()
}

async fn herunterfahren(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    let admin = match admin_pruefen(&headers, &state) {
        Ok(a) => a,
        Err(r) => return r,
    };
    if state.signaling.ist_heruntergefahren() {
        return (StatusCode::ACCEPTED, Json(json!({ "shuttingDown": true }))).into_response();
    }

    tracing::warn!(admin = %admin.user_id, "Shutdown ueber Admin-API angefordert");
    let signaling = state.signaling.clone();
    tokio::spawn(async move { signaling.herunterfahren().await });

    (StatusCode::ACCEPTED, Json(json!({ "shuttingDown": true }))).into_response()
}

async fn statistik(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(r) = admin_pruefen(&headers, &state) {
        return r;
    }
    let s = &state.signaling;
    let verbindungen = s.registry.statistik();

    (
        StatusCode::OK,
        Json(json!({
            "nodeId": s.verteiler.node_id(),
            "uptimeSeconds": s.uptime_sek(),
            "connections": {
                "totalConnections": verbindungen.total_connections,
                "uniqueUsers": verbindungen.unique_users,
            },
            "rooms": s.raeume.statistik(),
            "calls": s.anrufe.statistik(),
            "presence": s.presence.statistik(),
            "fanout": {
                "brokerConfigured": s.verteiler.broker_konfiguriert(),
                "brokerConnected": s.verteiler.broker_aktiv(),
                "published": s.verteiler.veroeffentlicht(),
                "received": s.verteiler.empfangen(),
            },
        })),
    )
        .into_response()
}
