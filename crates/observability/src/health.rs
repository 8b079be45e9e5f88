//! Health-Check-Endpunkt
//!
//! Endpoint: `GET /health`
//! Response: JSON mit Status, Version, Uptime und Broker-Status

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Status des Health-Checks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Antwort des Health-Check-Endpunkts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub broker_configured: bool,
    pub broker_connected: bool,
}

/// Geteilter Zustand fuer den Health-Check-Handler
///
/// Ohne konfigurierten Broker laeuft der Prozess allein und ist immer
/// healthy. Mit Broker meldet der Server den Verbindungsstand periodisch.
#[derive(Clone)]
pub struct HealthState {
    pub start_time: Arc<Instant>,
    broker_konfiguriert: bool,
    broker_verbunden: Arc<AtomicBool>,
}

impl HealthState {
    pub fn neu(broker_konfiguriert: bool) -> Self {
        Self {
            start_time: Arc::new(Instant::now()),
            broker_konfiguriert,
            broker_verbunden: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn broker_verbunden(&self) -> bool {
        self.broker_verbunden.load(Ordering::Relaxed)
    }

    pub fn broker_status_setzen(&self, verbunden: bool) {
        self.broker_verbunden.store(verbunden, Ordering::Relaxed);
    }

    /// Aktueller Gesamtstatus
    pub fn status(&self) -> HealthStatus {
        if self.broker_konfiguriert && !self.broker_verbunden() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn antwort(&self) -> HealthResponse {
        HealthResponse {
            status: self.status(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime_seconds(),
            broker_configured: self.broker_konfiguriert,
            broker_connected: self.broker_verbunden(),
        }
    }
}

/// Axum-Router fuer den `/health`-Endpunkt
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `GET /health` – gibt den Serverstatus zurueck
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let response = state.antwort();
    let http_status = match response.status {
        // 200 auch bei degraded, lokale Verbindungen funktionieren weiter
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn ohne_broker_immer_healthy() {
        let state = HealthState::neu(false);
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert!(state.uptime_seconds() < 5);
    }

    #[test]
    fn broker_getrennt_ist_degraded() {
        let state = HealthState::neu(true);
        assert_eq!(state.status(), HealthStatus::Degraded);
        state.broker_status_setzen(true);
        assert_eq!(state.status(), HealthStatus::Healthy);
        state.broker_status_setzen(false);
        assert_eq!(state.status(), HealthStatus::Degraded);
    }

    #[test]
    fn health_response_serialisierung() {
        let state = HealthState::neu(true);
        let json = serde_json::to_string(&state.antwort()).unwrap();
        assert!(json.contains("\"status\":\"degraded\""));
        assert!(json.contains("\"broker_configured\":true"));
        assert!(json.contains("\"broker_connected\":false"));
    }

    #[tokio::test]
    async fn health_endpunkt_antwortet_mit_200() {
        let state = HealthState::neu(true);
        state.broker_status_setzen(true);
        let antwort = health_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(antwort.status(), StatusCode::OK);
    }
}
