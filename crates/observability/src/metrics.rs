//! Prometheus-kompatible Metriken fuer Vitalink
//!
//! Registrierte Metriken:
//! - `vitalink_verbindungen` – Gauge: Lokale WebSocket-Verbindungen
//! - `vitalink_online_benutzer` – Gauge: Benutzer mit mindestens einer Verbindung
//! - `vitalink_aktive_anrufe` – Gauge: Nicht beendete Anrufe
//! - `vitalink_raeume` – Gauge: Raeume mit mindestens einem Mitglied
//! - `vitalink_fanout_veroeffentlicht_total` – Counter: An den Broker gesendete Events
//! - `vitalink_fanout_empfangen_total` – Counter: Vom Broker empfangene Events
//! - `vitalink_anrufe_beendet_total` – Counter: Beendete Anrufe (status)
//! - `vitalink_http_requests_total` – Counter: HTTP-Anfragen (method, path, status)
//! - `vitalink_http_request_duration_seconds` – Histogram: HTTP-Antwortzeit

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Alle Vitalink-Prometheus-Metriken
///
/// Clone teilt die Registry und alle Metriken.
#[derive(Clone)]
pub struct VitalinkMetriken {
    pub registry: Arc<Registry>,

    // Kern-Metriken
    pub verbindungen: IntGauge,
    pub online_benutzer: IntGauge,
    pub aktive_anrufe: IntGauge,
    pub raeume: IntGauge,

    // Cluster
    pub fanout_veroeffentlicht: IntCounter,
    pub fanout_empfangen: IntCounter,

    pub anrufe_beendet: IntCounterVec,

    // HTTP-Metriken
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
}

impl VitalinkMetriken {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let verbindungen = IntGauge::with_opts(Opts::new(
            "vitalink_verbindungen",
            "Anzahl lokaler WebSocket-Verbindungen",
        ))?;
        registry.register(Box::new(verbindungen.clone()))?;

        let online_benutzer = IntGauge::with_opts(Opts::new(
            "vitalink_online_benutzer",
            "Anzahl Benutzer mit mindestens einer Verbindung",
        ))?;
        registry.register(Box::new(online_benutzer.clone()))?;

        let aktive_anrufe = IntGauge::with_opts(Opts::new(
            "vitalink_aktive_anrufe",
            "Anzahl nicht beendeter Anrufe",
        ))?;
        registry.register(Box::new(aktive_anrufe.clone()))?;

        let raeume = IntGauge::with_opts(Opts::new("vitalink_raeume", "Anzahl aktiver Raeume"))?;
        registry.register(Box::new(raeume.clone()))?;

        let fanout_veroeffentlicht = IntCounter::with_opts(Opts::new(
            "vitalink_fanout_veroeffentlicht_total",
            "An den Broker veroeffentlichte Events",
        ))?;
        registry.register(Box::new(fanout_veroeffentlicht.clone()))?;

        let fanout_empfangen = IntCounter::with_opts(Opts::new(
            "vitalink_fanout_empfangen_total",
            "Vom Broker empfangene Events anderer Prozesse",
        ))?;
        registry.register(Box::new(fanout_empfangen.clone()))?;

        let anrufe_beendet = IntCounterVec::new(
            Opts::new("vitalink_anrufe_beendet_total", "Beendete Anrufe nach Endstatus"),
            &["status"],
        )?;
        registry.register(Box::new(anrufe_beendet.clone()))?;

        // --- HTTP-Metriken ---
        let http_requests_total = IntCounterVec::new(
            Opts::new("vitalink_http_requests_total", "Gesamtanzahl HTTP-Anfragen"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "vitalink_http_request_duration_seconds",
                "HTTP-Antwortzeit in Sekunden",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["method", "path"],
        )?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            verbindungen,
            online_benutzer,
            aktive_anrufe,
            raeume,
            fanout_veroeffentlicht,
            fanout_empfangen,
            anrufe_beendet,
            http_requests_total,
            http_request_duration_seconds,
        })
    }

    /// Erhoeht einen Counter auf einen absoluten Stand
    ///
    /// Die Quellen zaehlen selbst monoton, hier wird nur die Differenz
    /// nachgezogen.
    pub fn counter_nachziehen(counter: &IntCounter, stand: u64) {
        let bisher = counter.get();
        if stand > bisher {
            counter.inc_by(stand - bisher);
        }
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: VitalinkMetriken) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(State(metriken): State<VitalinkMetriken>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(fehler = %err, "Metriken-Export fehlgeschlagen");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
