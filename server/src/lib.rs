//! vitalink-server – Bibliotheks-Root
//!
//! Verdrahtet den Echtzeit-Kern mit Broker, Admin-API und Observability
//! und stellt den Router fuer Integrationstests bereit.

pub mod admin;
pub mod config;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use vitalink_auth::JwtPruefer;
use vitalink_observability::{
    health_router, observability_server_starten, request_timing_layer, timing_middleware,
    HealthState, VitalinkMetriken,
};
use vitalink_signaling::{
    ws_router, RedisBroker, RedisPresence, RollenZugriff, SignalingState, SpeicherAblage,
};

use admin::{admin_router, AdminState};
use config::ServerConfig;

/// Periode der Metrik-Abtastung
const ABTAST_INTERVALL: Duration = Duration::from_secs(5);

/// Wartezeit vor dem zweiten Broker-Verbindungsversuch
const BROKER_BACKOFF_MIN: Duration = Duration::from_millis(500);

/// Obergrenze der Wartezeit zwischen Broker-Verbindungsversuchen
const BROKER_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Server-Subsysteme und laeuft bis zum Shutdown
    ///
    /// Reihenfolge:
    /// 1. Echtzeit-Kern aufbauen
    /// 2. Broker im Hintergrund anbinden (falls konfiguriert)
    /// 3. Hintergrund-Tasks und Observability-Server starten
    /// 4. WebSocket + Admin-API bedienen bis zum Shutdown-Signal
    pub async fn starten(self) -> Result<()> {
        let secret = self
            .config
            .jwt_secret()
            .context("Kein JWT-Secret konfiguriert")?;

        let zugriff = RollenZugriff::neu(self.config.auth.vollzugriff_rollen.clone());
        let state = SignalingState::neu(
            self.config.signaling_config(),
            JwtPruefer::neu(secret),
            Arc::new(zugriff.clone()),
            Arc::new(SpeicherAblage::neu()),
        );

        tracing::info!(
            server_name = %self.config.server.name,
            node_id = %state.config.node_id,
            adresse = %self.config.bind_adresse(),
            "Server startet"
        );

        // Ohne Broker laeuft der Knoten lokal weiter, /health meldet degraded
        if let Some(url) = &self.config.broker.url {
            let _broker = broker_anbinden(
                state.clone(),
                url.clone(),
                self.config.broker.kanal.clone(),
                self.config.broker.presence_praefix.clone(),
            );
        } else {
            tracing::info!("Kein Broker konfiguriert, Fan-out nur lokal");
        }

        let metriken = VitalinkMetriken::neu().context("Metriken nicht registrierbar")?;
        let health = HealthState::neu(self.config.broker.url.is_some());

        let _hintergrund = state.hintergrund_starten();
        let _abtastung = abtastung_starten(state.clone(), metriken.clone(), health.clone());

        if self.config.observability.aktiviert {
            let addr: SocketAddr = self
                .config
                .observability_bind_adresse()
                .parse()
                .context("Ungueltige Observability-Adresse")?;
            let (m, h) = (metriken.clone(), health.clone());
            tokio::spawn(async move {
                if let Err(e) = observability_server_starten(addr, m, h).await {
                    tracing::error!(fehler = %e, "Observability-Server beendet");
                }
            });
        }

        let app = app_router(
            state.clone(),
            AdminState::neu(state.clone(), zugriff),
            metriken,
            health,
            &self.config.netzwerk.cors_origins,
        );

        let adresse = self.config.bind_adresse();
        let listener = tokio::net::TcpListener::bind(&adresse)
            .await
            .with_context(|| format!("Bind auf '{adresse}' fehlgeschlagen"))?;
        tracing::info!(adresse = %adresse, "WebSocket- und Admin-Server bereit");

        // Ctrl-C loest denselben Shutdown aus wie die Admin-API
        let signal_state = state.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
                    signal_state.herunterfahren().await;
                }
                Err(e) => tracing::error!(fehler = %e, "Signal-Handler nicht installierbar"),
            }
        });

        let shutdown_state = state.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_state.auf_shutdown_warten().await })
            .await
            .context("HTTP-Server beendet mit Fehler")?;

        tracing::info!("Server beendet");
        Ok(())
    }
}

/// Baut den vollstaendigen Router: `/ws`, `/admin/*` und `/health`
pub fn app_router(
    state: Arc<SignalingState>,
    admin: AdminState,
    metriken: VitalinkMetriken,
    health: HealthState,
    cors_origins: &[String],
) -> Router {
    // CORS konfigurieren: entweder spezifische Origins oder Any
    let cors = if cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(tower_http::cors::Any)
    };

    Router::new()
        .merge(ws_router(state))
        .merge(admin_router(admin))
        .merge(health_router(health))
        .layer(axum::middleware::from_fn_with_state(metriken, timing_middleware))
        .layer(request_timing_layer())
        .layer(cors)
}

/// Bindet Redis-Broker und Presence-Speicher im Hintergrund an
///
/// Schlaegt ein Versuch fehl, bleiben Fan-out und Presence lokal und der
/// Task versucht es mit verdoppelter Wartezeit erneut. Liefert `true`
/// sobald beides aktiv ist, `false` wenn vorher heruntergefahren wird.
pub fn broker_anbinden(
    state: Arc<SignalingState>,
    url: String,
    kanal: String,
    presence_praefix: String,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let mut wartezeit = BROKER_BACKOFF_MIN;
        loop {
            let versuch = async {
                let presence = RedisPresence::verbinden(&url, presence_praefix.as_str()).await?;
                let broker = RedisBroker::verbinden(&url).await?;
                state.verteiler.broker_verbinden(Arc::new(broker), &kanal).await?;
                state.presence.speicher_verbinden(Arc::new(presence))
            };
            let ergebnis = tokio::select! {
                ergebnis = versuch => ergebnis,
                _ = state.auf_shutdown_warten() => return false,
            };

            match ergebnis {
                Ok(()) => return true,
                Err(e) => tracing::warn!(
                    fehler = %e,
                    wartezeit_ms = wartezeit.as_millis() as u64,
                    "Broker nicht erreichbar, Fan-out nur lokal"
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(wartezeit) => {}
                _ = state.auf_shutdown_warten() => return false,
            }
            wartezeit = (wartezeit * 2).min(BROKER_BACKOFF_MAX);
        }
    })
}

/// Startet die periodische Abtastung der Gauges und Counter
pub fn abtastung_starten(
    state: Arc<SignalingState>,
    metriken: VitalinkMetriken,
    health: HealthState,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut intervall = tokio::time::interval(ABTAST_INTERVALL);
        loop {
            tokio::select! {
                _ = intervall.tick() => metriken_abtasten(&state, &metriken, &health),
                _ = state.auf_shutdown_warten() => break,
            }
        }
    })
}

/// Uebertraegt den aktuellen Zustand des Kerns in die Metriken
pub fn metriken_abtasten(state: &SignalingState, metriken: &VitalinkMetriken, health: &HealthState) {
    metriken.verbindungen.set(state.registry.anzahl() as i64);
    metriken
        .online_benutzer
        .set(state.presence.statistik().online_users as i64);
    metriken.aktive_anrufe.set(state.anrufe.aktive_anzahl() as i64);
    metriken.raeume.set(state.raeume.anzahl() as i64);

    VitalinkMetriken::counter_nachziehen(
        &metriken.fanout_veroeffentlicht,
        state.verteiler.veroeffentlicht(),
    );
    VitalinkMetriken::counter_nachziehen(&metriken.fanout_empfangen, state.verteiler.empfangen());

    for (status, anzahl) in state.anrufe.statistik().finished_by_status {
        let counter = metriken.anrufe_beendet.with_label_values(&[status]);
        VitalinkMetriken::counter_nachziehen(&counter, anzahl);
    }

    health.broker_status_setzen(state.verteiler.broker_aktiv());
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use vitalink_auth::Identitaet;
    use vitalink_core::{Rolle, UserId};
    use vitalink_signaling::SignalingConfig;

    fn state() -> (Arc<SignalingState>, RollenZugriff) {
        let zugriff = RollenZugriff::neu(vec!["admin".into()]);
        let state = SignalingState::neu(
            SignalingConfig::default(),
            JwtPruefer::neu("geheim"),
            Arc::new(zugriff.clone()),
            Arc::new(SpeicherAblage::neu()),
        );
        (state, zugriff)
    }

    #[tokio::test]
    async fn abtastung_setzt_gauges() {
        let (state, _) = state();
        let metriken = VitalinkMetriken::neu().unwrap();
        let health = HealthState::neu(false);

        let identitaet = Identitaet {
            user_id: UserId::neu("p1"),
            rolle: Rolle::neu("patient"),
            email: None,
        };
        let _a = state.verbindung_oeffnen(&identitaet).unwrap();
        let _b = state.verbindung_oeffnen(&identitaet).unwrap();

        metriken_abtasten(&state, &metriken, &health);
        assert_eq!(metriken.verbindungen.get(), 2);
        assert_eq!(metriken.online_benutzer.get(), 1);
        assert_eq!(metriken.aktive_anrufe.get(), 0);
        assert!(!health.broker_verbunden());
    }

    #[tokio::test]
    async fn router_bedient_health_und_zaehlt() {
        let (state, zugriff) = state();
        let metriken = VitalinkMetriken::neu().unwrap();
        let app = app_router(
            state.clone(),
            AdminState::neu(state, zugriff),
            metriken.clone(),
            HealthState::neu(false),
            &[],
        );

        let antwort = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(antwort.status(), StatusCode::OK);

        // Ohne Upgrade-Header lehnt axum den WebSocket-Pfad ab
        let antwort = app
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(antwort.status().is_client_error());

        assert_eq!(
            metriken
                .http_requests_total
                .with_label_values(&["GET", "/health", "200"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn start_ohne_erreichbaren_broker_bleibt_lokal() {
        let (state, _) = state();
        let metriken = VitalinkMetriken::neu().unwrap();
        let health = HealthState::neu(true);

        let anbindung = broker_anbinden(
            state.clone(),
            "redis://127.0.0.1:1".into(),
            "vitalink:fanout".into(),
            "vitalink:presence".into(),
        );

        // Der Kern nimmt weiter Verbindungen an
        let identitaet = Identitaet {
            user_id: UserId::neu("p1"),
            rolle: Rolle::neu("patient"),
            email: None,
        };
        let _handle = state.verbindung_oeffnen(&identitaet).unwrap();
        assert!(!state.verteiler.broker_konfiguriert());

        metriken_abtasten(&state, &metriken, &health);
        assert_eq!(health.status(), vitalink_observability::HealthStatus::Degraded);
        assert_eq!(metriken.verbindungen.get(), 1);

        state.herunterfahren().await;
        let verbunden = tokio::time::timeout(Duration::from_secs(5), anbindung)
            .await
            .unwrap()
            .unwrap();
        assert!(!verbunden);
    }

    #[tokio::test]
    async fn abtastung_endet_mit_shutdown() {
        let (state, _) = state();
        let handle = abtastung_starten(
            state.clone(),
            VitalinkMetriken::neu().unwrap(),
            HealthState::neu(false),
        );
        state.herunterfahren().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
