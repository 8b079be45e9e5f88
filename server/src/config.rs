//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder ausser dem
//! JWT-Secret haben sinnvolle Standardwerte, sodass der Server ohne
//! Konfigurationsdatei lauffaehig ist.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vitalink_observability::{log_format_gueltig, log_level_gueltig};
use vitalink_signaling::{AnrufZeiten, SignalingConfig};

/// Umgebungsvariable fuer den Pfad der Konfigurationsdatei
pub const CONFIG_ENV: &str = "VITALINK_CONFIG";
/// Umgebungsvariable fuer das JWT-Secret
pub const JWT_SECRET_ENV: &str = "VITALINK_JWT_SECRET";
/// Umgebungsvariable fuer die Broker-URL
pub const BROKER_URL_ENV: &str = "REDIS_URL";

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Allgemeine Server-Einstellungen
    pub server: ServerEinstellungen,
    /// Netzwerk-Einstellungen
    pub netzwerk: NetzwerkEinstellungen,
    /// JWT und Rollen
    pub auth: AuthEinstellungen,
    /// Pub/Sub-Broker fuer den Cluster-Fan-out
    pub broker: BrokerEinstellungen,
    pub zeitlimits: Zeitlimits,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Observability-Einstellungen (Metriken, Health)
    pub observability: ObservabilityEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Anzeigename des Servers
    pub name: String,
    /// Cluster-Knoten-ID (leer = zufaellige UUID pro Prozess)
    pub node_id: Option<String>,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "Vitalink Echtzeit".into(),
            node_id: None,
        }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    pub bind_adresse: String,
    /// Port fuer WebSocket und Admin-API
    pub port: u16,
    /// CORS-Origins (leer = alle erlaubt)
    pub cors_origins: Vec<String>,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 4000,
            cors_origins: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEinstellungen {
    /// Gemeinsames HS256-Secret mit dem Token-Aussteller
    pub jwt_secret: Option<String>,
    /// Rollen mit Zugriff auf alle Besuche und die Admin-API
    pub vollzugriff_rollen: Vec<String>,
}

impl Default for AuthEinstellungen {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            vollzugriff_rollen: vec!["admin".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerEinstellungen {
    /// Redis-URL (leer = kein Cluster-Fan-out)
    pub url: Option<String>,
    /// Pub/Sub-Kanal aller Prozesse
    pub kanal: String,
    /// Schluessel-Praefix des gemeinsamen Presence-Stands
    pub presence_praefix: String,
}

impl Default for BrokerEinstellungen {
    fn default() -> Self {
        Self {
            url: None,
            kanal: "vitalink:fanout".into(),
            presence_praefix: vitalink_signaling::presence_speicher::STANDARD_PRAEFIX.into(),
        }
    }
}

/// Zeitlimits der Verbindungen und Anrufe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Zeitlimits {
    /// Verbindungen ohne Aktivitaet werden danach getrennt
    pub leerlauf_sek: u64,
    pub pruef_intervall_sek: u64,
    /// Klingeldauer bis zum verpassten Anruf
    pub klingel_sek: u64,
    /// ACCEPTED → IN_PROGRESS
    pub annahme_karenz_ms: u64,
    pub shutdown_karenz_ms: u64,
    pub ping_intervall_sek: u64,
    /// Wie lange beendete Anruf-IDs bekannt bleiben
    pub grabstein_sek: u64,
}

impl Default for Zeitlimits {
    fn default() -> Self {
        Self {
            leerlauf_sek: 300,
            pruef_intervall_sek: 30,
            klingel_sek: 30,
            annahme_karenz_ms: 1000,
            shutdown_karenz_ms: 1000,
            ping_intervall_sek: 25,
            grabstein_sek: 300,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Observability-Einstellungen (Metriken + Health-Check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    /// Aktiviert den Observability-Server
    pub aktiviert: bool,
    /// Port fuer Metriken und Health (Standard: 9300)
    pub port: u16,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            port: 9300,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    ///
    /// Umgebungsvariablen fuer Secret und Broker-URL werden danach
    /// angewendet, anschliessend wird die Konfiguration geprueft.
    pub fn laden(pfad: &str) -> Result<Self> {
        let mut config = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => Self::aus_toml(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Self::default()
            }
            Err(e) => bail!("Konfigurationsdatei '{pfad}' nicht lesbar: {e}"),
        };
        config.umgebung_anwenden(|name| std::env::var(name).ok());
        config.pruefen()?;
        Ok(config)
    }

    pub fn aus_toml(inhalt: &str) -> Result<Self> {
        Ok(toml::from_str(inhalt)?)
    }

    /// Ueberschreibt Werte aus der Umgebung
    pub fn umgebung_anwenden(&mut self, lesen: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lesen(JWT_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(url) = lesen(BROKER_URL_ENV).filter(|s| !s.is_empty()) {
            self.broker.url = Some(url);
        }
    }

    /// Prueft die Konfiguration auf Vollstaendigkeit
    pub fn pruefen(&self) -> Result<()> {
        if self.jwt_secret().is_none() {
            bail!("Kein JWT-Secret konfiguriert ([auth] jwt_secret oder {JWT_SECRET_ENV})");
        }
        if !log_level_gueltig(&self.logging.level) {
            bail!("Ungueltiges Log-Level '{}'", self.logging.level);
        }
        if !log_format_gueltig(&self.logging.format) {
            bail!("Ungueltiges Log-Format '{}' (erlaubt: text, json)", self.logging.format);
        }
        if self.zeitlimits.pruef_intervall_sek == 0 || self.zeitlimits.ping_intervall_sek == 0 {
            bail!("Pruef- und Ping-Intervall muessen groesser als 0 sein");
        }
        Ok(())
    }

    /// Das konfigurierte JWT-Secret, falls nicht leer
    pub fn jwt_secret(&self) -> Option<&str> {
        self.auth.jwt_secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Gibt die Bind-Adresse fuer WebSocket und Admin-API zurueck
    pub fn bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.port)
    }

    /// Gibt die Bind-Adresse fuer den Observability-Server zurueck
    pub fn observability_bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.observability.port)
    }

    /// Erzeugt die Konfiguration des Echtzeit-Kerns
    pub fn signaling_config(&self) -> SignalingConfig {
        let z = &self.zeitlimits;
        let mut config = SignalingConfig {
            leerlauf: Duration::from_secs(z.leerlauf_sek),
            pruef_intervall: Duration::from_secs(z.pruef_intervall_sek),
            anruf_zeiten: AnrufZeiten {
                klingeln: Duration::from_secs(z.klingel_sek),
                annahme_karenz: Duration::from_millis(z.annahme_karenz_ms),
                grabstein: Duration::from_secs(z.grabstein_sek),
            },
            shutdown_karenz: Duration::from_millis(z.shutdown_karenz_ms),
            ping_intervall: Duration::from_secs(z.ping_intervall_sek),
            ..SignalingConfig::default()
        };
        if let Some(node_id) = self.server.node_id.as_ref().filter(|n| !n.is_empty()) {
            config.node_id = node_id.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_hat_erwartete_werte() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.netzwerk.port, 4000);
        assert_eq!(cfg.auth.vollzugriff_rollen, vec!["admin".to_string()]);
        assert_eq!(cfg.broker.kanal, "vitalink:fanout");
        assert_eq!(cfg.broker.presence_praefix, "vitalink:presence");
        assert_eq!(cfg.zeitlimits.klingel_sek, 30);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.bind_adresse(), "0.0.0.0:4000");
        assert_eq!(cfg.observability_bind_adresse(), "0.0.0.0:9300");
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [server]
            node_id = "knoten-a"

            [auth]
            jwt_secret = "geheim"

            [zeitlimits]
            klingel_sek = 45
            annahme_karenz_ms = 250
        "#;
        let cfg = ServerConfig::aus_toml(toml).unwrap();
        assert_eq!(cfg.jwt_secret(), Some("geheim"));
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.zeitlimits.leerlauf_sek, 300);

        let sig = cfg.signaling_config();
        assert_eq!(sig.node_id, "knoten-a");
        assert_eq!(sig.anruf_zeiten.klingeln, Duration::from_secs(45));
        assert_eq!(sig.anruf_zeiten.annahme_karenz, Duration::from_millis(250));
        assert_eq!(sig.leerlauf, Duration::from_secs(300));
    }

    #[test]
    fn ohne_node_id_zufaellige_uuid() {
        let cfg = ServerConfig::default();
        let a = cfg.signaling_config().node_id;
        let b = cfg.signaling_config().node_id;
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn fehlendes_secret_ist_fehler() {
        let cfg = ServerConfig::default();
        let fehler = cfg.pruefen().unwrap_err();
        assert!(fehler.to_string().contains("JWT-Secret"));
    }

    #[test]
    fn umgebung_ueberschreibt_secret_und_broker() {
        let mut cfg = ServerConfig::aus_toml("[auth]\njwt_secret = \"alt\"").unwrap();
        cfg.umgebung_anwenden(|name| match name {
            JWT_SECRET_ENV => Some("neu".into()),
            BROKER_URL_ENV => Some("redis://localhost:6379".into()),
            _ => None,
        });
        assert_eq!(cfg.jwt_secret(), Some("neu"));
        assert_eq!(cfg.broker.url.as_deref(), Some("redis://localhost:6379"));
        assert!(cfg.pruefen().is_ok());
    }

    #[test]
    fn ungueltiges_log_format_wird_abgelehnt() {
        let mut cfg = ServerConfig::aus_toml("[auth]\njwt_secret = \"x\"").unwrap();
        cfg.logging.format = "xml".into();
        assert!(cfg.pruefen().is_err());
    }
}
