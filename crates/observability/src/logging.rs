//! Structured Logging Setup via tracing-subscriber
//!
//! Konfigurierbar per Umgebungsvariable:
//! - `VL_LOG_LEVEL`: Filter-Direktive (z.B. `info` oder `vitalink_signaling=debug`)
//! - `VL_LOG_FORMAT`: Format (text/json)
//!
//! Die Umgebung hat Vorrang vor der Konfigurationsdatei. Verbindungs-IDs
//! laufen als Span-Felder mit (`verbindung`-Span der Sitzung).

use tracing_subscriber::{fmt, EnvFilter};

/// Umgebungsvariable fuer den Log-Filter
pub const LOG_LEVEL_ENV: &str = "VL_LOG_LEVEL";

/// Umgebungsvariable fuer das Log-Format
pub const LOG_FORMAT_ENV: &str = "VL_LOG_FORMAT";

/// Initialisiert das Logging-System.
///
/// Faellt auf `level` / `format` aus der Konfiguration und zuletzt auf
/// `info` / `text` zurueck.
pub fn logging_initialisieren(level: &str, format: &str) {
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let aus_env = std::env::var(LOG_FORMAT_ENV).ok();
    let format = format_waehlen(aus_env.as_deref(), format);

    match format {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_current_span(true)
                .init();
        }
        _ => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
    }
}

/// Waehlt das Format: gueltiger Wert aus der Umgebung, sonst die Konfiguration
fn format_waehlen<'a>(aus_env: Option<&'a str>, konfiguriert: &'a str) -> &'a str {
    match aus_env {
        Some(f) if log_format_gueltig(f) => f,
        _ if log_format_gueltig(konfiguriert) => konfiguriert,
        _ => "text",
    }
}

/// Validiert ob ein Log-Level-String gueltig ist.
pub fn log_level_gueltig(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

/// Validiert ob ein Log-Format-String gueltig ist.
pub fn log_format_gueltig(format: &str) -> bool {
    matches!(format, "text" | "json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_werte() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(log_level_gueltig(level));
        }
        assert!(!log_level_gueltig("verbose"));
        assert!(!log_level_gueltig("INFO")); // Gross-/Kleinschreibung
        assert!(!log_level_gueltig(""));
    }

    #[test]
    fn log_format_werte() {
        assert!(log_format_gueltig("text"));
        assert!(log_format_gueltig("json"));
        assert!(!log_format_gueltig("xml"));
        assert!(!log_format_gueltig("JSON"));
    }

    #[test]
    fn umgebung_hat_vorrang() {
        assert_eq!(format_waehlen(Some("json"), "text"), "json");
        assert_eq!(format_waehlen(None, "json"), "json");
        assert_eq!(format_waehlen(Some("xml"), "json"), "json");
        assert_eq!(format_waehlen(Some("xml"), "yaml"), "text");
    }
}
