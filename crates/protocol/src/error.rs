//! Fehler-Codes und Protokollfehler

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Fehler-Codes
// ---------------------------------------------------------------------------

/// Standardisierte Fehler-Codes fuer Fehler-Acks (`{success:false, code}`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Allgemein
    InternalError,
    InvalidRequest,
    NotFound,
    // Auth
    AuthenticationFailed,
    AccessDenied,
    // Anruf-Zustandsmaschine
    InvalidState,
    // Cluster
    BrokerUnavailable,
}

impl ErrorCode {
    /// Wire-Darstellung des Codes
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::InternalError => "INTERNAL_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InvalidState => "INVALID_STATE",
            Self::BrokerUnavailable => "BROKER_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.als_str())
    }
}

// ---------------------------------------------------------------------------
// Protokollfehler
// ---------------------------------------------------------------------------

/// Fehler beim Lesen eines Client-Frames
#[derive(Debug, Error)]
pub enum ProtokollFehler {
    /// Frame ist kein gueltiges JSON oder hat kein `event`-Feld
    #[error("Ungueltiger Frame: {0}")]
    UngueltigerFrame(String),

    /// Event-Name ist nicht bekannt
    #[error("Unbekanntes Event: {0}")]
    UnbekanntesEvent(String),

    /// Nutzdaten passen nicht zum Event
    #[error("Ungueltige Daten fuer '{event}': {grund}")]
    UngueltigeDaten { event: String, grund: String },
}
