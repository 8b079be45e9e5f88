//! Fehlertypen fuer den Signaling-Kern
//!
//! Jede Variante wird auf einen [`ErrorCode`] und eine client-sichtbare
//! Meldung abgebildet. Interne Fehler verlassen den Server nie im Klartext.

use serde_json::{json, Value};
use thiserror::Error;
use vitalink_auth::AuthError;
use vitalink_protocol::{ack, CallStatus, ErrorCode};

/// Meldung fuer alle internen Fehler auf dem Wire
const GENERISCHE_MELDUNG: &str = "Internal server error";

/// Fehlertyp fuer den Signaling-Kern
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Ungueltige, fehlende oder abgelaufene Anmeldedaten
    #[error("Authentifizierungsfehler: {0}")]
    Authentifizierung(#[from] AuthError),

    /// Akteur ist kein Teilnehmer bzw. hat keinen Zugriff
    #[error("Zugriff verweigert: {0}")]
    ZugriffVerweigert(String),

    /// Anruf, Benachrichtigung oder Raum unbekannt
    #[error("Nicht gefunden: {0}")]
    NichtGefunden(String),

    /// Zustandsuebergang aus dem aktuellen Status nicht erlaubt
    #[error("Ungueltiger Zustand: {nachricht} (Status: {status})")]
    UngueltigerZustand {
        nachricht: String,
        status: CallStatus,
        erlaubt: Vec<&'static str>,
    },

    /// Validierungsfehler in den Nutzdaten
    #[error("Ungueltige Anfrage: {0}")]
    UngueltigeAnfrage(String),

    /// Broker nicht erreichbar
    #[error("Broker nicht verfuegbar: {0}")]
    BrokerNichtVerfuegbar(String),

    /// Fehler eines externen Kollaborateurs (Ablage, Richtlinie)
    #[error("Ablagefehler: {0}")]
    Ablage(String),

    /// Interner Fehler
    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl SignalingError {
    /// Erstellt einen internen Fehler
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Erstellt einen Validierungsfehler
    pub fn anfrage(msg: impl Into<String>) -> Self {
        Self::UngueltigeAnfrage(msg.into())
    }

    /// Erstellt einen Zustandsfehler mit den erlaubten Aktionen des Status
    pub fn zustand(nachricht: impl Into<String>, status: CallStatus) -> Self {
        Self::UngueltigerZustand {
            nachricht: nachricht.into(),
            status,
            erlaubt: status.erlaubte_aktionen(),
        }
    }

    /// Fehler-Code fuer das Ack
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Authentifizierung(_) => ErrorCode::AuthenticationFailed,
            Self::ZugriffVerweigert(_) => ErrorCode::AccessDenied,
            Self::NichtGefunden(_) => ErrorCode::NotFound,
            Self::UngueltigerZustand { .. } => ErrorCode::InvalidState,
            Self::UngueltigeAnfrage(_) => ErrorCode::InvalidRequest,
            Self::BrokerNichtVerfuegbar(_) => ErrorCode::BrokerUnavailable,
            Self::Ablage(_) | Self::Intern(_) => ErrorCode::InternalError,
        }
    }

    /// Gibt true zurueck fuer Fehler, deren Details nicht zum Client duerfen
    pub fn ist_intern(&self) -> bool {
        matches!(self, Self::Ablage(_) | Self::Intern(_))
    }

    /// Client-sichtbare Meldung
    pub fn client_meldung(&self) -> String {
        match self {
            Self::Authentifizierung(e) => e.grund().to_string(),
            Self::ZugriffVerweigert(m)
            | Self::NichtGefunden(m)
            | Self::UngueltigeAnfrage(m)
            | Self::BrokerNichtVerfuegbar(m) => m.clone(),
            Self::UngueltigerZustand { nachricht, .. } => nachricht.clone(),
            Self::Ablage(_) | Self::Intern(_) => GENERISCHE_MELDUNG.to_string(),
        }
    }

    /// Fehler-Ack `{success:false, error, code, ...}`
    pub fn als_ack(&self) -> Value {
        match self {
            Self::UngueltigerZustand {
                status, erlaubt, ..
            } => ack::fehler_mit(
                self.code(),
                &self.client_meldung(),
                json!({ "status": status, "allowedActions": erlaubt }),
            ),
            _ => ack::fehler(self.code(), &self.client_meldung()),
        }
    }
}

/// Result-Typ fuer den Signaling-Kern
pub type SignalingResult<T> = Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interne_details_bleiben_intern() {
        let e = SignalingError::intern("Mutex vergiftet in calls.rs");
        let ack = e.als_ack();
        assert_eq!(ack["success"], false);
        assert_eq!(ack["code"], "INTERNAL_ERROR");
        assert_eq!(ack["error"], "Internal server error");
        assert!(e.ist_intern());
    }

    #[test]
    fn zustandsfehler_nennt_status_und_aktionen() {
        let e = SignalingError::zustand("Cannot end call in ringing state", CallStatus::Ringing);
        let ack = e.als_ack();
        assert_eq!(ack["code"], "INVALID_STATE");
        assert_eq!(ack["status"], "ringing");
        assert_eq!(ack["allowedActions"][0], "accept");
    }

    #[test]
    fn auth_fehler_nutzt_grund() {
        let e = SignalingError::from(AuthError::TokenAbgelaufen);
        assert_eq!(e.client_meldung(), "Token expired");
        assert_eq!(e.code(), ErrorCode::AuthenticationFailed);
    }
}
