//! Gemeinsame Identifikationstypen fuer Vitalink
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen.
//!
//! Benutzer- und Raum-IDs sind fremdbestimmt (JWT bzw. Client) und daher
//! Strings. Verbindungs- und Anruf-IDs vergibt der Server selbst als UUID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aktueller Zeitpunkt in UTC
pub fn jetzt() -> DateTime<Utc> {
    Utc::now()
}

/// Benutzer-ID aus dem Token (`userId`-Claim)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn neu(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Rolle eines Benutzers (`role`-Claim), z.B. "patient", "provider", "admin"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rolle(pub String);

impl Rolle {
    pub fn neu(rolle: impl Into<String>) -> Self {
        Self(rolle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prueft die Rolle ohne Beachtung der Gross-/Kleinschreibung
    pub fn ist(&self, name: &str) -> bool {
        self.0.eq_ignore_ascii_case(name)
    }
}

impl std::fmt::Display for Rolle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Eindeutige Verbindungs-ID (pro Prozess vergeben, nie wiederverwendet)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Erstellt eine neue zufaellige ConnectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Eindeutige Anruf-ID, wird bei `initiate` erzeugt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Erstellt eine neue zufaellige CallId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name eines logischen Raums (Chat-Thread, Anruf-Raum, Thema)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn neu(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_eindeutig() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b, "Zwei neue ConnectionIds muessen verschieden sein");
    }

    #[test]
    fn call_id_eindeutig() {
        let a = CallId::new();
        let b = CallId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn rolle_vergleich_ignoriert_schreibweise() {
        let rolle = Rolle::neu("Admin");
        assert!(rolle.ist("admin"));
        assert!(!rolle.ist("provider"));
    }

    #[test]
    fn ids_serialisieren_transparent() {
        let uid = UserId::neu("u1");
        assert_eq!(serde_json::to_string(&uid).unwrap(), "\"u1\"");

        let cid = CallId(Uuid::nil());
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
        let zurueck: CallId = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck, cid);
    }
}
