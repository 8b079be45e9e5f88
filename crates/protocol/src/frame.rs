//! Frame-Umschlaege fuer eingehende und ausgehende Events

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtokollFehler;
use crate::events::ausgehend;

// ---------------------------------------------------------------------------
// Eingehend
// ---------------------------------------------------------------------------

/// Roh-Frame vom Client
///
/// `data` bleibt zunaechst untypisiert und wird erst anhand des Event-Namens
/// in ein [`crate::ClientPayload`] umgewandelt.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Vom Client vergebene ID, falls eine Antwort erwartet wird
    #[serde(default)]
    pub ack: Option<u64>,
}

impl ClientFrame {
    /// Liest einen Text-Frame
    pub fn parsen(text: &str) -> Result<Self, ProtokollFehler> {
        serde_json::from_str(text).map_err(|e| ProtokollFehler::UngueltigerFrame(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Ausgehend
// ---------------------------------------------------------------------------

/// Event vom Server an einen Client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl ServerEvent {
    /// Erstellt ein Event ohne Ack-Bezug
    pub fn neu(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    /// Erstellt die Antwort auf einen Client-Frame mit `ack`-ID
    pub fn antwort(ack: u64, data: Value) -> Self {
        Self {
            event: ausgehend::ACK.to_string(),
            data,
            ack: Some(ack),
        }
    }

    /// Serialisiert das Event als JSON-Text
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
