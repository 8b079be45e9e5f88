//! Cluster-Events fuer den prozessuebergreifenden Fan-out
//!
//! Jedes Event, das ein Prozess an Benutzer, Raeume oder alle Verbindungen
//! ausliefert, wird zusaetzlich als `ClusterEvent` ueber den Broker
//! veroeffentlicht. Die anderen Prozesse stellen es an ihre lokalen
//! Verbindungen zu. Der Absender erkennt sein eigenes Echo an `herkunft`.

use crate::error::CoreResult;
use crate::types::{ConnectionId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Adressat eines Cluster-Events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "art", rename_all = "snake_case")]
pub enum Ziel {
    /// Alle Verbindungen eines Benutzers (persoenlicher Kanal `user:{id}`)
    User { user_id: UserId },
    /// Alle Mitglieder eines Raums, optional ohne die ausloesende Verbindung
    Raum {
        raum_id: RoomId,
        ausser: Option<ConnectionId>,
    },
    /// Alle Abonnenten des Presence-Status eines Benutzers
    Abonnenten { user_id: UserId },
    /// Jede Verbindung im Cluster
    Alle,
    /// Alle Verbindungen eines Benutzers trennen (administrativ)
    Trennen { user_id: UserId, grund: String },
}

/// Umschlag fuer ein Event auf dem Broker-Kanal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Node-ID des veroeffentlichenden Prozesses
    pub herkunft: String,
    pub ziel: Ziel,
    /// Event-Name, z.B. `call:incoming`
    pub event: String,
    #[serde(default)]
    pub daten: serde_json::Value,
}

impl ClusterEvent {
    pub fn neu(
        herkunft: impl Into<String>,
        ziel: Ziel,
        event: impl Into<String>,
        daten: serde_json::Value,
    ) -> Self {
        Self {
            herkunft: herkunft.into(),
            ziel,
            event: event.into(),
            daten,
        }
    }

    /// Serialisiert das Event fuer den Broker
    pub fn zu_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Liest ein Event aus einer Broker-Nachricht
    pub fn aus_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
