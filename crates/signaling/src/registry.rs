//! Verbindungs-Registry – Alle lebenden Verbindungen dieses Prozesses
//!
//! Die Registry haelt pro Verbindung die Metadaten, die Send-Queue und
//! ein Abbruch-Token fuer die Sitzungsschleife. Ein Index nach UserId
//! bildet den persoenlichen Kanal `user:{id}` ab.
//!
//! Der Zustand ist prozesslokal. Andere Prozesse erfahren von Verbindungen
//! nur ueber Presence- und Fan-out-Events, nie durch direkte Abfragen.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vitalink_auth::Identitaet;
use vitalink_core::{jetzt, ConnectionId, Rolle, UserId};
use vitalink_protocol::ServerEvent;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Groesse der Send-Queue pro Verbindung
const SEND_QUEUE_GROESSE: usize = 256;

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

/// Transport einer Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    WebSocket,
}

/// Metadaten einer Verbindung
#[derive(Debug, Clone)]
pub struct VerbindungsInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub rolle: Rolle,
    pub email: Option<String>,
    pub verbunden_seit: DateTime<Utc>,
    pub letzte_aktivitaet: DateTime<Utc>,
    pub transport: Transport,
}

/// Empfangsseite einer registrierten Verbindung
///
/// Die Sitzungsschleife liest aus `rx` und beendet sich, sobald `abbruch`
/// ausgeloest wird.
pub struct VerbindungsHandle {
    pub connection_id: ConnectionId,
    pub rx: mpsc::Receiver<ServerEvent>,
    pub abbruch: CancellationToken,
}

/// Eintrag fuer die Admin-Statistik
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbindungsUebersicht {
    pub socket_id: ConnectionId,
    pub user_id: UserId,
    pub user_role: Rolle,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub duration_ms: i64,
    pub transport: Transport,
}

/// Statistik aller Verbindungen dieses Prozesses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbindungsStatistik {
    pub total_connections: usize,
    pub unique_users: usize,
    pub connections: Vec<VerbindungsUebersicht>,
}

// ---------------------------------------------------------------------------
// ClientSender
// ---------------------------------------------------------------------------

/// Handle auf die Send-Queue einer Verbindung
#[derive(Clone, Debug)]
struct ClientSender {
    connection_id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ClientSender {
    /// Sendet ein Event nicht-blockierend
    ///
    /// Gibt `false` zurueck wenn die Queue voll oder geschlossen ist.
    fn senden(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(e)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    event = %e.event,
                    "Send-Queue voll – Event verworfen"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    "Send-Queue geschlossen (Verbindung getrennt)"
                );
                false
            }
        }
    }
}

struct Eintrag {
    info: VerbindungsInfo,
    /// Monotoner Zeitpunkt der letzten Aktivitaet fuer den Leerlauf-Sweep
    aktiv_seit: Instant,
    sender: ClientSender,
    abbruch: CancellationToken,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry aller Verbindungen dieses Prozesses
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    verbindungen: DashMap<ConnectionId, Eintrag>,
    nach_user: DashMap<UserId, HashSet<ConnectionId>>,
}

impl Registry {
    /// Erstellt eine leere Registry
    pub fn neu() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                verbindungen: DashMap::new(),
                nach_user: DashMap::new(),
            }),
        }
    }

    /// Registriert eine Verbindung und gibt ihre Empfangsseite zurueck
    ///
    /// Idempotent pro `connection_id`: eine bereits registrierte Verbindung
    /// bleibt unveraendert und es wird `None` zurueckgegeben.
    pub fn registrieren(
        &self,
        connection_id: ConnectionId,
        identitaet: &Identitaet,
        transport: Transport,
    ) -> Option<VerbindungsHandle> {
        use dashmap::mapref::entry::Entry;

        let eintrag = match self.inner.verbindungen.entry(connection_id) {
            Entry::Occupied(_) => {
                tracing::debug!(connection_id = %connection_id, "Verbindung bereits registriert");
                return None;
            }
            Entry::Vacant(v) => v,
        };

        let (tx, rx) = mpsc::channel(SEND_QUEUE_GROESSE);
        let abbruch = CancellationToken::new();
        let zeit = jetzt();
        eintrag.insert(Eintrag {
            info: VerbindungsInfo {
                connection_id,
                user_id: identitaet.user_id.clone(),
                rolle: identitaet.rolle.clone(),
                email: identitaet.email.clone(),
                verbunden_seit: zeit,
                letzte_aktivitaet: zeit,
                transport,
            },
            aktiv_seit: Instant::now(),
            sender: ClientSender { connection_id, tx },
            abbruch: abbruch.clone(),
        });

        self.inner
            .nach_user
            .entry(identitaet.user_id.clone())
            .or_default()
            .insert(connection_id);

        tracing::debug!(
            connection_id = %connection_id,
            user_id = %identitaet.user_id,
            "Verbindung registriert"
        );

        Some(VerbindungsHandle {
            connection_id,
            rx,
            abbruch,
        })
    }

    /// Aktualisiert die letzte Aktivitaet einer Verbindung
    pub fn beruehren(&self, connection_id: &ConnectionId) -> bool {
        match self.inner.verbindungen.get_mut(connection_id) {
            Some(mut eintrag) => {
                eintrag.info.letzte_aktivitaet = jetzt();
                eintrag.aktiv_seit = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Entfernt eine Verbindung und loest ihr Abbruch-Token aus
    ///
    /// Gibt die Metadaten zurueck, falls die Verbindung noch registriert war.
    pub fn entfernen(&self, connection_id: &ConnectionId) -> Option<VerbindungsInfo> {
        let (_, eintrag) = self.inner.verbindungen.remove(connection_id)?;
        eintrag.abbruch.cancel();

        let user_id = eintrag.info.user_id.clone();
        if let Some(mut ids) = self.inner.nach_user.get_mut(&user_id) {
            ids.remove(connection_id);
        }
        self.inner.nach_user.remove_if(&user_id, |_, ids| ids.is_empty());

        tracing::debug!(connection_id = %connection_id, user_id = %user_id, "Verbindung entfernt");
        Some(eintrag.info)
    }

    /// Loest das Abbruch-Token einer Verbindung aus, ohne sie zu entfernen
    ///
    /// Die Sitzungsschleife beendet sich daraufhin und fuehrt das Cleanup aus.
    pub fn abbrechen(&self, connection_id: &ConnectionId) -> bool {
        match self.inner.verbindungen.get(connection_id) {
            Some(eintrag) => {
                eintrag.abbruch.cancel();
                true
            }
            None => false,
        }
    }

    /// Verbindungen, die laenger als `max_leerlauf` keine Aktivitaet hatten
    pub fn veraltete(&self, max_leerlauf: Duration) -> Vec<ConnectionId> {
        let jetzt = Instant::now();
        self.inner
            .verbindungen
            .iter()
            .filter(|e| jetzt.duration_since(e.aktiv_seit) > max_leerlauf)
            .map(|e| *e.key())
            .collect()
    }

    /// Sendet ein Event an eine einzelne Verbindung
    pub fn an_verbindung(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        match self.inner.verbindungen.get(connection_id) {
            Some(eintrag) => eintrag.sender.senden(event),
            None => {
                tracing::debug!(connection_id = %connection_id, "Senden an unbekannte Verbindung");
                false
            }
        }
    }

    /// Sendet ein Event an alle lokalen Verbindungen eines Benutzers
    ///
    /// Gibt die Anzahl der erfolgreichen Sendungen zurueck.
    pub fn an_user(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        self.verbindungen_von(user_id)
            .iter()
            .filter(|id| self.an_verbindung(id, event.clone()))
            .count()
    }

    /// Sendet ein Event an alle lokalen Verbindungen
    pub fn an_alle(&self, event: &ServerEvent) -> usize {
        let mut gesendet = 0;
        self.inner.verbindungen.iter().for_each(|e| {
            if e.sender.senden(event.clone()) {
                gesendet += 1;
            }
        });
        gesendet
    }

    /// Alle lokalen Verbindungen eines Benutzers
    pub fn verbindungen_von(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.inner
            .nach_user
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Prueft ob ein Benutzer lokal mindestens eine Verbindung hat
    pub fn hat_verbindungen(&self, user_id: &UserId) -> bool {
        self.inner
            .nach_user
            .get(user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    /// Metadaten einer Verbindung
    pub fn info(&self, connection_id: &ConnectionId) -> Option<VerbindungsInfo> {
        self.inner
            .verbindungen
            .get(connection_id)
            .map(|e| e.info.clone())
    }

    /// IDs aller lokalen Verbindungen
    pub fn alle_ids(&self) -> Vec<ConnectionId> {
        self.inner.verbindungen.iter().map(|e| *e.key()).collect()
    }

    /// Anzahl der lokalen Verbindungen
    pub fn anzahl(&self) -> usize {
        self.inner.verbindungen.len()
    }

    /// Anzahl der Benutzer mit mindestens einer lokalen Verbindung
    pub fn benutzer_anzahl(&self) -> usize {
        self.inner.nach_user.len()
    }

    /// Statistik fuer die Admin-Schnittstelle
    pub fn statistik(&self) -> VerbindungsStatistik {
        let zeit = jetzt();
        let mut connections: Vec<VerbindungsUebersicht> = self
            .inner
            .verbindungen
            .iter()
            .map(|e| VerbindungsUebersicht {
                socket_id: e.info.connection_id,
                user_id: e.info.user_id.clone(),
                user_role: e.info.rolle.clone(),
                connected_at: e.info.verbunden_seit,
                last_activity: e.info.letzte_aktivitaet,
                duration_ms: (zeit - e.info.verbunden_seit).num_milliseconds(),
                transport: e.info.transport,
            })
            .collect();
        connections.sort_by_key(|c| c.connected_at);

        VerbindungsStatistik {
            total_connections: connections.len(),
            unique_users: self.benutzer_anzahl(),
            connections,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
