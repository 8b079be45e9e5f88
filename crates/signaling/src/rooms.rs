//! Raum-Manager – Benannte Gruppen von Verbindungen
//!
//! Raeume entstehen beim ersten Beitritt und verschwinden, sobald das letzte
//! Mitglied sie verlaesst. Jede Mitgliedschaft gehoert genau einer Verbindung,
//! ein Benutzer mit zwei Geraeten ist also zweimal Mitglied.
//!
//! ## Raum-IDs
//! - `chat:{a}:{b}` – Direktchat, IDs sortiert
//! - `call:{visitId}` – Videoanruf zu einem Besuch
//! - `notifications:{userId}` – Benachrichtigungen eines Benutzers
//! - `visit:{visitId}` – Alle Beteiligten eines Besuchs
//! - `topic:{thema}` – Themen-Abonnements

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use vitalink_core::{jetzt, ConnectionId, Rolle, RoomId, UserId};
use vitalink_protocol::RoomType;

// ---------------------------------------------------------------------------
// Raum-IDs
// ---------------------------------------------------------------------------

/// Direktchat zwischen zwei Benutzern, unabhaengig von der Reihenfolge
pub fn chat_raum_id(a: &UserId, b: &UserId) -> RoomId {
    let (erster, zweiter) = if a <= b { (a, b) } else { (b, a) };
    RoomId::neu(format!("chat:{erster}:{zweiter}"))
}

pub fn anruf_raum_id(visit_id: &str) -> RoomId {
    RoomId::neu(format!("call:{visit_id}"))
}

pub fn benachrichtigungs_raum_id(user_id: &UserId) -> RoomId {
    RoomId::neu(format!("notifications:{user_id}"))
}

pub fn besuchs_raum_id(visit_id: &str) -> RoomId {
    RoomId::neu(format!("visit:{visit_id}"))
}

pub fn themen_raum_id(thema: &str) -> RoomId {
    RoomId::neu(format!("topic:{thema}"))
}

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

/// Mitgliedschaft einer Verbindung in einem Raum
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Teilnehmer {
    pub socket_id: ConnectionId,
    pub user_id: UserId,
    pub user_role: Rolle,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Raum {
    typ: RoomType,
    mitglieder: HashMap<ConnectionId, Teilnehmer>,
    erstellt: DateTime<Utc>,
    metadata: Option<Value>,
}

/// Uebersicht eines Raums fuer die Admin-Schnittstelle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaumUebersicht {
    pub room_id: RoomId,
    pub room_type: RoomType,
    pub participants: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Statistik aller Raeume dieses Prozesses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaumStatistik {
    pub total_rooms: usize,
    pub by_type: BTreeMap<&'static str, usize>,
    pub rooms: Vec<RaumUebersicht>,
}

// ---------------------------------------------------------------------------
// RaumManager
// ---------------------------------------------------------------------------

/// Verwaltet Raeume und Mitgliedschaften
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct RaumManager {
    inner: Arc<RaumManagerInner>,
}

struct RaumManagerInner {
    raeume: DashMap<RoomId, Raum>,
    /// Verbindung -> Raeume (fuer das Cleanup)
    mitgliedschaften: DashMap<ConnectionId, HashSet<RoomId>>,
}

impl RaumManager {
    /// Erstellt einen leeren RaumManager
    pub fn neu() -> Self {
        Self {
            inner: Arc::new(RaumManagerInner {
                raeume: DashMap::new(),
                mitgliedschaften: DashMap::new(),
            }),
        }
    }

    /// Fuegt eine Verbindung einem Raum hinzu
    ///
    /// Legt den Raum bei Bedarf an. Ein erneuter Beitritt derselben
    /// Verbindung ist idempotent und liefert die bestehende Mitgliedschaft.
    /// Gibt die Mitgliedschaft und `true` bei neuem Beitritt zurueck.
    pub fn beitreten(
        &self,
        raum_id: &RoomId,
        typ: RoomType,
        connection_id: ConnectionId,
        user_id: &UserId,
        rolle: &Rolle,
        metadata: Option<Value>,
    ) -> (Teilnehmer, bool) {
        let (teilnehmer, neu) = {
            let mut raum = self.inner.raeume.entry(raum_id.clone()).or_insert_with(|| {
                tracing::debug!(room_id = %raum_id, room_type = typ.als_str(), "Raum erstellt");
                Raum {
                    typ,
                    mitglieder: HashMap::new(),
                    erstellt: jetzt(),
                    metadata,
                }
            });

            match raum.mitglieder.get(&connection_id) {
                Some(bestehend) => (bestehend.clone(), false),
                None => {
                    let teilnehmer = Teilnehmer {
                        socket_id: connection_id,
                        user_id: user_id.clone(),
                        user_role: rolle.clone(),
                        joined_at: jetzt(),
                    };
                    raum.mitglieder.insert(connection_id, teilnehmer.clone());
                    (teilnehmer, true)
                }
            }
        };

        if neu {
            self.inner
                .mitgliedschaften
                .entry(connection_id)
                .or_default()
                .insert(raum_id.clone());
            tracing::debug!(room_id = %raum_id, connection_id = %connection_id, "Raum beigetreten");
        }

        (teilnehmer, neu)
    }

    /// Entfernt eine Verbindung aus einem Raum
    ///
    /// Loescht den Raum, wenn er danach leer ist. Gibt die entfernte
    /// Mitgliedschaft zurueck, falls die Verbindung Mitglied war.
    pub fn verlassen(&self, raum_id: &RoomId, connection_id: &ConnectionId) -> Option<Teilnehmer> {
        let teilnehmer = self
            .inner
            .raeume
            .get_mut(raum_id)
            .and_then(|mut raum| raum.mitglieder.remove(connection_id))?;

        if self
            .inner
            .raeume
            .remove_if(raum_id, |_, raum| raum.mitglieder.is_empty())
            .is_some()
        {
            tracing::debug!(room_id = %raum_id, "Leerer Raum geloescht");
        }

        if let Some(mut raeume) = self.inner.mitgliedschaften.get_mut(connection_id) {
            raeume.remove(raum_id);
        }
        self.inner
            .mitgliedschaften
            .remove_if(connection_id, |_, raeume| raeume.is_empty());

        Some(teilnehmer)
    }

    /// Entfernt eine Verbindung aus allen Raeumen
    ///
    /// Gibt die verlassenen Raeume mit der jeweiligen Mitgliedschaft zurueck.
    pub fn verbindung_bereinigen(&self, connection_id: &ConnectionId) -> Vec<(RoomId, Teilnehmer)> {
        let Some((_, raeume)) = self.inner.mitgliedschaften.remove(connection_id) else {
            return Vec::new();
        };

        raeume
            .into_iter()
            .filter_map(|raum_id| {
                let teilnehmer = self
                    .inner
                    .raeume
                    .get_mut(&raum_id)
                    .and_then(|mut raum| raum.mitglieder.remove(connection_id))?;
                self.inner
                    .raeume
                    .remove_if(&raum_id, |_, raum| raum.mitglieder.is_empty());
                Some((raum_id, teilnehmer))
            })
            .collect()
    }

    /// Aktuelle Mitglieder eines Raums, nach Beitrittszeit sortiert
    pub fn teilnehmer(&self, raum_id: &RoomId) -> Vec<Teilnehmer> {
        let mut liste: Vec<Teilnehmer> = self
            .inner
            .raeume
            .get(raum_id)
            .map(|raum| raum.mitglieder.values().cloned().collect())
            .unwrap_or_default();
        liste.sort_by_key(|t| t.joined_at);
        liste
    }

    /// Lokale Verbindungen in einem Raum
    pub fn verbindungen_in(&self, raum_id: &RoomId) -> Vec<ConnectionId> {
        self.inner
            .raeume
            .get(raum_id)
            .map(|raum| raum.mitglieder.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Raeume, in denen eine Verbindung Mitglied ist
    pub fn raeume_von(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.inner
            .mitgliedschaften
            .get(connection_id)
            .map(|raeume| raeume.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ist_mitglied(&self, raum_id: &RoomId, connection_id: &ConnectionId) -> bool {
        self.inner
            .raeume
            .get(raum_id)
            .map(|raum| raum.mitglieder.contains_key(connection_id))
            .unwrap_or(false)
    }

    /// Anzahl der Raeume
    pub fn anzahl(&self) -> usize {
        self.inner.raeume.len()
    }

    /// Statistik fuer die Admin-Schnittstelle
    pub fn statistik(&self) -> RaumStatistik {
        let mut by_type = BTreeMap::new();
        let mut rooms: Vec<RaumUebersicht> = self
            .inner
            .raeume
            .iter()
            .map(|e| {
                *by_type.entry(e.typ.als_str()).or_insert(0) += 1;
                RaumUebersicht {
                    room_id: e.key().clone(),
                    room_type: e.typ,
                    participants: e.mitglieder.len(),
                    created_at: e.erstellt,
                    metadata: e.metadata.clone(),
                }
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        RaumStatistik {
            total_rooms: rooms.len(),
            by_type,
            rooms,
        }
    }
}

impl Default for RaumManager {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn beitreten(manager: &RaumManager, raum: &str, conn: ConnectionId, user: &str) -> bool {
        manager
            .beitreten(
                &RoomId::neu(raum),
                RoomType::Chat,
                conn,
                &UserId::neu(user),
                &Rolle::neu("patient"),
                None,
            )
            .1
    }

    #[test]
    fn chat_raum_id_ist_symmetrisch() {
        let a = UserId::neu("alice");
        let b = UserId::neu("bob");
        assert_eq!(chat_raum_id(&a, &b), chat_raum_id(&b, &a));
        assert_eq!(chat_raum_id(&a, &b).as_str(), "chat:alice:bob");
        assert_eq!(anruf_raum_id("v1").as_str(), "call:v1");
        assert_eq!(benachrichtigungs_raum_id(&a).as_str(), "notifications:alice");
    }

    #[test]
    fn beitritt_ist_idempotent() {
        let manager = RaumManager::neu();
        let c1 = ConnectionId::new();
        assert!(beitreten(&manager, "r1", c1, "u1"));
        assert!(!beitreten(&manager, "r1", c1, "u1"));
        assert_eq!(manager.teilnehmer(&RoomId::neu("r1")).len(), 1);
    }

    #[test]
    fn leerer_raum_wird_geloescht() {
        let manager = RaumManager::neu();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        beitreten(&manager, "r1", c1, "u1");
        beitreten(&manager, "r1", c2, "u2");

        assert!(manager.verlassen(&RoomId::neu("r1"), &c1).is_some());
        assert_eq!(manager.anzahl(), 1);
        assert!(manager.verlassen(&RoomId::neu("r1"), &c2).is_some());
        assert_eq!(manager.anzahl(), 0);

        // Verlassen ohne Mitgliedschaft ist ein No-op
        assert!(manager.verlassen(&RoomId::neu("r1"), &c2).is_none());
    }

    #[test]
    fn zwei_geraete_sind_zwei_mitglieder() {
        let manager = RaumManager::neu();
        beitreten(&manager, "r1", ConnectionId::new(), "u1");
        beitreten(&manager, "r1", ConnectionId::new(), "u1");
        assert_eq!(manager.verbindungen_in(&RoomId::neu("r1")).len(), 2);
    }

    #[test]
    fn bereinigen_entfernt_alle_mitgliedschaften() {
        let manager = RaumManager::neu();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        beitreten(&manager, "r1", c1, "u1");
        beitreten(&manager, "r2", c1, "u1");
        beitreten(&manager, "r2", c2, "u2");

        let mut verlassen = manager.verbindung_bereinigen(&c1);
        verlassen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(verlassen.len(), 2);
        assert_eq!(verlassen[0].0, RoomId::neu("r1"));
        assert_eq!(verlassen[1].1.user_id, UserId::neu("u1"));

        assert!(manager.raeume_von(&c1).is_empty());
        assert_eq!(manager.anzahl(), 1, "r1 geloescht, r2 bleibt");
        assert!(manager.ist_mitglied(&RoomId::neu("r2"), &c2));
        assert!(manager.verbindung_bereinigen(&c1).is_empty());
    }

    #[test]
    fn statistik_nach_typ() {
        let manager = RaumManager::neu();
        let c1 = ConnectionId::new();
        beitreten(&manager, "chat:a:b", c1, "a");
        manager.beitreten(
            &RoomId::neu("call:v1"),
            RoomType::VideoCall,
            c1,
            &UserId::neu("a"),
            &Rolle::neu("provider"),
            None,
        );

        let statistik = manager.statistik();
        assert_eq!(statistik.total_rooms, 2);
        assert_eq!(statistik.by_type.get("chat"), Some(&1));
        assert_eq!(statistik.by_type.get("video_call"), Some(&1));

        let json = serde_json::to_value(&statistik).unwrap();
        assert_eq!(json["rooms"][0]["roomId"], "call:v1");
        assert_eq!(json["rooms"][0]["roomType"], "video_call");
    }
}
