//! Presence-Tracker – Online-Status pro Benutzer
//!
//! Der Status wird aus der Menge der lebenden Verbindungen eines Benutzers
//! abgeleitet: `offline` genau dann, wenn die Menge leer ist. Ein eigener
//! Status (away, busy, in_call) ueberlagert `online`, beeinflusst aber nie
//! die Online/Offline-Ableitung.
//!
//! Aenderungen werden als [`PresenceInfo`] zurueckgegeben. Der Aufrufer
//! verteilt sie an die Abonnenten (siehe `SignalingState`). Mit einem
//! [`PresenceSpeicher`] werden sie zusaetzlich fuer die anderen Prozesse
//! gespiegelt.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use vitalink_core::{jetzt, ConnectionId, UserId};
use vitalink_protocol::PresenceStatus;

use crate::error::{SignalingError, SignalingResult};
use crate::presence_speicher::{PresenceSpeicher, PRESENCE_TTL};

/// Puffer fuer ausstehende Schreibvorgaenge in den Speicher
const SPIEGEL_PUFFER: usize = 1024;

/// Online-Eintraege werden vor Ablauf der TTL neu geschrieben
const AUFFRISCH_INTERVALL: Duration = Duration::from_secs(PRESENCE_TTL.as_secs() / 2);

// ---------------------------------------------------------------------------
// PresenceInfo
// ---------------------------------------------------------------------------

/// Momentaufnahme des Presence-Zustands eines Benutzers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub custom_status: Option<String>,
    pub is_online: bool,
}

/// Statistik fuer die Admin-Schnittstelle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatistik {
    pub online_users: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub subscriptions: usize,
}

#[derive(Debug, Default)]
struct PresenceEintrag {
    verbindungen: HashSet<ConnectionId>,
    eigener_status: Option<PresenceStatus>,
    eigener_text: Option<String>,
    zuletzt_gesehen: Option<DateTime<Utc>>,
    /// Monotoner Zeitpunkt der letzten Offline-Meldung
    offline_seit: Option<Instant>,
}

impl PresenceEintrag {
    fn status(&self) -> PresenceStatus {
        if self.verbindungen.is_empty() {
            PresenceStatus::Offline
        } else {
            self.eigener_status.unwrap_or(PresenceStatus::Online)
        }
    }

    fn info(&self, user_id: &UserId) -> PresenceInfo {
        PresenceInfo {
            user_id: user_id.clone(),
            status: self.status(),
            last_seen: self.zuletzt_gesehen,
            custom_status: self.eigener_text.clone(),
            is_online: !self.verbindungen.is_empty(),
        }
    }
}

fn offline_info(user_id: &UserId) -> PresenceInfo {
    PresenceInfo {
        user_id: user_id.clone(),
        status: PresenceStatus::Offline,
        last_seen: None,
        custom_status: None,
        is_online: false,
    }
}

// ---------------------------------------------------------------------------
// PresenceTracker
// ---------------------------------------------------------------------------

/// Verwaltet den Online-Status aller Benutzer dieses Prozesses
///
/// Thread-safe via Arc + DashMap. Clone des Trackers teilt den inneren Zustand.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceTrackerInner>,
}

struct PresenceTrackerInner {
    eintraege: DashMap<UserId, PresenceEintrag>,
    /// Beobachteter Benutzer -> abonnierende Verbindungen
    abonnenten: DashMap<UserId, HashSet<ConnectionId>>,
    /// Verbindung -> beobachtete Benutzer (fuer das Cleanup)
    abos_von: DashMap<ConnectionId, HashSet<UserId>>,
    speicher: OnceLock<Arc<dyn PresenceSpeicher>>,
    spiegel: OnceLock<mpsc::Sender<PresenceInfo>>,
}

impl PresenceTracker {
    /// Erstellt einen neuen PresenceTracker
    pub fn neu() -> Self {
        Self {
            inner: Arc::new(PresenceTrackerInner {
                eintraege: DashMap::new(),
                abonnenten: DashMap::new(),
                abos_von: DashMap::new(),
                speicher: OnceLock::new(),
                spiegel: OnceLock::new(),
            }),
        }
    }

    /// Verbindet den Tracker mit einem gemeinsamen Presence-Speicher
    ///
    /// Startet den Task, der Aenderungen schreibt und die Eintraege der
    /// lokalen online-Benutzer auffrischt. Kann nur einmal aufgerufen werden.
    pub fn speicher_verbinden(&self, speicher: Arc<dyn PresenceSpeicher>) -> SignalingResult<()> {
        if self.inner.speicher.set(speicher.clone()).is_err() {
            return Err(SignalingError::intern("Presence-Speicher bereits verbunden"));
        }

        let (tx, mut rx) = mpsc::channel::<PresenceInfo>(SPIEGEL_PUFFER);
        let schwach: Weak<PresenceTrackerInner> = Arc::downgrade(&self.inner);
        let name = speicher.name();

        tokio::spawn(async move {
            let mut auffrischen = tokio::time::interval_at(
                Instant::now() + AUFFRISCH_INTERVALL,
                AUFFRISCH_INTERVALL,
            );
            loop {
                tokio::select! {
                    info = rx.recv() => {
                        let Some(info) = info else { break };
                        if let Err(e) = speicher.schreiben(&info).await {
                            tracing::warn!(user_id = %info.user_id, fehler = %e, "Presence nicht gespiegelt");
                        }
                    }
                    _ = auffrischen.tick() => {
                        let Some(inner) = schwach.upgrade() else { break };
                        let online: Vec<PresenceInfo> = inner
                            .eintraege
                            .iter()
                            .filter(|e| !e.verbindungen.is_empty())
                            .map(|e| e.info(e.key()))
                            .collect();
                        drop(inner);
                        for info in &online {
                            if let Err(e) = speicher.schreiben(info).await {
                                tracing::warn!(fehler = %e, "Presence-Auffrischung fehlgeschlagen");
                                break;
                            }
                        }
                    }
                }
            }
        });

        let _ = self.inner.spiegel.set(tx);
        tracing::info!(speicher = name, "Presence-Speicher aktiv");
        Ok(())
    }

    fn spiegeln(&self, info: &PresenceInfo) {
        if let Some(tx) = self.inner.spiegel.get() {
            if tx.try_send(info.clone()).is_err() {
                tracing::warn!(user_id = %info.user_id, "Presence-Spiegel ueberlastet");
            }
        }
    }

    /// Fuegt eine Verbindung zum aktiven Set des Benutzers hinzu
    ///
    /// Gibt die neue Presence zurueck, wenn dies die erste Verbindung ist.
    pub fn online_setzen(&self, user_id: &UserId, connection_id: ConnectionId) -> Option<PresenceInfo> {
        let mut eintrag = self.inner.eintraege.entry(user_id.clone()).or_default();
        let war_offline = eintrag.verbindungen.is_empty();
        eintrag.verbindungen.insert(connection_id);
        eintrag.zuletzt_gesehen = Some(jetzt());
        eintrag.offline_seit = None;

        if war_offline {
            tracing::info!(user_id = %user_id, "Benutzer online");
            let info = eintrag.info(user_id);
            self.spiegeln(&info);
            Some(info)
        } else {
            None
        }
    }

    /// Entfernt eine Verbindung aus dem aktiven Set des Benutzers
    ///
    /// Gibt die neue Presence zurueck, wenn das Set dadurch leer wird.
    pub fn offline_setzen(&self, user_id: &UserId, connection_id: &ConnectionId) -> Option<PresenceInfo> {
        let mut eintrag = self.inner.eintraege.get_mut(user_id)?;
        if !eintrag.verbindungen.remove(connection_id) || !eintrag.verbindungen.is_empty() {
            return None;
        }

        eintrag.zuletzt_gesehen = Some(jetzt());
        eintrag.offline_seit = Some(Instant::now());
        eintrag.eigener_status = None;
        eintrag.eigener_text = None;

        tracing::info!(user_id = %user_id, "Benutzer offline");
        let info = eintrag.info(user_id);
        self.spiegeln(&info);
        Some(info)
    }

    /// Setzt einen eigenen Status
    ///
    /// `offline` kann nicht gesetzt werden, er ergibt sich nur aus der
    /// Verbindungsmenge. `online` entfernt einen eigenen Status.
    pub fn status_setzen(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
        text: Option<String>,
    ) -> SignalingResult<PresenceInfo> {
        if status == PresenceStatus::Offline {
            return Err(SignalingError::anfrage("Status 'offline' cannot be set explicitly"));
        }

        let mut eintrag = self
            .inner
            .eintraege
            .get_mut(user_id)
            .filter(|e| !e.verbindungen.is_empty())
            .ok_or_else(|| SignalingError::anfrage("User is not online"))?;

        eintrag.eigener_status = match status {
            PresenceStatus::Online => None,
            anderer => Some(anderer),
        };
        eintrag.eigener_text = text;
        eintrag.zuletzt_gesehen = Some(jetzt());

        tracing::debug!(user_id = %user_id, status = status.als_str(), "Eigener Status gesetzt");
        let info = eintrag.info(user_id);
        self.spiegeln(&info);
        Ok(info)
    }

    /// Aktueller Zustand eines Benutzers
    pub fn abfragen(&self, user_id: &UserId) -> PresenceInfo {
        self.inner
            .eintraege
            .get(user_id)
            .map(|e| e.info(user_id))
            .unwrap_or_else(|| offline_info(user_id))
    }

    /// Aktueller Zustand mehrerer Benutzer
    pub fn mehrere_abfragen(&self, user_ids: &[UserId]) -> Vec<PresenceInfo> {
        user_ids.iter().map(|u| self.abfragen(u)).collect()
    }

    /// Zustand mehrerer Benutzer im ganzen Cluster
    ///
    /// Lokal verbundene Benutzer kommen aus dem Tracker, alle anderen aus
    /// dem Speicher. Ohne Speicher oder bei Lesefehlern gilt der lokale Stand.
    pub async fn cluster_abfragen(&self, user_ids: &[UserId]) -> Vec<PresenceInfo> {
        let mut stand = self.mehrere_abfragen(user_ids);
        let Some(speicher) = self.inner.speicher.get() else {
            return stand;
        };

        let (indizes, fremde): (Vec<usize>, Vec<UserId>) = stand
            .iter()
            .enumerate()
            .filter(|(_, info)| !info.is_online)
            .map(|(i, info)| (i, info.user_id.clone()))
            .unzip();
        if fremde.is_empty() {
            return stand;
        }

        match speicher.lesen(&fremde).await {
            Ok(gelesen) => {
                for (i, info) in indizes.into_iter().zip(gelesen) {
                    if let Some(info) = info {
                        stand[i] = info;
                    }
                }
            }
            Err(e) => tracing::warn!(fehler = %e, "Presence-Speicher nicht lesbar, nur lokaler Stand"),
        }
        stand
    }

    /// Entfernt Benutzer, die laenger als `max_alter` offline sind
    ///
    /// Eintraege mit Verbindungen bleiben immer erhalten.
    pub fn offline_bereinigen(&self, max_alter: Duration) -> usize {
        let vorher = self.inner.eintraege.len();
        self.inner.eintraege.retain(|_, e| {
            !e.verbindungen.is_empty()
                || e.offline_seit.map(|t| t.elapsed() < max_alter).unwrap_or(true)
        });
        vorher.saturating_sub(self.inner.eintraege.len())
    }

    /// Anzahl der bekannten Benutzer (online und kuerzlich offline)
    pub fn eintraege_anzahl(&self) -> usize {
        self.inner.eintraege.len()
    }

    /// Gibt true zurueck wenn der Benutzer mindestens eine Verbindung hat
    pub fn ist_online(&self, user_id: &UserId) -> bool {
        self.inner
            .eintraege
            .get(user_id)
            .map(|e| !e.verbindungen.is_empty())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Abonnements
    // -----------------------------------------------------------------------

    /// Abonniert Presence-Aenderungen und gibt den Anfangszustand zurueck
    pub fn abonnieren(&self, connection_id: ConnectionId, user_ids: &[UserId]) -> Vec<PresenceInfo> {
        for user_id in user_ids {
            self.inner
                .abonnenten
                .entry(user_id.clone())
                .or_default()
                .insert(connection_id);
        }
        self.inner
            .abos_von
            .entry(connection_id)
            .or_default()
            .extend(user_ids.iter().cloned());

        self.mehrere_abfragen(user_ids)
    }

    /// Verbindungen, die den Benutzer beobachten
    pub fn abonnenten_von(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.inner
            .abonnenten
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Entfernt alle Abonnements einer Verbindung
    pub fn abos_entfernen(&self, connection_id: &ConnectionId) {
        let Some((_, beobachtet)) = self.inner.abos_von.remove(connection_id) else {
            return;
        };
        for user_id in beobachtet {
            if let Some(mut ids) = self.inner.abonnenten.get_mut(&user_id) {
                ids.remove(connection_id);
            }
            self.inner.abonnenten.remove_if(&user_id, |_, ids| ids.is_empty());
        }
    }

    /// Statistik fuer die Admin-Schnittstelle
    pub fn statistik(&self) -> PresenceStatistik {
        let mut by_status = BTreeMap::new();
        let mut online_users = 0;
        for eintrag in self.inner.eintraege.iter() {
            let status = eintrag.status();
            if status != PresenceStatus::Offline {
                online_users += 1;
            }
            *by_status.entry(status.als_str()).or_insert(0) += 1;
        }

        PresenceStatistik {
            online_users,
            by_status,
            subscriptions: self.inner.abos_von.iter().map(|e| e.len()).sum(),
        }
    }
}

impl Default for PresenceTracker {
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

    fn u(id: &str) -> UserId {
        UserId::neu(id)
    }

    #[test]
    fn erste_verbindung_meldet_online() {
        let presence = PresenceTracker::neu();
        let c1 = ConnectionId::new();

        let aenderung = presence.online_setzen(&u("u1"), c1).expect("Aenderung erwartet");
        assert_eq!(aenderung.status, PresenceStatus::Online);
        assert!(aenderung.is_online);

        // Zweites Geraet aendert nichts
        assert!(presence.online_setzen(&u("u1"), ConnectionId::new()).is_none());
    }

    #[test]
    fn offline_erst_nach_letzter_verbindung() {
        let presence = PresenceTracker::neu();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        presence.online_setzen(&u("u1"), c1);
        presence.online_setzen(&u("u1"), c2);

        assert!(presence.offline_setzen(&u("u1"), &c1).is_none());
        assert!(presence.ist_online(&u("u1")));

        let aenderung = presence.offline_setzen(&u("u1"), &c2).expect("Offline erwartet");
        assert_eq!(aenderung.status, PresenceStatus::Offline);
        assert!(aenderung.last_seen.is_some());
        assert!(!presence.ist_online(&u("u1")));
    }

    #[test]
    fn unbekannte_verbindung_aendert_nichts() {
        let presence = PresenceTracker::neu();
        presence.online_setzen(&u("u1"), ConnectionId::new());
        assert!(presence.offline_setzen(&u("u1"), &ConnectionId::new()).is_none());
        assert!(presence.ist_online(&u("u1")));
    }

    #[test]
    fn eigener_status_ueberlagert_online() {
        let presence = PresenceTracker::neu();
        let c1 = ConnectionId::new();
        presence.online_setzen(&u("u1"), c1);

        let info = presence
            .status_setzen(&u("u1"), PresenceStatus::Busy, Some("In Sprechstunde".into()))
            .unwrap();
        assert_eq!(info.status, PresenceStatus::Busy);
        assert_eq!(info.custom_status.as_deref(), Some("In Sprechstunde"));
        assert!(info.is_online);

        // Beim Offline-Gehen wird der eigene Status verworfen
        presence.offline_setzen(&u("u1"), &c1);
        assert_eq!(presence.abfragen(&u("u1")).status, PresenceStatus::Offline);
        presence.online_setzen(&u("u1"), ConnectionId::new());
        assert_eq!(presence.abfragen(&u("u1")).status, PresenceStatus::Online);
    }

    #[test]
    fn offline_setzen_ist_verboten() {
        let presence = PresenceTracker::neu();
        presence.online_setzen(&u("u1"), ConnectionId::new());
        let fehler = presence
            .status_setzen(&u("u1"), PresenceStatus::Offline, None)
            .unwrap_err();
        assert!(matches!(fehler, SignalingError::UngueltigeAnfrage(_)));
    }

    #[test]
    fn unbekannter_benutzer_ist_offline() {
        let presence = PresenceTracker::neu();
        let info = presence.abfragen(&u("niemand"));
        assert_eq!(info.status, PresenceStatus::Offline);
        assert!(info.last_seen.is_none());
    }

    #[test]
    fn abonnements_werden_aufgeraeumt() {
        let presence = PresenceTracker::neu();
        let beobachter = ConnectionId::new();
        presence.online_setzen(&u("u2"), ConnectionId::new());

        let anfang = presence.abonnieren(beobachter, &[u("u2"), u("u3")]);
        assert_eq!(anfang.len(), 2);
        assert!(anfang[0].is_online);
        assert!(!anfang[1].is_online);
        assert_eq!(presence.abonnenten_von(&u("u2")), vec![beobachter]);

        presence.abos_entfernen(&beobachter);
        assert!(presence.abonnenten_von(&u("u2")).is_empty());
        assert_eq!(presence.statistik().subscriptions, 0);
    }

    #[test]
    fn statistik_nach_status() {
        let presence = PresenceTracker::neu();
        presence.online_setzen(&u("u1"), ConnectionId::new());
        presence.online_setzen(&u("u2"), ConnectionId::new());
        presence
            .status_setzen(&u("u2"), PresenceStatus::Away, None)
            .unwrap();

        let statistik = presence.statistik();
        assert_eq!(statistik.online_users, 2);
        assert_eq!(statistik.by_status.get("online"), Some(&1));
        assert_eq!(statistik.by_status.get("away"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_eintraege_werden_bereinigt() {
        let presence = PresenceTracker::neu();
        let c1 = ConnectionId::new();
        presence.online_setzen(&u("weg"), c1);
        presence.online_setzen(&u("da"), ConnectionId::new());
        presence.offline_setzen(&u("weg"), &c1);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(presence.offline_bereinigen(Duration::from_secs(300)), 0);
        assert_eq!(presence.eintraege_anzahl(), 2);

        tokio::time::advance(Duration::from_secs(201)).await;
        assert_eq!(presence.offline_bereinigen(Duration::from_secs(300)), 1);
        assert_eq!(presence.eintraege_anzahl(), 1);
        assert!(presence.ist_online(&u("da")));
        assert_eq!(presence.abfragen(&u("weg")).status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn zweiter_prozess_sieht_presence_ueber_speicher() {
        use crate::presence_speicher::SpeicherPresence;

        let speicher = Arc::new(SpeicherPresence::neu());
        let knoten_a = PresenceTracker::neu();
        let knoten_b = PresenceTracker::neu();
        knoten_a.speicher_verbinden(speicher.clone()).unwrap();
        knoten_b.speicher_verbinden(speicher.clone()).unwrap();
        assert!(knoten_a.speicher_verbinden(speicher.clone()).is_err());

        let c1 = ConnectionId::new();
        knoten_a.online_setzen(&u("u1"), c1);
        knoten_a.status_setzen(&u("u1"), PresenceStatus::Busy, Some("OP".into())).unwrap();

        let stand = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stand = knoten_b.cluster_abfragen(&[u("u1"), u("u2")]).await;
                if stand[0].status == PresenceStatus::Busy {
                    return stand;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(stand[0].is_online);
        assert_eq!(stand[0].custom_status.as_deref(), Some("OP"));
        assert!(!stand[1].is_online);
        // Lokal kennt Knoten B den Benutzer nicht
        assert!(!knoten_b.ist_online(&u("u1")));

        knoten_a.offline_setzen(&u("u1"), &c1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while knoten_b.cluster_abfragen(&[u("u1")]).await[0].is_online {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
