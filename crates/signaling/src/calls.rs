//! Anruf-Engine – Zustandsmaschine fuer Audio-/Videoanrufe
//!
//! ```text
//! Initiating -> Ringing -> Accepted -> InProgress -> Ended
//!                  |
//!                  +-> Rejected | Missed
//! ```
//!
//! Alle aktiven Anrufe liegen in einer Tabelle hinter einem Mutex. Jede
//! Zustandsaenderung und die zugehoerige Benachrichtigung passieren unter
//! diesem Lock, damit ein Teilnehmer das terminale Event immer als letztes
//! sieht. Externe Aufrufe (Zugriffspruefung, Protokollierung) laufen
//! ausserhalb des Locks.
//!
//! Der Klingel-Timer und die Annahme-Karenz sind abbrechbare Tasks. Jeder
//! Uebergang aus `Ringing` bricht den Klingel-Timer ab, jeder terminale
//! Uebergang beide.
//!
//! Beendete Anrufe bleiben fuer eine Weile als Grabstein bekannt, damit
//! doppelte `call:end` idempotent beantwortet werden koennen.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use vitalink_core::{jetzt, CallId, ConnectionId, Rolle, UserId};
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::payload::{
    AnrufAblehnen, AnrufAnnehmen, AnrufBeenden, AnrufQualitaet, AnrufSignal, AnrufStarten,
};
use vitalink_protocol::{CallStatus, CallType};

use crate::ablage::Datenablage;
use crate::error::{SignalingError, SignalingResult};
use crate::fanout::Verteiler;
use crate::registry::VerbindungsInfo;
use crate::zugriff::ZugriffsRichtlinie;

/// Ab diesem Paketverlust wird die Gegenseite gewarnt
const PAKETVERLUST_SCHWELLE: u64 = 50;

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

/// Zeitgrenzen der Anruf-Engine
#[derive(Debug, Clone, Copy)]
pub struct AnrufZeiten {
    /// Klingeldauer bis `missed`
    pub klingeln: Duration,
    /// Verzoegerung von `accepted` nach `in_progress`
    pub annahme_karenz: Duration,
    /// Wie lange beendete Anrufe bekannt bleiben
    pub grabstein: Duration,
}

impl Default for AnrufZeiten {
    fn default() -> Self {
        Self {
            klingeln: Duration::from_secs(30),
            annahme_karenz: Duration::from_millis(1000),
            grabstein: Duration::from_secs(300),
        }
    }
}

/// Ein Anruf, wie er protokolliert und in der Statistik gezeigt wird
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Anruf {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub caller_role: Rolle,
    pub recipient_id: UserId,
    pub visit_id: Option<String>,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Dauer in Sekunden
    pub duration: Option<u64>,
    pub ended_by: Option<UserId>,
    pub metadata: Option<Value>,
}

impl Anruf {
    pub fn ist_teilnehmer(&self, user_id: &UserId) -> bool {
        &self.caller_id == user_id || &self.recipient_id == user_id
    }

    /// Die jeweils andere Seite des Anrufs
    pub fn gegenseite(&self, user_id: &UserId) -> &UserId {
        if &self.caller_id == user_id {
            &self.recipient_id
        } else {
            &self.caller_id
        }
    }
}

/// Ergebnis von `call:end`
#[derive(Debug, Clone, PartialEq)]
pub enum BeendenErgebnis {
    Beendet(Anruf),
    /// Der Anruf war schon abgeschlossen, nichts wurde veraendert
    BereitsBeendet(CallStatus),
}

/// Statistik der aktiven Anrufe
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnrufStatistik {
    pub total_active_calls: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub by_type: BTreeMap<&'static str, usize>,
    /// Abgeschlossene Anrufe seit Prozessstart nach Endstatus
    pub finished_by_status: BTreeMap<&'static str, u64>,
}

struct AktiverAnruf {
    anruf: Anruf,
    gestartet: Instant,
    klingel_timer: Option<AbortHandle>,
    karenz_timer: Option<AbortHandle>,
    anrufer_verbindung: ConnectionId,
    /// Verbindung, die den Anruf angenommen hat
    empfaenger_verbindung: Option<ConnectionId>,
}

struct Grabstein {
    status: CallStatus,
    zeit: Instant,
    caller_id: UserId,
    recipient_id: UserId,
}

#[derive(Default)]
struct Tabelle {
    aktiv: HashMap<CallId, AktiverAnruf>,
    beendet: HashMap<CallId, Grabstein>,
    abgeschlossen: HashMap<CallStatus, u64>,
}

impl Tabelle {
    /// Ueberfuehrt einen Anruf in einen terminalen Status
    ///
    /// Bricht alle noch gesetzten Timer ab und hinterlegt den Grabstein.
    fn abschliessen(
        &mut self,
        mut eintrag: AktiverAnruf,
        status: CallStatus,
        beendet_von: Option<&UserId>,
    ) -> Anruf {
        if let Some(timer) = eintrag.klingel_timer.take() {
            timer.abort();
        }
        if let Some(timer) = eintrag.karenz_timer.take() {
            timer.abort();
        }

        let mut anruf = eintrag.anruf;
        anruf.status = status;
        anruf.ended_at = Some(jetzt());
        anruf.ended_by = beendet_von.cloned();

        self.beendet.insert(
            anruf.call_id,
            Grabstein {
                status,
                zeit: Instant::now(),
                caller_id: anruf.caller_id.clone(),
                recipient_id: anruf.recipient_id.clone(),
            },
        );
        *self.abgeschlossen.entry(status).or_insert(0) += 1;
        anruf
    }

    /// Fehler fuer eine Aktion auf einen nicht (mehr) aktiven Anruf
    fn nicht_aktiv(&self, call_id: &CallId, user_id: &UserId) -> SignalingError {
        match self.beendet.get(call_id) {
            Some(g) if &g.caller_id == user_id || &g.recipient_id == user_id => {
                SignalingError::zustand(format!("Call already {}", g.status), g.status)
            }
            Some(_) => SignalingError::ZugriffVerweigert("Not a participant of this call".into()),
            None => SignalingError::NichtGefunden("Call not found".into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Zeitgeber {
    Klingeln,
    Karenz,
}

// ---------------------------------------------------------------------------
// AnrufEngine
// ---------------------------------------------------------------------------

/// Besitzt alle aktiven Anrufe dieses Prozesses
///
/// Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct AnrufEngine {
    inner: Arc<AnrufEngineInner>,
}

struct AnrufEngineInner {
    tabelle: Mutex<Tabelle>,
    verteiler: Verteiler,
    richtlinie: Arc<dyn ZugriffsRichtlinie>,
    ablage: Arc<dyn Datenablage>,
    zeiten: AnrufZeiten,
}

impl AnrufEngine {
    pub fn neu(
        verteiler: Verteiler,
        richtlinie: Arc<dyn ZugriffsRichtlinie>,
        ablage: Arc<dyn Datenablage>,
        zeiten: AnrufZeiten,
    ) -> Self {
        Self {
            inner: Arc::new(AnrufEngineInner {
                tabelle: Mutex::new(Tabelle::default()),
                verteiler,
                richtlinie,
                ablage,
                zeiten,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Uebergaenge
    // -----------------------------------------------------------------------

    /// Startet einen Anruf und laesst beim Empfaenger klingeln
    pub async fn starten(&self, akteur: &VerbindungsInfo, daten: AnrufStarten) -> SignalingResult<Value> {
        if daten.recipient_id == akteur.user_id {
            return Err(SignalingError::anfrage("Cannot call yourself"));
        }

        if let Some(visit_id) = &daten.visit_id {
            let erlaubt = self
                .inner
                .richtlinie
                .besuch_zugriff(&akteur.user_id, &akteur.rolle, visit_id)
                .await?;
            if !erlaubt {
                return Err(SignalingError::ZugriffVerweigert("Access denied to this visit".into()));
            }
        }

        let call_id = CallId::new();
        let mut anruf = Anruf {
            call_id,
            caller_id: akteur.user_id.clone(),
            caller_role: akteur.rolle.clone(),
            recipient_id: daten.recipient_id,
            visit_id: daten.visit_id,
            call_type: daten.call_type,
            status: CallStatus::Initiating,
            started_at: jetzt(),
            ended_at: None,
            duration: None,
            ended_by: None,
            metadata: daten.metadata,
        };

        tracing::info!(
            call_id = %call_id,
            caller_id = %anruf.caller_id,
            recipient_id = %anruf.recipient_id,
            call_type = anruf.call_type.als_str(),
            "Anruf gestartet"
        );

        let mut tabelle = self.inner.tabelle.lock();
        anruf.status = CallStatus::Ringing;
        self.inner.verteiler.an_user(
            &anruf.recipient_id,
            ausgehend::CALL_INCOMING,
            json!({
                "callId": call_id,
                "callerId": anruf.caller_id,
                "callerRole": anruf.caller_role,
                "visitId": anruf.visit_id,
                "callType": anruf.call_type,
                "timestamp": jetzt(),
                "metadata": anruf.metadata,
            }),
        );
        let klingel_timer = self.timer_starten(call_id, Zeitgeber::Klingeln);
        tabelle.aktiv.insert(
            call_id,
            AktiverAnruf {
                anruf,
                gestartet: Instant::now(),
                klingel_timer: Some(klingel_timer),
                karenz_timer: None,
                anrufer_verbindung: akteur.connection_id,
                empfaenger_verbindung: None,
            },
        );

        Ok(json!({ "callId": call_id, "status": CallStatus::Ringing }))
    }

    /// Nimmt einen klingelnden Anruf an (nur der Empfaenger)
    pub fn annehmen(&self, akteur: &VerbindungsInfo, daten: AnrufAnnehmen) -> SignalingResult<Value> {
        let call_id = daten.call_id;
        let mut tabelle = self.inner.tabelle.lock();
        let tabelle = &mut *tabelle;

        let Some(eintrag) = tabelle.aktiv.get_mut(&call_id) else {
            return Err(tabelle.nicht_aktiv(&call_id, &akteur.user_id));
        };
        pruefe_empfaenger(&eintrag.anruf, &akteur.user_id, "accept")?;
        if eintrag.anruf.status != CallStatus::Ringing {
            return Err(SignalingError::zustand(
                format!("Cannot accept call in {} state", eintrag.anruf.status),
                eintrag.anruf.status,
            ));
        }

        if let Some(timer) = eintrag.klingel_timer.take() {
            timer.abort();
        }
        eintrag.karenz_timer = Some(self.timer_starten(call_id, Zeitgeber::Karenz));
        eintrag.anruf.status = CallStatus::Accepted;
        eintrag.empfaenger_verbindung = Some(akteur.connection_id);

        self.inner.verteiler.an_user(
            &eintrag.anruf.caller_id,
            ausgehend::CALL_ACCEPTED,
            json!({ "callId": call_id, "recipientId": akteur.user_id, "timestamp": jetzt() }),
        );

        tracing::info!(call_id = %call_id, recipient_id = %akteur.user_id, "Anruf angenommen");
        Ok(json!({ "callId": call_id, "status": CallStatus::Accepted }))
    }

    /// Lehnt einen klingelnden Anruf ab (nur der Empfaenger)
    pub async fn ablehnen(&self, akteur: &VerbindungsInfo, daten: AnrufAblehnen) -> SignalingResult<Value> {
        let call_id = daten.call_id;
        let anruf = {
            let mut tabelle = self.inner.tabelle.lock();
            match tabelle.aktiv.get(&call_id) {
                None => return Err(tabelle.nicht_aktiv(&call_id, &akteur.user_id)),
                Some(eintrag) => {
                    pruefe_empfaenger(&eintrag.anruf, &akteur.user_id, "reject")?;
                    if eintrag.anruf.status != CallStatus::Ringing {
                        return Err(SignalingError::zustand(
                            format!("Cannot reject call in {} state", eintrag.anruf.status),
                            eintrag.anruf.status,
                        ));
                    }
                }
            }
            let Some(eintrag) = tabelle.aktiv.remove(&call_id) else {
                return Err(SignalingError::intern("Anruf waehrend der Ablehnung verschwunden"));
            };
            let anruf = tabelle.abschliessen(eintrag, CallStatus::Rejected, Some(&akteur.user_id));

            self.inner.verteiler.an_user(
                &anruf.caller_id,
                ausgehend::CALL_REJECTED,
                json!({
                    "callId": call_id,
                    "recipientId": akteur.user_id,
                    "reason": daten.reason,
                    "timestamp": jetzt(),
                }),
            );
            anruf
        };

        tracing::info!(call_id = %call_id, recipient_id = %akteur.user_id, "Anruf abgelehnt");
        self.protokollieren(vec![anruf]).await;
        Ok(json!({ "callId": call_id, "status": CallStatus::Rejected }))
    }

    /// Beendet einen laufenden Anruf (beide Teilnehmer)
    ///
    /// Ein bereits beendeter Anruf ergibt [`BeendenErgebnis::BereitsBeendet`].
    pub async fn beenden(&self, akteur: &VerbindungsInfo, daten: AnrufBeenden) -> SignalingResult<BeendenErgebnis> {
        let call_id = daten.call_id;
        let anruf = {
            let mut tabelle = self.inner.tabelle.lock();
            let gestartet = match tabelle.aktiv.get(&call_id) {
                None => {
                    return match tabelle.nicht_aktiv(&call_id, &akteur.user_id) {
                        SignalingError::UngueltigerZustand { status, .. } => {
                            tracing::debug!(call_id = %call_id, "Anruf bereits beendet");
                            Ok(BeendenErgebnis::BereitsBeendet(status))
                        }
                        fehler => Err(fehler),
                    };
                }
                Some(eintrag) => {
                    if !eintrag.anruf.ist_teilnehmer(&akteur.user_id) {
                        return Err(SignalingError::ZugriffVerweigert(
                            "Not a participant of this call".into(),
                        ));
                    }
                    if !matches!(eintrag.anruf.status, CallStatus::Accepted | CallStatus::InProgress) {
                        return Err(SignalingError::zustand(
                            format!("Cannot end call in {} state", eintrag.anruf.status),
                            eintrag.anruf.status,
                        ));
                    }
                    eintrag.gestartet
                }
            };

            let Some(eintrag) = tabelle.aktiv.remove(&call_id) else {
                return Err(SignalingError::intern("Anruf waehrend des Beendens verschwunden"));
            };
            let mut anruf = tabelle.abschliessen(eintrag, CallStatus::Ended, Some(&akteur.user_id));
            let dauer = daten.duration.unwrap_or_else(|| gestartet.elapsed().as_secs());
            anruf.duration = Some(dauer);

            let nutzlast = json!({
                "callId": call_id,
                "endedBy": akteur.user_id,
                "duration": dauer,
                "timestamp": jetzt(),
            });
            self.inner
                .verteiler
                .an_user(&anruf.caller_id, ausgehend::CALL_ENDED, nutzlast.clone());
            self.inner
                .verteiler
                .an_user(&anruf.recipient_id, ausgehend::CALL_ENDED, nutzlast);
            anruf
        };

        tracing::info!(
            call_id = %call_id,
            ended_by = %akteur.user_id,
            duration = anruf.duration.unwrap_or(0),
            "Anruf beendet"
        );
        self.protokollieren(vec![anruf.clone()]).await;
        Ok(BeendenErgebnis::Beendet(anruf))
    }

    /// Leitet eine SDP/ICE-Nachricht an die Gegenseite weiter
    ///
    /// Unbekannte Anrufe und fremde Absender werden nur geloggt.
    pub fn signal(&self, akteur: &VerbindungsInfo, daten: AnrufSignal) {
        let call_id = daten.call_id;
        let tabelle = self.inner.tabelle.lock();

        let Some(eintrag) = tabelle.aktiv.get(&call_id) else {
            tracing::warn!(call_id = %call_id, sender_id = %akteur.user_id, "Signal fuer unbekannten Anruf verworfen");
            return;
        };
        let anruf = &eintrag.anruf;
        if !anruf.ist_teilnehmer(&akteur.user_id) {
            tracing::warn!(call_id = %call_id, sender_id = %akteur.user_id, "Signal von Nicht-Teilnehmer verworfen");
            return;
        }

        let gegenseite = anruf.gegenseite(&akteur.user_id);
        if let Some(empfaenger) = &daten.recipient_id {
            if empfaenger != gegenseite {
                tracing::warn!(
                    call_id = %call_id,
                    recipient_id = %empfaenger,
                    "Signal an falschen Empfaenger verworfen"
                );
                return;
            }
        }

        tracing::debug!(call_id = %call_id, signal_type = ?daten.signal_type, "Signal weitergeleitet");
        self.inner.verteiler.an_user(
            gegenseite,
            ausgehend::CALL_SIGNAL,
            json!({
                "callId": call_id,
                "senderId": akteur.user_id,
                "signal": daten.signal,
                "signalType": daten.signal_type,
                "timestamp": jetzt(),
            }),
        );
    }

    /// Verarbeitet einen Qualitaetsbericht
    pub fn qualitaet(&self, akteur: &VerbindungsInfo, daten: AnrufQualitaet) {
        let call_id = daten.call_id;
        let tabelle = self.inner.tabelle.lock();

        let Some(eintrag) = tabelle
            .aktiv
            .get(&call_id)
            .filter(|e| e.anruf.ist_teilnehmer(&akteur.user_id))
        else {
            tracing::debug!(call_id = %call_id, user_id = %akteur.user_id, "Qualitaetsbericht verworfen");
            return;
        };
        if !matches!(eintrag.anruf.status, CallStatus::Accepted | CallStatus::InProgress) {
            return;
        }

        let metriken = &daten.metrics;
        tracing::debug!(
            call_id = %call_id,
            user_id = %akteur.user_id,
            packets_lost = metriken.packets_lost.unwrap_or(0),
            latency = metriken.latency.unwrap_or(0.0),
            "Qualitaetsbericht"
        );

        if metriken.packets_lost.unwrap_or(0) > PAKETVERLUST_SCHWELLE {
            tracing::warn!(call_id = %call_id, user_id = %akteur.user_id, "Hoher Paketverlust");
            self.inner.verteiler.an_user(
                eintrag.anruf.gegenseite(&akteur.user_id),
                ausgehend::CALL_QUALITY_ISSUE,
                json!({ "callId": call_id, "issue": "high_packet_loss", "metrics": metriken }),
            );
        }
    }

    /// Beendet alle Anrufe, die an einer getrennten Verbindung haengen
    ///
    /// Betroffen sind Anrufe, die ueber diese Verbindung gestartet oder
    /// angenommen wurden, sowie alle Anrufe des Benutzers, wenn er keine
    /// weitere Verbindung mehr hat.
    pub async fn verbindung_getrennt(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
        weitere_verbindungen: bool,
    ) -> Vec<CallId> {
        let beendet: Vec<Anruf> = {
            let mut tabelle = self.inner.tabelle.lock();
            let betroffen: Vec<CallId> = tabelle
                .aktiv
                .iter()
                .filter(|(_, e)| {
                    e.anrufer_verbindung == *connection_id
                        || e.empfaenger_verbindung == Some(*connection_id)
                        || (!weitere_verbindungen && e.anruf.ist_teilnehmer(user_id))
                })
                .map(|(id, _)| *id)
                .collect();

            let mut beendet = Vec::with_capacity(betroffen.len());
            for call_id in betroffen {
                let Some(eintrag) = tabelle.aktiv.remove(&call_id) else {
                    continue;
                };
                let gestartet = eintrag.gestartet;
                let mut anruf = tabelle.abschliessen(eintrag, CallStatus::Ended, Some(user_id));
                let dauer = gestartet.elapsed().as_secs();
                anruf.duration = Some(dauer);

                let nutzlast = json!({
                    "callId": call_id,
                    "endedBy": user_id,
                    "reason": "disconnect",
                    "duration": dauer,
                    "timestamp": jetzt(),
                });
                self.inner
                    .verteiler
                    .an_user(&anruf.caller_id, ausgehend::CALL_ENDED, nutzlast.clone());
                self.inner
                    .verteiler
                    .an_user(&anruf.recipient_id, ausgehend::CALL_ENDED, nutzlast);

                tracing::info!(call_id = %call_id, user_id = %user_id, "Anruf wegen Verbindungsabbruch beendet");
                beendet.push(anruf);
            }
            beendet
        };

        let ids = beendet.iter().map(|a| a.call_id).collect();
        self.protokollieren(beendet).await;
        ids
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    fn timer_starten(&self, call_id: CallId, art: Zeitgeber) -> AbortHandle {
        let dauer = match art {
            Zeitgeber::Klingeln => self.inner.zeiten.klingeln,
            Zeitgeber::Karenz => self.inner.zeiten.annahme_karenz,
        };
        let schwach: Weak<AnrufEngineInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(dauer).await;
            let Some(inner) = schwach.upgrade() else {
                return;
            };
            let engine = AnrufEngine { inner };
            match art {
                Zeitgeber::Klingeln => engine.klingel_abgelaufen(call_id).await,
                Zeitgeber::Karenz => engine.karenz_abgelaufen(call_id),
            }
        })
        .abort_handle()
    }

    async fn klingel_abgelaufen(&self, call_id: CallId) {
        let anruf = {
            let mut tabelle = self.inner.tabelle.lock();
            let klingelt = tabelle
                .aktiv
                .get(&call_id)
                .map(|e| e.anruf.status == CallStatus::Ringing)
                .unwrap_or(false);
            if !klingelt {
                return;
            }
            let Some(mut eintrag) = tabelle.aktiv.remove(&call_id) else {
                return;
            };
            // Eigener Task, nicht abbrechen
            eintrag.klingel_timer = None;
            let anruf = tabelle.abschliessen(eintrag, CallStatus::Missed, None);

            self.inner.verteiler.an_user(
                &anruf.caller_id,
                ausgehend::CALL_MISSED,
                json!({ "callId": call_id, "recipientId": anruf.recipient_id, "timestamp": jetzt() }),
            );
            self.inner.verteiler.an_user(
                &anruf.recipient_id,
                ausgehend::CALL_MISSED,
                json!({ "callId": call_id, "callerId": anruf.caller_id, "timestamp": jetzt() }),
            );
            anruf
        };

        tracing::info!(call_id = %call_id, "Anruf verpasst");
        self.protokollieren(vec![anruf]).await;
    }

    fn karenz_abgelaufen(&self, call_id: CallId) {
        let mut tabelle = self.inner.tabelle.lock();
        if let Some(eintrag) = tabelle.aktiv.get_mut(&call_id) {
            eintrag.karenz_timer = None;
            if eintrag.anruf.status == CallStatus::Accepted {
                eintrag.anruf.status = CallStatus::InProgress;
                tracing::debug!(call_id = %call_id, "Anruf laeuft");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Protokoll, Abfragen, Wartung
    // -----------------------------------------------------------------------

    /// Speichert abgeschlossene Anrufe mit Besuchsbezug
    async fn protokollieren(&self, anrufe: Vec<Anruf>) {
        for anruf in anrufe.into_iter().filter(|a| a.visit_id.is_some()) {
            let call_id = anruf.call_id;
            if let Err(e) = self.inner.ablage.anruf_speichern(anruf).await {
                tracing::error!(call_id = %call_id, fehler = %e, "Anrufprotokoll nicht gespeichert");
            }
        }
    }

    /// Momentaufnahme eines aktiven Anrufs
    pub fn abfragen(&self, call_id: &CallId) -> Option<Anruf> {
        self.inner
            .tabelle
            .lock()
            .aktiv
            .get(call_id)
            .map(|e| e.anruf.clone())
    }

    pub fn aktive_anzahl(&self) -> usize {
        self.inner.tabelle.lock().aktiv.len()
    }

    /// Entfernt Grabsteine, die aelter als die Aufbewahrungszeit sind
    pub fn grabsteine_aufraeumen(&self) -> usize {
        let grenze = self.inner.zeiten.grabstein;
        let mut tabelle = self.inner.tabelle.lock();
        let vorher = tabelle.beendet.len();
        tabelle.beendet.retain(|_, g| g.zeit.elapsed() <= grenze);
        vorher - tabelle.beendet.len()
    }

    /// Statistik fuer die Admin-Schnittstelle
    pub fn statistik(&self) -> AnrufStatistik {
        let tabelle = self.inner.tabelle.lock();
        let mut by_status = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        for eintrag in tabelle.aktiv.values() {
            *by_status.entry(eintrag.anruf.status.als_str()).or_insert(0) += 1;
            *by_type.entry(eintrag.anruf.call_type.als_str()).or_insert(0) += 1;
        }

        AnrufStatistik {
            total_active_calls: tabelle.aktiv.len(),
            by_status,
            by_type,
            finished_by_status: tabelle
                .abgeschlossen
                .iter()
                .map(|(status, anzahl)| (status.als_str(), *anzahl))
                .collect(),
        }
    }
}

/// Nur der Empfaenger darf annehmen oder ablehnen
fn pruefe_empfaenger(anruf: &Anruf, user_id: &UserId, aktion: &str) -> SignalingResult<()> {
    if !anruf.ist_teilnehmer(user_id) {
        return Err(SignalingError::ZugriffVerweigert("Not a participant of this call".into()));
    }
    if &anruf.recipient_id != user_id {
        return Err(SignalingError::ZugriffVerweigert(format!(
            "Only the recipient can {aktion} the call"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vitalink_auth::Identitaet;
    use vitalink_protocol::payload::QualitaetsMetriken;
    use vitalink_protocol::{ServerEvent, SignalType};

    use crate::ablage::SpeicherAblage;
    use crate::presence::PresenceTracker;
    use crate::registry::{Registry, Transport, VerbindungsHandle};
    use crate::rooms::RaumManager;
    use crate::zugriff::{Besuch, RollenZugriff};

    struct Umgebung {
        registry: Registry,
        engine: AnrufEngine,
        ablage: SpeicherAblage,
        richtlinie: RollenZugriff,
    }

    fn umgebung() -> Umgebung {
        let registry = Registry::neu();
        let verteiler = Verteiler::neu("test", registry.clone(), RaumManager::neu(), PresenceTracker::neu());
        let ablage = SpeicherAblage::neu();
        let richtlinie = RollenZugriff::neu(vec!["admin".into()]);
        let engine = AnrufEngine::neu(
            verteiler,
            Arc::new(richtlinie.clone()),
            Arc::new(ablage.clone()),
            AnrufZeiten::default(),
        );
        Umgebung {
            registry,
            engine,
            ablage,
            richtlinie,
        }
    }

    impl Umgebung {
        fn verbinden(&self, user: &str) -> (VerbindungsInfo, VerbindungsHandle) {
            let identitaet = Identitaet {
                user_id: UserId::neu(user),
                rolle: Rolle::neu("patient"),
                email: None,
            };
            let handle = self
                .registry
                .registrieren(ConnectionId::new(), &identitaet, Transport::WebSocket)
                .unwrap();
            let info = self.registry.info(&handle.connection_id).unwrap();
            (info, handle)
        }
    }

    fn events(handle: &mut VerbindungsHandle) -> Vec<ServerEvent> {
        let mut liste = Vec::new();
        while let Ok(e) = handle.rx.try_recv() {
            liste.push(e);
        }
        liste
    }

    fn namen(liste: &[ServerEvent]) -> Vec<&str> {
        liste.iter().map(|e| e.event.as_str()).collect()
    }

    fn starten_daten(empfaenger: &str, visit: Option<&str>) -> AnrufStarten {
        AnrufStarten {
            recipient_id: UserId::neu(empfaenger),
            call_type: CallType::Video,
            visit_id: visit.map(str::to_string),
            metadata: None,
        }
    }

    async fn klingelnder_anruf(
        u: &Umgebung,
        anrufer: &VerbindungsInfo,
        empfaenger: &str,
    ) -> CallId {
        let ack = u.engine.starten(anrufer, starten_daten(empfaenger, None)).await.unwrap();
        serde_json::from_value(ack["callId"].clone()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn anruf_von_start_bis_ende() {
        let u = umgebung();
        let (a, mut ha) = u.verbinden("u1");
        let (b, mut hb) = u.verbinden("u2");

        let ack = u.engine.starten(&a, starten_daten("u2", None)).await.unwrap();
        assert_eq!(ack["status"], "ringing");
        let call_id: CallId = serde_json::from_value(ack["callId"].clone()).unwrap();

        let eingehend = events(&mut hb);
        assert_eq!(namen(&eingehend), vec!["call:incoming"]);
        assert_eq!(eingehend[0].data["callId"], ack["callId"]);
        assert_eq!(eingehend[0].data["callerId"], "u1");

        let ack = u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap();
        assert_eq!(ack["status"], "accepted");
        assert_eq!(namen(&events(&mut ha)), vec!["call:accepted"]);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(u.engine.abfragen(&call_id).unwrap().status, CallStatus::InProgress);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let ergebnis = u
            .engine
            .beenden(&a, AnrufBeenden { call_id, duration: None })
            .await
            .unwrap();
        match ergebnis {
            BeendenErgebnis::Beendet(anruf) => {
                assert_eq!(anruf.status, CallStatus::Ended);
                assert_eq!(anruf.duration, Some(6));
            }
            anderes => panic!("Erwartet Beendet, erhalten {anderes:?}"),
        }

        for handle in [&mut ha, &mut hb] {
            let liste = events(handle);
            assert_eq!(namen(&liste), vec!["call:ended"]);
            assert!(liste[0].data["duration"].as_u64().is_some());
            assert_eq!(liste[0].data["endedBy"], "u1");
        }
        assert!(u.engine.abfragen(&call_id).is_none());
        assert_eq!(u.engine.aktive_anzahl(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbeantworteter_anruf_wird_verpasst() {
        let u = umgebung();
        let (a, mut ha) = u.verbinden("u1");
        let (b, mut hb) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;
        events(&mut hb);

        tokio::time::sleep(Duration::from_secs(31)).await;

        let beim_anrufer = events(&mut ha);
        assert_eq!(namen(&beim_anrufer), vec!["call:missed"]);
        assert_eq!(beim_anrufer[0].data["recipientId"], "u2");
        let beim_empfaenger = events(&mut hb);
        assert_eq!(namen(&beim_empfaenger), vec!["call:missed"]);
        assert_eq!(beim_empfaenger[0].data["callerId"], "u1");

        let fehler = u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap_err();
        match fehler {
            SignalingError::UngueltigerZustand { status, .. } => assert_eq!(status, CallStatus::Missed),
            anderes => panic!("Erwartet UngueltigerZustand, erhalten {anderes:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn annahme_bricht_klingel_timer_ab() {
        let u = umgebung();
        let (a, mut ha) = u.verbinden("u1");
        let (b, mut hb) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;
        u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap();
        events(&mut ha);
        events(&mut hb);

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(events(&mut ha).is_empty());
        assert!(events(&mut hb).is_empty());
        assert_eq!(u.engine.abfragen(&call_id).unwrap().status, CallStatus::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn fremde_duerfen_nichts() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let (c, _hc) = u.verbinden("u3");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;

        let fehler = u.engine.annehmen(&c, AnrufAnnehmen { call_id }).unwrap_err();
        assert!(matches!(fehler, SignalingError::ZugriffVerweigert(_)));
        let fehler = u
            .engine
            .ablehnen(&c, AnrufAblehnen { call_id, reason: None })
            .await
            .unwrap_err();
        assert!(matches!(fehler, SignalingError::ZugriffVerweigert(_)));
        let fehler = u
            .engine
            .beenden(&c, AnrufBeenden { call_id, duration: None })
            .await
            .unwrap_err();
        assert!(matches!(fehler, SignalingError::ZugriffVerweigert(_)));

        // Auch der Anrufer darf nicht annehmen
        let fehler = u.engine.annehmen(&a, AnrufAnnehmen { call_id }).unwrap_err();
        assert!(matches!(fehler, SignalingError::ZugriffVerweigert(_)));

        assert_eq!(u.engine.abfragen(&call_id).unwrap().status, CallStatus::Ringing);
    }

    #[tokio::test(start_paused = true)]
    async fn doppeltes_beenden_ist_idempotent() {
        let u = umgebung();
        let (a, mut ha) = u.verbinden("u1");
        let (b, mut hb) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;
        u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap();
        events(&mut ha);
        events(&mut hb);

        let erstes = u.engine.beenden(&b, AnrufBeenden { call_id, duration: Some(42) }).await.unwrap();
        assert!(matches!(erstes, BeendenErgebnis::Beendet(ref anruf) if anruf.duration == Some(42)));
        let zweites = u.engine.beenden(&a, AnrufBeenden { call_id, duration: None }).await.unwrap();
        assert_eq!(zweites, BeendenErgebnis::BereitsBeendet(CallStatus::Ended));

        assert_eq!(namen(&events(&mut ha)), vec!["call:ended"]);
        assert_eq!(namen(&events(&mut hb)), vec!["call:ended"]);
    }

    #[tokio::test(start_paused = true)]
    async fn beenden_waehrend_klingeln_ist_ungueltig() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;

        let fehler = u
            .engine
            .beenden(&a, AnrufBeenden { call_id, duration: None })
            .await
            .unwrap_err();
        let ack = fehler.als_ack();
        assert_eq!(ack["code"], "INVALID_STATE");
        assert_eq!(ack["status"], "ringing");
    }

    #[tokio::test(start_paused = true)]
    async fn unbekannter_anruf() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let fehler = u
            .engine
            .annehmen(&a, AnrufAnnehmen { call_id: CallId::new() })
            .unwrap_err();
        assert!(matches!(fehler, SignalingError::NichtGefunden(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn ablehnen_benachrichtigt_anrufer() {
        let u = umgebung();
        let (a, mut ha) = u.verbinden("u1");
        let (b, _hb) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;

        let ack = u
            .engine
            .ablehnen(&b, AnrufAblehnen { call_id, reason: Some("busy".into()) })
            .await
            .unwrap();
        assert_eq!(ack["status"], "rejected");

        let liste = events(&mut ha);
        assert_eq!(namen(&liste), vec!["call:rejected"]);
        assert_eq!(liste[0].data["reason"], "busy");

        // Klingel-Timer darf danach nicht mehr feuern
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events(&mut ha).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn verbindungsabbruch_beendet_anruf() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let (b, mut hb) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;
        u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap();
        events(&mut hb);

        u.registry.entfernen(&a.connection_id);
        let beendet = u
            .engine
            .verbindung_getrennt(&a.connection_id, &a.user_id, false)
            .await;
        assert_eq!(beendet, vec![call_id]);

        let liste = events(&mut hb);
        assert_eq!(namen(&liste), vec!["call:ended"]);
        assert_eq!(liste[0].data["reason"], "disconnect");
        assert!(u.engine.abfragen(&call_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zweites_geraet_haelt_klingelnden_anruf() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let (b1, _hb1) = u.verbinden("u2");
        let (_b2, _hb2) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;

        let beendet = u
            .engine
            .verbindung_getrennt(&b1.connection_id, &b1.user_id, true)
            .await;
        assert!(beendet.is_empty());
        assert_eq!(u.engine.abfragen(&call_id).unwrap().status, CallStatus::Ringing);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_nur_an_gegenseite() {
        let u = umgebung();
        let (a, mut ha) = u.verbinden("u1");
        let (_b, mut hb) = u.verbinden("u2");
        let (c, _hc) = u.verbinden("u3");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;
        events(&mut hb);

        let signal = |recipient: Option<&str>| AnrufSignal {
            call_id,
            recipient_id: recipient.map(UserId::neu),
            signal: json!({ "sdp": "v=0" }),
            signal_type: SignalType::Offer,
        };

        u.engine.signal(&a, signal(Some("u2")));
        let liste = events(&mut hb);
        assert_eq!(namen(&liste), vec!["call:signal"]);
        assert_eq!(liste[0].data["senderId"], "u1");
        assert_eq!(liste[0].data["signalType"], "offer");

        // Fremder Absender, falscher Empfaenger, unbekannter Anruf
        u.engine.signal(&c, signal(Some("u2")));
        u.engine.signal(&a, signal(Some("u3")));
        u.engine.signal(
            &a,
            AnrufSignal {
                call_id: CallId::new(),
                ..signal(None)
            },
        );
        assert!(events(&mut hb).is_empty());
        assert!(events(&mut ha).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hoher_paketverlust_warnt_gegenseite() {
        let u = umgebung();
        let (a, mut ha) = u.verbinden("u1");
        let (b, mut hb) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;
        u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap();
        events(&mut ha);
        events(&mut hb);

        let bericht = |verlust| AnrufQualitaet {
            call_id,
            metrics: QualitaetsMetriken {
                packets_lost: Some(verlust),
                ..Default::default()
            },
        };
        u.engine.qualitaet(&b, bericht(10));
        assert!(events(&mut ha).is_empty());

        u.engine.qualitaet(&b, bericht(51));
        let liste = events(&mut ha);
        assert_eq!(namen(&liste), vec!["call:qualityIssue"]);
        assert_eq!(liste[0].data["issue"], "high_packet_loss");
        assert_eq!(liste[0].data["metrics"]["packetsLost"], 51);
        assert!(events(&mut hb).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn besuchszugriff_und_protokoll() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let (b, _hb) = u.verbinden("u2");

        let fehler = u.engine.starten(&a, starten_daten("u2", Some("v1"))).await.unwrap_err();
        assert!(matches!(fehler, SignalingError::ZugriffVerweigert(_)));

        u.richtlinie.besuch_registrieren(
            "v1",
            Besuch {
                patient: UserId::neu("u1"),
                behandler: UserId::neu("u2"),
            },
        );
        let ack = u.engine.starten(&a, starten_daten("u2", Some("v1"))).await.unwrap();
        let call_id: CallId = serde_json::from_value(ack["callId"].clone()).unwrap();
        u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap();
        u.engine.beenden(&b, AnrufBeenden { call_id, duration: None }).await.unwrap();

        let protokoll = u.ablage.anrufe();
        assert_eq!(protokoll.len(), 1);
        assert_eq!(protokoll[0].status, CallStatus::Ended);
        assert_eq!(protokoll[0].visit_id.as_deref(), Some("v1"));
        assert_eq!(protokoll[0].ended_by, Some(UserId::neu("u2")));
    }

    #[tokio::test(start_paused = true)]
    async fn sich_selbst_anrufen_ist_ungueltig() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let fehler = u.engine.starten(&a, starten_daten("u1", None)).await.unwrap_err();
        assert!(matches!(fehler, SignalingError::UngueltigeAnfrage(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn grabsteine_verfallen() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let (b, _hb) = u.verbinden("u2");
        let call_id = klingelnder_anruf(&u, &a, "u2").await;
        u.engine
            .ablehnen(&b, AnrufAblehnen { call_id, reason: None })
            .await
            .unwrap();

        assert_eq!(u.engine.grabsteine_aufraeumen(), 0);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(u.engine.grabsteine_aufraeumen(), 1);

        let fehler = u.engine.annehmen(&b, AnrufAnnehmen { call_id }).unwrap_err();
        assert!(matches!(fehler, SignalingError::NichtGefunden(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn statistik_nach_status_und_typ() {
        let u = umgebung();
        let (a, _ha) = u.verbinden("u1");
        let (b, _hb) = u.verbinden("u2");
        let erster = klingelnder_anruf(&u, &a, "u2").await;
        klingelnder_anruf(&u, &a, "u3").await;
        u.engine.annehmen(&b, AnrufAnnehmen { call_id: erster }).unwrap();

        let statistik = u.engine.statistik();
        assert_eq!(statistik.total_active_calls, 2);
        assert_eq!(statistik.by_status.get("ringing"), Some(&1));
        assert_eq!(statistik.by_status.get("accepted"), Some(&1));
        assert_eq!(statistik.by_type.get("video"), Some(&2));
    }
}
