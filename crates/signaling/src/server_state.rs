//! Gemeinsamer Server-Zustand fuer den Signaling-Service
//!
//! Haelt alle geteilten Komponenten und fuehrt die Lebenszyklus-Kaskaden
//! aus: Verbindungsaufbau, Trennung, Leerlauf-Pruefung und Shutdown.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vitalink_auth::{Identitaet, JwtPruefer};
use vitalink_core::{jetzt, ConnectionId, UserId};
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::ServerEvent;

use crate::ablage::Datenablage;
use crate::benachrichtigung::BenachrichtigungsDienst;
use crate::calls::{AnrufEngine, AnrufZeiten};
use crate::error::{SignalingError, SignalingResult};
use crate::fanout::Verteiler;
use crate::presence::{PresenceInfo, PresenceTracker};
use crate::registry::{Registry, Transport, VerbindungsHandle};
use crate::relay::NachrichtenRelay;
use crate::rooms::RaumManager;
use crate::zugriff::ZugriffsRichtlinie;

/// Konfiguration fuer den Signaling-Service
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// ID dieses Prozesses im Cluster
    pub node_id: String,
    /// Verbindungen ohne Aktivitaet werden danach getrennt
    pub leerlauf: Duration,
    /// Periode der Leerlauf-Pruefung
    pub pruef_intervall: Duration,
    pub anruf_zeiten: AnrufZeiten,
    /// Zeit zwischen `server:shutdown` und dem Schliessen der Verbindungen
    pub shutdown_karenz: Duration,
    /// WebSocket-Ping-Intervall
    pub ping_intervall: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            leerlauf: Duration::from_secs(300),
            pruef_intervall: Duration::from_secs(30),
            anruf_zeiten: AnrufZeiten::default(),
            shutdown_karenz: Duration::from_millis(1000),
            ping_intervall: Duration::from_secs(25),
        }
    }
}

/// Gemeinsamer Server-Zustand (thread-safe, Arc-geteilt)
pub struct SignalingState {
    pub config: Arc<SignalingConfig>,
    /// Auth-Gate fuer den Handshake
    pub jwt: JwtPruefer,
    pub registry: Registry,
    pub presence: PresenceTracker,
    pub raeume: RaumManager,
    pub verteiler: Verteiler,
    pub anrufe: AnrufEngine,
    pub relay: NachrichtenRelay,
    pub benachrichtigungen: BenachrichtigungsDienst,
    /// Zugriffsrichtlinie fuer Besuche und Raeume
    pub richtlinie: Arc<dyn ZugriffsRichtlinie>,
    shutdown_tx: watch::Sender<bool>,
    /// Startzeitpunkt des Servers (fuer Uptime-Berechnung)
    pub start_time: Instant,
}

impl SignalingState {
    /// Erstellt einen neuen SignalingState
    pub fn neu(
        config: SignalingConfig,
        jwt: JwtPruefer,
        richtlinie: Arc<dyn ZugriffsRichtlinie>,
        ablage: Arc<dyn Datenablage>,
    ) -> Arc<Self> {
        let registry = Registry::neu();
        let presence = PresenceTracker::neu();
        let raeume = RaumManager::neu();
        let verteiler = Verteiler::neu(
            config.node_id.clone(),
            registry.clone(),
            raeume.clone(),
            presence.clone(),
        );
        let anrufe = AnrufEngine::neu(
            verteiler.clone(),
            richtlinie.clone(),
            ablage.clone(),
            config.anruf_zeiten,
        );
        let relay = NachrichtenRelay::neu(verteiler.clone(), richtlinie.clone(), ablage.clone());
        let benachrichtigungen = BenachrichtigungsDienst::neu(verteiler.clone(), raeume.clone(), ablage);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config: Arc::new(config),
            jwt,
            registry,
            presence,
            raeume,
            verteiler,
            anrufe,
            relay,
            benachrichtigungen,
            richtlinie,
            shutdown_tx,
            start_time: Instant::now(),
        })
    }

    /// Gibt die Uptime in Sekunden zurueck
    pub fn uptime_sek(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    // -----------------------------------------------------------------------
    // Lebenszyklus einer Verbindung
    // -----------------------------------------------------------------------

    /// Registriert eine authentifizierte Verbindung
    ///
    /// Sendet `connected` an die neue Verbindung und meldet den Benutzer
    /// bei seinen Abonnenten als online, falls es seine erste Verbindung ist.
    pub fn verbindung_oeffnen(&self, identitaet: &Identitaet) -> SignalingResult<VerbindungsHandle> {
        if self.ist_heruntergefahren() {
            return Err(SignalingError::intern("Server wird heruntergefahren"));
        }

        let connection_id = ConnectionId::new();
        let handle = self
            .registry
            .registrieren(connection_id, identitaet, Transport::WebSocket)
            .ok_or_else(|| SignalingError::intern("Verbindungs-ID bereits vergeben"))?;

        self.verteiler.an_verbindung(
            &connection_id,
            ausgehend::CONNECTED,
            json!({
                "socketId": connection_id,
                "userId": identitaet.user_id,
                "timestamp": jetzt(),
            }),
        );

        if let Some(info) = self.presence.online_setzen(&identitaet.user_id, connection_id) {
            self.presence_melden(info);
        }

        tracing::info!(
            connection_id = %connection_id,
            user_id = %identitaet.user_id,
            rolle = %identitaet.rolle,
            "Verbindung geoeffnet"
        );
        Ok(handle)
    }

    /// Raeumt eine Verbindung vollstaendig ab
    ///
    /// Reihenfolge: Registry, Presence, Raeume, Anrufe. Ein zweiter Aufruf
    /// fuer dieselbe Verbindung ist wirkungslos.
    pub async fn verbindung_trennen(&self, connection_id: &ConnectionId, grund: &str) {
        let Some(info) = self.registry.entfernen(connection_id) else {
            return;
        };
        let user_id = &info.user_id;

        self.presence.abos_entfernen(connection_id);
        if let Some(presence) = self.presence.offline_setzen(user_id, connection_id) {
            self.presence_melden(presence);
        }

        for (raum_id, teilnehmer) in self.raeume.verbindung_bereinigen(connection_id) {
            self.verteiler.an_raum(
                &raum_id,
                ausgehend::ROOM_USER_LEFT,
                json!({
                    "roomId": raum_id,
                    "userId": teilnehmer.user_id,
                    "userRole": teilnehmer.user_role,
                    "timestamp": jetzt(),
                }),
                None,
            );
        }

        let weitere = self.registry.hat_verbindungen(user_id);
        let beendet = self
            .anrufe
            .verbindung_getrennt(connection_id, user_id, weitere)
            .await;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %user_id,
            grund = %grund,
            beendete_anrufe = beendet.len(),
            dauer_sek = (jetzt() - info.verbunden_seit).num_seconds(),
            "Verbindung getrennt"
        );
    }

    /// Trennt alle Verbindungen eines Benutzers im Cluster
    pub fn benutzer_trennen(&self, user_id: &UserId, grund: &str) -> usize {
        let lokal = self.verteiler.benutzer_trennen(user_id, grund);
        tracing::info!(user_id = %user_id, grund = %grund, lokal, "Benutzer getrennt");
        lokal
    }

    /// Verteilt eine Presence-Aenderung an die Abonnenten des Benutzers
    pub fn presence_melden(&self, info: PresenceInfo) {
        let user_id = info.user_id.clone();
        match serde_json::to_value(info) {
            Ok(daten) => self
                .verteiler
                .an_abonnenten(&user_id, ausgehend::PRESENCE_CHANGED, daten),
            Err(e) => tracing::error!(user_id = %user_id, fehler = %e, "Presence nicht serialisierbar"),
        }
    }

    // -----------------------------------------------------------------------
    // Hintergrund und Shutdown
    // -----------------------------------------------------------------------

    /// Startet die periodische Leerlauf-Pruefung und das Grabstein-Aufraeumen
    pub fn hintergrund_starten(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_empfaenger();
        tokio::spawn(async move {
            let mut intervall = tokio::time::interval(state.config.pruef_intervall);
            intervall.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            intervall.tick().await;

            loop {
                tokio::select! {
                    _ = intervall.tick() => {
                        state.leerlauf_pruefen();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Hintergrund-Pruefung beendet");
        })
    }

    /// Bricht alle Verbindungen ab, die das Leerlauf-Limit ueberschritten haben
    ///
    /// Die Sitzungsschleifen fuehren danach selbst das Cleanup aus.
    pub fn leerlauf_pruefen(&self) -> usize {
        let veraltet = self.registry.veraltete(self.config.leerlauf);
        for id in &veraltet {
            tracing::info!(connection_id = %id, "Verbindung im Leerlauf getrennt");
            self.registry.abbrechen(id);
        }

        let grabsteine = self.anrufe.grabsteine_aufraeumen();
        if grabsteine > 0 {
            tracing::debug!(anzahl = grabsteine, "Grabsteine entfernt");
        }

        let vergessen = self.presence.offline_bereinigen(self.config.anruf_zeiten.grabstein);
        if vergessen > 0 {
            tracing::debug!(anzahl = vergessen, "Offline-Benutzer vergessen");
        }
        veraltet.len()
    }

    /// Kuendigt den Shutdown an und schliesst nach der Karenzzeit alle Sitzungen
    pub async fn herunterfahren(&self) {
        if self.ist_heruntergefahren() {
            return;
        }
        let angekuendigt = self.registry.an_alle(&ServerEvent::neu(
            ausgehend::SERVER_SHUTDOWN,
            json!({
                "message": "Server is shutting down",
                "timestamp": jetzt(),
            }),
        ));
        tracing::info!(verbindungen = angekuendigt, "Shutdown angekuendigt");

        tokio::time::sleep(self.config.shutdown_karenz).await;
        self.shutdown_tx.send_replace(true);
    }

    pub fn ist_heruntergefahren(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Empfaenger, der beim Shutdown auf `true` wechselt
    pub fn shutdown_empfaenger(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Wartet, bis der Shutdown ausgeloest wurde
    pub async fn auf_shutdown_warten(&self) {
        let mut rx = self.shutdown_empfaenger();
        let _ = rx.wait_for(|aus| *aus).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vitalink_core::Rolle;
    use vitalink_protocol::payload::AnrufStarten;
    use vitalink_protocol::{CallType, RoomType};

    use crate::ablage::SpeicherAblage;
    use crate::zugriff::RollenZugriff;

    fn state() -> Arc<SignalingState> {
        SignalingState::neu(
            SignalingConfig::default(),
            JwtPruefer::neu("geheim"),
            Arc::new(RollenZugriff::neu(vec!["admin".into()])),
            Arc::new(SpeicherAblage::neu()),
        )
    }

    fn identitaet(user: &str) -> Identitaet {
        Identitaet {
            user_id: UserId::neu(user),
            rolle: Rolle::neu("patient"),
            email: None,
        }
    }

    fn events(handle: &mut VerbindungsHandle) -> Vec<ServerEvent> {
        let mut liste = Vec::new();
        while let Ok(e) = handle.rx.try_recv() {
            liste.push(e);
        }
        liste
    }

    #[tokio::test]
    async fn oeffnen_sendet_connected() {
        let s = state();
        let mut handle = s.verbindung_oeffnen(&identitaet("u1")).unwrap();
        let liste = events(&mut handle);
        assert_eq!(liste[0].event, "connected");
        assert_eq!(liste[0].data["userId"], "u1");
        assert!(s.presence.ist_online(&UserId::neu("u1")));
    }

    #[tokio::test]
    async fn trennen_kaskadiert() {
        let s = state();
        let mut beobachter = s.verbindung_oeffnen(&identitaet("u2")).unwrap();
        let beobachter_id = beobachter.connection_id;
        s.presence.abonnieren(beobachter_id, &[UserId::neu("u1")]);

        let patient = s.verbindung_oeffnen(&identitaet("u1")).unwrap();
        let info = s.registry.info(&patient.connection_id).unwrap();
        let raum = vitalink_core::RoomId::neu("r1");
        s.raeume.beitreten(&raum, RoomType::Chat, info.connection_id, &info.user_id, &info.rolle, None);
        s.raeume.beitreten(
            &raum,
            RoomType::Chat,
            beobachter_id,
            &UserId::neu("u2"),
            &Rolle::neu("patient"),
            None,
        );
        s.anrufe
            .starten(
                &info,
                AnrufStarten {
                    recipient_id: UserId::neu("u2"),
                    call_type: CallType::Audio,
                    visit_id: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        events(&mut beobachter);

        s.verbindung_trennen(&patient.connection_id, "test").await;

        let namen: Vec<String> = events(&mut beobachter).into_iter().map(|e| e.event).collect();
        assert!(namen.contains(&"presence:changed".to_string()));
        assert!(namen.contains(&"room:userLeft".to_string()));
        assert!(namen.contains(&"call:ended".to_string()));
        assert!(!s.presence.ist_online(&UserId::neu("u1")));
        assert_eq!(s.anrufe.aktive_anzahl(), 0);
        assert!(patient.abbruch.is_cancelled());

        // Zweiter Aufruf ist wirkungslos
        s.verbindung_trennen(&patient.connection_id, "test").await;
        assert!(events(&mut beobachter).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leerlauf_bricht_verbindung_ab() {
        let s = state();
        let handle = s.verbindung_oeffnen(&identitaet("u1")).unwrap();
        let aktiv = s.verbindung_oeffnen(&identitaet("u2")).unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        s.registry.beruehren(&aktiv.connection_id);
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(s.leerlauf_pruefen(), 1);
        assert!(handle.abbruch.is_cancelled());
        assert!(!aktiv.abbruch.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn hintergrund_pruefung_trennt_und_endet() {
        let s = state();
        let handle = s.verbindung_oeffnen(&identitaet("u1")).unwrap();
        let hintergrund = s.hintergrund_starten();

        tokio::time::sleep(s.config.leerlauf + s.config.pruef_intervall + Duration::from_secs(1)).await;
        assert!(handle.abbruch.is_cancelled());

        s.herunterfahren().await;
        tokio::time::timeout(Duration::from_secs(5), hintergrund)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn leerlauf_pruefung_vergisst_alte_offline_benutzer() {
        let s = state();
        let handle = s.verbindung_oeffnen(&identitaet("u1")).unwrap();
        let _aktiv = s.verbindung_oeffnen(&identitaet("u2")).unwrap();
        s.verbindung_trennen(&handle.connection_id, "test").await;
        assert_eq!(s.presence.eintraege_anzahl(), 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        s.leerlauf_pruefen();
        assert_eq!(s.presence.eintraege_anzahl(), 2);

        tokio::time::advance(s.config.anruf_zeiten.grabstein).await;
        s.leerlauf_pruefen();
        assert_eq!(s.presence.eintraege_anzahl(), 1);
        assert!(s.presence.ist_online(&UserId::neu("u2")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_kuendigt_an_und_setzt_signal() {
        let s = state();
        let mut handle = s.verbindung_oeffnen(&identitaet("u1")).unwrap();
        events(&mut handle);

        s.herunterfahren().await;
        assert_eq!(events(&mut handle)[0].event, "server:shutdown");
        assert!(s.ist_heruntergefahren());
        s.auf_shutdown_warten().await;
        assert!(s.verbindung_oeffnen(&identitaet("u2")).is_err());
    }
}
