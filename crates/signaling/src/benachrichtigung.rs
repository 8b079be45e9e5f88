//! Benachrichtigungen – Zustellung an Benutzer und Themen
//!
//! Benachrichtigungen werden ueber die [`Datenablage`] gespeichert und
//! an alle Verbindungen des Empfaengers verteilt. Themen sind Raeume
//! `topic:{name}`, denen eine Verbindung beitreten kann.

use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use vitalink_core::{jetzt, UserId};
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::payload::{BenachrichtigungLesen, Themen};
use vitalink_protocol::{Prioritaet, RoomType};

use crate::ablage::{Benachrichtigung, Datenablage};
use crate::error::{SignalingError, SignalingResult};
use crate::fanout::Verteiler;
use crate::registry::VerbindungsInfo;
use crate::rooms::{themen_raum_id, RaumManager};

/// Inhalt einer neuen Benachrichtigung
#[derive(Debug, Clone)]
pub struct NeueBenachrichtigung {
    pub typ: String,
    pub prioritaet: Prioritaet,
    pub titel: String,
    pub text: String,
    pub daten: Option<Value>,
}

impl NeueBenachrichtigung {
    pub fn neu(typ: impl Into<String>, titel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            prioritaet: Prioritaet::default(),
            titel: titel.into(),
            text: text.into(),
            daten: None,
        }
    }

    pub fn mit_prioritaet(mut self, prioritaet: Prioritaet) -> Self {
        self.prioritaet = prioritaet;
        self
    }

    pub fn mit_daten(mut self, daten: Value) -> Self {
        self.daten = Some(daten);
        self
    }
}

/// Dienst fuer Benachrichtigungen
#[derive(Clone)]
pub struct BenachrichtigungsDienst {
    verteiler: Verteiler,
    raeume: RaumManager,
    ablage: Arc<dyn Datenablage>,
}

impl BenachrichtigungsDienst {
    pub fn neu(verteiler: Verteiler, raeume: RaumManager, ablage: Arc<dyn Datenablage>) -> Self {
        Self {
            verteiler,
            raeume,
            ablage,
        }
    }

    /// Speichert eine Benachrichtigung und stellt sie allen Geraeten zu
    ///
    /// Gibt die ID der Benachrichtigung zurueck.
    pub async fn benachrichtigung_senden(
        &self,
        user_id: &UserId,
        neu: NeueBenachrichtigung,
    ) -> SignalingResult<String> {
        let id = Uuid::new_v4().to_string();
        let zeitpunkt = jetzt();

        let nutzlast = json!({
            "id": id,
            "type": neu.typ,
            "priority": neu.prioritaet,
            "title": neu.titel,
            "message": neu.text,
            "data": neu.daten,
            "timestamp": zeitpunkt,
        });

        self.ablage
            .benachrichtigung_speichern(Benachrichtigung {
                id: id.clone(),
                user_id: user_id.clone(),
                typ: neu.typ,
                prioritaet: neu.prioritaet,
                titel: neu.titel,
                text: neu.text,
                daten: neu.daten,
                gelesen: false,
                erstellt: zeitpunkt,
                gelesen_am: None,
            })
            .await?;

        self.verteiler
            .an_user(user_id, ausgehend::NOTIFICATION_NEW, nutzlast);
        tracing::info!(notification_id = %id, user_id = %user_id, "Benachrichtigung gesendet");
        Ok(id)
    }

    /// Sendet eine Benachrichtigung an alle Abonnenten eines Themas
    ///
    /// Themen-Benachrichtigungen werden nicht gespeichert.
    pub fn an_thema_senden(&self, thema: &str, neu: NeueBenachrichtigung) {
        let nutzlast = json!({
            "id": Uuid::new_v4().to_string(),
            "type": neu.typ,
            "priority": neu.prioritaet,
            "title": neu.titel,
            "message": neu.text,
            "data": neu.daten,
            "topic": thema,
            "timestamp": jetzt(),
        });
        self.verteiler
            .an_raum(&themen_raum_id(thema), ausgehend::NOTIFICATION_NEW, nutzlast, None);
        tracing::debug!(thema = %thema, "Themen-Benachrichtigung gesendet");
    }

    /// `notification:read`
    pub async fn lesen(&self, akteur: &VerbindungsInfo, daten: BenachrichtigungLesen) -> SignalingResult<Value> {
        let gefunden = self
            .ablage
            .benachrichtigung_gelesen(&akteur.user_id, &daten.notification_id)
            .await?;
        if !gefunden {
            return Err(SignalingError::NichtGefunden("Notification not found".into()));
        }
        Ok(json!({ "notificationId": daten.notification_id }))
    }

    /// `notification:readAll`
    pub async fn alle_lesen(&self, akteur: &VerbindungsInfo) -> SignalingResult<Value> {
        let markiert = self.ablage.alle_gelesen(&akteur.user_id).await?;
        tracing::debug!(user_id = %akteur.user_id, markiert, "Alle Benachrichtigungen gelesen");
        Ok(json!({ "markedCount": markiert }))
    }

    /// `notification:getUnreadCount`
    pub async fn ungelesen(&self, akteur: &VerbindungsInfo) -> SignalingResult<Value> {
        let anzahl = self.ablage.ungelesen_anzahl(&akteur.user_id).await?;
        Ok(json!({ "unreadCount": anzahl }))
    }

    /// `notification:subscribe`
    pub fn themen_abonnieren(&self, akteur: &VerbindungsInfo, daten: Themen) {
        for thema in &daten.topics {
            self.raeume.beitreten(
                &themen_raum_id(thema),
                RoomType::Notification,
                akteur.connection_id,
                &akteur.user_id,
                &akteur.rolle,
                None,
            );
        }
        self.verteiler.an_verbindung(
            &akteur.connection_id,
            ausgehend::NOTIFICATION_SUBSCRIBED,
            json!({ "topics": daten.topics, "timestamp": jetzt() }),
        );
    }

    /// `notification:unsubscribe`
    pub fn themen_abbestellen(&self, akteur: &VerbindungsInfo, daten: Themen) {
        for thema in &daten.topics {
            self.raeume
                .verlassen(&themen_raum_id(thema), &akteur.connection_id);
        }
        self.verteiler.an_verbindung(
            &akteur.connection_id,
            ausgehend::NOTIFICATION_UNSUBSCRIBED,
            json!({ "topics": daten.topics, "timestamp": jetzt() }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitalink_auth::Identitaet;
    use vitalink_core::{ConnectionId, Rolle};
    use vitalink_protocol::ServerEvent;

    use crate::ablage::SpeicherAblage;
    use crate::presence::PresenceTracker;
    use crate::registry::{Registry, Transport, VerbindungsHandle};

    fn aufbau() -> (Registry, BenachrichtigungsDienst, SpeicherAblage) {
        let registry = Registry::neu();
        let raeume = RaumManager::neu();
        let verteiler = Verteiler::neu("test", registry.clone(), raeume.clone(), PresenceTracker::neu());
        let ablage = SpeicherAblage::neu();
        let dienst = BenachrichtigungsDienst::neu(verteiler, raeume, Arc::new(ablage.clone()));
        (registry, dienst, ablage)
    }

    fn verbinden(registry: &Registry, user: &str) -> (VerbindungsInfo, VerbindungsHandle) {
        let identitaet = Identitaet {
            user_id: UserId::neu(user),
            rolle: Rolle::neu("provider"),
            email: None,
        };
        let handle = registry
            .registrieren(ConnectionId::new(), &identitaet, Transport::WebSocket)
            .unwrap();
        (registry.info(&handle.connection_id).unwrap(), handle)
    }

    fn events(handle: &mut VerbindungsHandle) -> Vec<ServerEvent> {
        let mut liste = Vec::new();
        while let Ok(e) = handle.rx.try_recv() {
            liste.push(e);
        }
        liste
    }

    #[tokio::test]
    async fn benachrichtigung_erreicht_alle_geraete() {
        let (registry, dienst, ablage) = aufbau();
        let (info, mut h1) = verbinden(&registry, "d1");
        let (_, mut h2) = verbinden(&registry, "d1");

        let id = dienst
            .benachrichtigung_senden(
                &info.user_id,
                NeueBenachrichtigung::neu("appointment_reminder", "Termin", "In 15 Minuten")
                    .mit_prioritaet(Prioritaet::High),
            )
            .await
            .unwrap();

        for handle in [&mut h1, &mut h2] {
            let liste = events(handle);
            assert_eq!(liste[0].event, "notification:new");
            assert_eq!(liste[0].data["id"], id.as_str());
            assert_eq!(liste[0].data["priority"], "high");
        }
        assert_eq!(ablage.benachrichtigungen_von(&info.user_id).len(), 1);
    }

    #[tokio::test]
    async fn lesen_und_zaehlen() {
        let (registry, dienst, _ablage) = aufbau();
        let (info, _h) = verbinden(&registry, "d1");
        let mut ids = Vec::new();
        for titel in ["a", "b", "c"] {
            ids.push(
                dienst
                    .benachrichtigung_senden(&info.user_id, NeueBenachrichtigung::neu("system_alert", titel, "x"))
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(dienst.ungelesen(&info).await.unwrap()["unreadCount"], 3);
        let antwort = dienst
            .lesen(
                &info,
                BenachrichtigungLesen {
                    notification_id: ids[0].clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(antwort["notificationId"], ids[0].as_str());
        assert_eq!(dienst.alle_lesen(&info).await.unwrap()["markedCount"], 2);
        assert_eq!(dienst.ungelesen(&info).await.unwrap()["unreadCount"], 0);

        let fehler = dienst
            .lesen(
                &info,
                BenachrichtigungLesen {
                    notification_id: "gibt-es-nicht".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(fehler, SignalingError::NichtGefunden(_)));
    }

    #[tokio::test]
    async fn themen_abonnieren_und_abbestellen() {
        let (registry, dienst, _ablage) = aufbau();
        let (info, mut handle) = verbinden(&registry, "d1");
        let themen = || Themen {
            topics: vec!["lab_results".into()],
        };

        dienst.themen_abonnieren(&info, themen());
        assert_eq!(events(&mut handle)[0].event, "notification:subscribed");

        dienst.an_thema_senden("lab_results", NeueBenachrichtigung::neu("lab", "Befund", "Neu"));
        let liste = events(&mut handle);
        assert_eq!(liste[0].event, "notification:new");
        assert_eq!(liste[0].data["topic"], "lab_results");

        dienst.themen_abbestellen(&info, themen());
        assert_eq!(events(&mut handle)[0].event, "notification:unsubscribed");
        dienst.an_thema_senden("lab_results", NeueBenachrichtigung::neu("lab", "Befund", "Neu"));
        assert!(events(&mut handle).is_empty());
    }
}
