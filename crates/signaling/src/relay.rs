//! Nachrichten-Relay – Chatnachrichten, Zustellbestaetigungen, Tippanzeige
//!
//! Ziele in absteigender Prioritaet: Raum (ohne Absender-Verbindung),
//! Empfaenger (alle Geraete), Besuchsraum `visit:{id}`.
//! Nachrichten mit Besuchsbezug werden vor dem Versand geprueft und
//! gespeichert.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;
use vitalink_core::{jetzt, RoomId, UserId};
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::payload::{
    NachrichtEmpfangen, NachrichtGelesen, NachrichtSenden, Tippen, VerlaufAnfrage,
};

use crate::ablage::{Datenablage, GespeicherteNachricht};
use crate::error::{SignalingError, SignalingResult};
use crate::fanout::Verteiler;
use crate::registry::VerbindungsInfo;
use crate::rooms::besuchs_raum_id;
use crate::zugriff::ZugriffsRichtlinie;

/// Standardgroesse einer Verlaufsseite
const VERLAUF_STANDARD: usize = 50;

/// Maximale Groesse einer Verlaufsseite
const VERLAUF_MAXIMUM: usize = 100;

/// Adressat einer Relay-Nachricht
enum Route<'a> {
    Raum(RoomId),
    Benutzer(&'a UserId),
}

/// Leitet Chat-Events weiter
#[derive(Clone)]
pub struct NachrichtenRelay {
    verteiler: Verteiler,
    richtlinie: Arc<dyn ZugriffsRichtlinie>,
    ablage: Arc<dyn Datenablage>,
}

impl NachrichtenRelay {
    pub fn neu(
        verteiler: Verteiler,
        richtlinie: Arc<dyn ZugriffsRichtlinie>,
        ablage: Arc<dyn Datenablage>,
    ) -> Self {
        Self {
            verteiler,
            richtlinie,
            ablage,
        }
    }

    /// `message:send`
    pub async fn senden(&self, akteur: &VerbindungsInfo, daten: NachrichtSenden) -> SignalingResult<Value> {
        if daten.message.trim().is_empty() {
            return Err(SignalingError::anfrage("Message content is required"));
        }

        let route = match (&daten.room_id, &daten.recipient_id, &daten.visit_id) {
            (Some(raum), _, _) => Route::Raum(raum.clone()),
            (None, Some(empfaenger), _) => Route::Benutzer(empfaenger),
            (None, None, Some(visit_id)) => Route::Raum(besuchs_raum_id(visit_id)),
            (None, None, None) => {
                return Err(SignalingError::anfrage(
                    "Either roomId, recipientId, or visitId is required",
                ))
            }
        };

        let id = Uuid::new_v4().to_string();
        let zeitpunkt = jetzt();

        if let Some(visit_id) = &daten.visit_id {
            self.besuch_pruefen(akteur, visit_id, "Access denied to this visit").await?;
            self.ablage
                .nachricht_speichern(GespeicherteNachricht {
                    id: id.clone(),
                    sender_id: akteur.user_id.clone(),
                    sender_role: akteur.rolle.clone(),
                    visit_id: visit_id.clone(),
                    message: daten.message.clone(),
                    attachments: daten.attachments.clone(),
                    timestamp: zeitpunkt,
                })
                .await?;
        }

        let mut metadata = match daten.metadata {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        metadata.insert("senderRole".into(), json!(akteur.rolle));

        let nachricht = json!({
            "id": id,
            "senderId": akteur.user_id,
            "recipientId": daten.recipient_id,
            "visitId": daten.visit_id,
            "roomId": daten.room_id,
            "message": daten.message,
            "attachments": daten.attachments,
            "timestamp": zeitpunkt,
            "status": "sent",
            "metadata": metadata,
        });

        self.zustellen(akteur, route, ausgehend::MESSAGE_NEW, nachricht.clone());
        self.verteiler
            .an_verbindung(&akteur.connection_id, ausgehend::MESSAGE_SENT, nachricht.clone());

        tracing::info!(
            message_id = %id,
            user_id = %akteur.user_id,
            visit_id = ?daten.visit_id,
            "Nachricht gesendet"
        );
        Ok(json!({ "message": nachricht }))
    }

    /// `message:received` – Zustellbestaetigung an Raum oder Absender
    pub fn empfangen(&self, akteur: &VerbindungsInfo, daten: NachrichtEmpfangen) {
        let nutzlast = json!({
            "messageId": daten.message_id,
            "userId": akteur.user_id,
            "timestamp": jetzt(),
        });
        match ziel(daten.room_id, daten.sender_id.as_ref()) {
            Some(route) => self.zustellen(akteur, route, ausgehend::MESSAGE_DELIVERED, nutzlast),
            None => tracing::debug!(message_id = %daten.message_id, "Zustellbestaetigung ohne Ziel"),
        }
    }

    /// `message:read` – Lesebestaetigung an Raum oder Absender
    pub fn gelesen(&self, akteur: &VerbindungsInfo, daten: NachrichtGelesen) {
        let nutzlast = json!({
            "messageIds": daten.message_ids,
            "userId": akteur.user_id,
            "timestamp": jetzt(),
        });
        if let Some(route) = ziel(daten.room_id, daten.sender_id.as_ref()) {
            self.zustellen(akteur, route, ausgehend::MESSAGE_READ, nutzlast);
        }
    }

    /// `typing:start` / `typing:stop`
    pub fn tippen(&self, akteur: &VerbindungsInfo, daten: Tippen, start: bool) {
        let event = if start {
            ausgehend::TYPING_START
        } else {
            ausgehend::TYPING_STOP
        };
        let nutzlast = json!({
            "userId": akteur.user_id,
            "userRole": akteur.rolle,
            "roomId": daten.room_id,
            "timestamp": jetzt(),
        });
        if let Some(route) = ziel(daten.room_id, daten.recipient_id.as_ref()) {
            self.zustellen(akteur, route, event, nutzlast);
        }
    }

    /// `message:history` – Seite aus dem Besuchsverlauf, chronologisch
    pub async fn verlauf(&self, akteur: &VerbindungsInfo, daten: VerlaufAnfrage) -> SignalingResult<Value> {
        if daten.visit_id.trim().is_empty() {
            return Err(SignalingError::anfrage("visitId is required"));
        }
        self.besuch_pruefen(akteur, &daten.visit_id, "Access denied to this conversation")
            .await?;

        let limit = daten
            .limit
            .unwrap_or(VERLAUF_STANDARD)
            .clamp(1, VERLAUF_MAXIMUM);

        // Ein Eintrag mehr verraet, ob es aeltere Nachrichten gibt
        let mut seite = self
            .ablage
            .verlauf(&daten.visit_id, limit + 1, daten.before)
            .await?;
        let has_more = seite.len() > limit;
        seite.truncate(limit);
        seite.reverse();

        tracing::debug!(
            user_id = %akteur.user_id,
            visit_id = %daten.visit_id,
            anzahl = seite.len(),
            "Verlauf geladen"
        );
        Ok(json!({ "messages": seite, "hasMore": has_more }))
    }

    async fn besuch_pruefen(
        &self,
        akteur: &VerbindungsInfo,
        visit_id: &str,
        meldung: &str,
    ) -> SignalingResult<()> {
        let erlaubt = self
            .richtlinie
            .besuch_zugriff(&akteur.user_id, &akteur.rolle, visit_id)
            .await?;
        if erlaubt {
            Ok(())
        } else {
            Err(SignalingError::ZugriffVerweigert(meldung.to_string()))
        }
    }

    fn zustellen(&self, akteur: &VerbindungsInfo, route: Route<'_>, event: &str, daten: Value) {
        match route {
            Route::Raum(raum) => {
                self.verteiler
                    .an_raum(&raum, event, daten, Some(akteur.connection_id))
            }
            Route::Benutzer(user_id) => self.verteiler.an_user(user_id, event, daten),
        }
    }
}

fn ziel(raum: Option<RoomId>, benutzer: Option<&UserId>) -> Option<Route<'_>> {
    match (raum, benutzer) {
        (Some(raum), _) => Some(Route::Raum(raum)),
        (None, Some(user_id)) => Some(Route::Benutzer(user_id)),
        (None, None) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
