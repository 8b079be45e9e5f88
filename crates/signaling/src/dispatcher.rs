//! Event-Dispatcher – Routet Client-Frames an die richtigen Handler
//!
//! Der Dispatcher wandelt einen Roh-Frame in ein typisiertes
//! [`ClientPayload`], ruft den Handler auf und baut bei Bedarf das Ack.
//!
//! ## Antworten
//! - Request-Events mit `ack`-ID bekommen genau ein Ack (Erfolg oder Fehler)
//! - Request-Events ohne `ack`-ID bekommen im Fehlerfall ein `error`-Event
//! - Fire-and-forget-Events werden nie beantwortet, Fehler nur geloggt

use serde_json::{json, Value};
use std::sync::Arc;
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::{ack, ClientFrame, ClientPayload, ErrorCode, ProtokollFehler, ServerEvent};

use crate::error::{SignalingError, SignalingResult};
use crate::handlers::{
    call_handler, message_handler, notification_handler, presence_handler, room_handler,
};
use crate::registry::VerbindungsInfo;
use crate::server_state::SignalingState;

/// Zentraler Event-Dispatcher
pub struct MessageDispatcher {
    state: Arc<SignalingState>,
}

impl MessageDispatcher {
    /// Erstellt einen neuen Dispatcher
    pub fn neu(state: Arc<SignalingState>) -> Self {
        Self { state }
    }

    /// Verarbeitet einen Client-Frame und gibt die Antwort zurueck
    ///
    /// Gibt `None` zurueck, wenn keine Antwort gesendet werden soll.
    pub async fn dispatch(&self, info: &VerbindungsInfo, frame: ClientFrame) -> Option<ServerEvent> {
        let ack_id = frame.ack;
        let event = frame.event;

        let payload = match ClientPayload::aus_event(&event, frame.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(
                    connection_id = %info.connection_id,
                    event = %event,
                    fehler = %e,
                    "Ungueltiges Event"
                );
                return Some(fehler_antwort(
                    ack_id,
                    &event,
                    ErrorCode::InvalidRequest,
                    &protokoll_meldung(&e),
                ));
            }
        };

        let erwartet_antwort = payload.erwartet_antwort();
        match self.route(payload, info).await {
            Ok(Some(felder)) => ack_id.map(|id| ServerEvent::antwort(id, ack::erfolg(felder))),
            Ok(None) => None,
            Err(e) => {
                fehler_loggen(info, &event, &e);
                if !erwartet_antwort {
                    return None;
                }
                Some(match ack_id {
                    Some(id) => ServerEvent::antwort(id, e.als_ack()),
                    None => fehler_event(&event, e.code(), &e.client_meldung()),
                })
            }
        }
    }

    /// Ruft den Handler auf
    ///
    /// `Ok(None)` steht fuer Fire-and-forget-Events.
    async fn route(&self, payload: ClientPayload, info: &VerbindungsInfo) -> SignalingResult<Option<Value>> {
        let state = self.state.as_ref();

        let felder = match payload {
            // -------------------------------------------------------------------
            // Nachrichten
            // -------------------------------------------------------------------
            ClientPayload::NachrichtSenden(req) => message_handler::handle_send(req, info, state).await?,
            ClientPayload::Verlauf(req) => message_handler::handle_history(req, info, state).await?,
            ClientPayload::NachrichtEmpfangen(req) => {
                message_handler::handle_received(req, info, state);
                return Ok(None);
            }
            ClientPayload::NachrichtGelesen(req) => {
                message_handler::handle_read(req, info, state);
                return Ok(None);
            }
            ClientPayload::TippenStart(req) => {
                message_handler::handle_typing(req, true, info, state);
                return Ok(None);
            }
            ClientPayload::TippenStop(req) => {
                message_handler::handle_typing(req, false, info, state);
                return Ok(None);
            }

            // -------------------------------------------------------------------
            // Anrufe
            // -------------------------------------------------------------------
            ClientPayload::AnrufStarten(req) => call_handler::handle_initiate(req, info, state).await?,
            ClientPayload::AnrufAnnehmen(req) => call_handler::handle_accept(req, info, state)?,
            ClientPayload::AnrufAblehnen(req) => call_handler::handle_reject(req, info, state).await?,
            ClientPayload::AnrufBeenden(req) => call_handler::handle_end(req, info, state).await?,
            ClientPayload::AnrufSignal(req) => {
                call_handler::handle_signal(req, info, state);
                return Ok(None);
            }
            ClientPayload::AnrufQualitaet(req) => {
                call_handler::handle_quality(req, info, state);
                return Ok(None);
            }

            // -------------------------------------------------------------------
            // Raeume
            // -------------------------------------------------------------------
            ClientPayload::RaumBeitreten(req) => room_handler::handle_join(req, info, state).await?,
            ClientPayload::RaumVerlassen(req) => room_handler::handle_leave(req, info, state)?,
            ClientPayload::RaumTeilnehmer(req) => room_handler::handle_participants(req, state)?,

            // -------------------------------------------------------------------
            // Presence
            // -------------------------------------------------------------------
            ClientPayload::PresenceAbfragen(req) => presence_handler::handle_get(req, state).await?,
            ClientPayload::PresenceStatusSetzen(req) => {
                presence_handler::handle_set_status(req, info, state)?;
                return Ok(None);
            }
            ClientPayload::PresenceAbonnieren(req) => {
                presence_handler::handle_subscribe(req, info, state).await;
                return Ok(None);
            }

            // -------------------------------------------------------------------
            // Benachrichtigungen
            // -------------------------------------------------------------------
            ClientPayload::BenachrichtigungGelesen(req) => {
                notification_handler::handle_read(req, info, state).await?
            }
            ClientPayload::AlleBenachrichtigungenGelesen => {
                notification_handler::handle_read_all(info, state).await?
            }
            ClientPayload::UngelesenAnzahl => notification_handler::handle_unread_count(info, state).await?,
            ClientPayload::ThemenAbonnieren(req) => {
                notification_handler::handle_topics(req, true, info, state);
                return Ok(None);
            }
            ClientPayload::ThemenAbbestellen(req) => {
                notification_handler::handle_topics(req, false, info, state);
                return Ok(None);
            }
        };

        Ok(Some(felder))
    }
}

fn fehler_loggen(info: &VerbindungsInfo, event: &str, fehler: &SignalingError) {
    if fehler.ist_intern() {
        tracing::error!(
            connection_id = %info.connection_id,
            user_id = %info.user_id,
            event = %event,
            fehler = %fehler,
            "Interner Fehler im Handler"
        );
    } else {
        tracing::debug!(
            connection_id = %info.connection_id,
            user_id = %info.user_id,
            event = %event,
            fehler = %fehler,
            "Event abgelehnt"
        );
    }
}

fn protokoll_meldung(fehler: &ProtokollFehler) -> String {
    match fehler {
        ProtokollFehler::UngueltigerFrame(_) => "Malformed frame".to_string(),
        ProtokollFehler::UnbekanntesEvent(event) => format!("Unknown event '{event}'"),
        ProtokollFehler::UngueltigeDaten { event, grund } => format!("Invalid payload for '{event}': {grund}"),
    }
}

fn fehler_antwort(ack_id: Option<u64>, event: &str, code: ErrorCode, meldung: &str) -> ServerEvent {
    match ack_id {
        Some(id) => ServerEvent::antwort(id, ack::fehler(code, meldung)),
        None => fehler_event(event, code, meldung),
    }
}

/// `error`-Event fuer Fehler ohne Ack-Bezug
pub fn fehler_event(event: &str, code: ErrorCode, meldung: &str) -> ServerEvent {
    ServerEvent::neu(
        ausgehend::ERROR,
        json!({
            "event": event,
            "code": code,
            "message": meldung,
        }),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
