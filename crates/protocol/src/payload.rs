//! Typisierte Nutzdaten der Client-Events
//!
//! ## Design
//! - Feldnamen auf dem Wire in camelCase, wie sie die Clients senden
//! - Ein Roh-Frame wird ueber den Event-Namen in genau eine Variante von
//!   [`ClientPayload`] ueberfuehrt
//! - Events ohne Nutzdaten akzeptieren `null` oder ein leeres Objekt

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vitalink_core::{CallId, RoomId, UserId};

use crate::error::ProtokollFehler;
use crate::events::eingehend;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Art eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Art einer WebRTC-Signalnachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

/// Zustand eines Anrufs
///
/// ```text
/// Initiating -> Ringing -> Accepted -> InProgress -> Ended
///                  |
///                  +-> Rejected | Missed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiating,
    Ringing,
    Accepted,
    InProgress,
    Ended,
    Rejected,
    Missed,
    Failed,
}

impl CallStatus {
    /// Gibt true zurueck wenn der Anruf abgeschlossen ist
    pub fn ist_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Rejected | Self::Missed | Self::Failed
        )
    }

    /// Aktionen, die ein Teilnehmer in diesem Zustand ausfuehren darf
    pub fn erlaubte_aktionen(&self) -> Vec<&'static str> {
        match self {
            Self::Initiating => vec![],
            Self::Ringing => vec!["accept", "reject", "signal"],
            Self::Accepted | Self::InProgress => vec!["end", "signal", "quality"],
            Self::Ended | Self::Rejected | Self::Missed | Self::Failed => vec![],
        }
    }

    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.als_str())
    }
}

/// Art eines Raums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Chat,
    VideoCall,
    Notification,
}

impl RoomType {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::VideoCall => "video_call",
            Self::Notification => "notification",
        }
    }
}

/// Presence-Status eines Benutzers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    Busy,
    InCall,
}

impl PresenceStatus {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::InCall => "in_call",
        }
    }
}

/// Prioritaet einer Benachrichtigung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prioritaet {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

// ---------------------------------------------------------------------------
// Nachrichten
// ---------------------------------------------------------------------------

/// `message:send`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NachrichtSenden {
    pub room_id: Option<RoomId>,
    pub recipient_id: Option<UserId>,
    pub visit_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub metadata: Option<Value>,
}

/// `message:received`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NachrichtEmpfangen {
    pub message_id: String,
    pub room_id: Option<RoomId>,
    pub sender_id: Option<UserId>,
}

/// `message:read`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NachrichtGelesen {
    pub message_ids: Vec<String>,
    pub room_id: Option<RoomId>,
    pub sender_id: Option<UserId>,
}

/// `typing:start` / `typing:stop`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tippen {
    pub room_id: Option<RoomId>,
    pub recipient_id: Option<UserId>,
}

/// `message:history`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerlaufAnfrage {
    #[serde(default)]
    pub visit_id: String,
    pub limit: Option<usize>,
    pub before: Option<chrono::DateTime<chrono::Utc>>,
}

// ---------------------------------------------------------------------------
// Anrufe
// ---------------------------------------------------------------------------

/// `call:initiate`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnrufStarten {
    pub recipient_id: UserId,
    pub call_type: CallType,
    pub visit_id: Option<String>,
    pub metadata: Option<Value>,
}

/// `call:accept`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnrufAnnehmen {
    pub call_id: CallId,
}

/// `call:reject`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnrufAblehnen {
    pub call_id: CallId,
    pub reason: Option<String>,
}

/// `call:end`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnrufBeenden {
    pub call_id: CallId,
    /// Dauer in Sekunden, falls der Client sie selbst gemessen hat
    pub duration: Option<u64>,
}

/// `call:signal` – opake SDP/ICE-Nutzlast
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnrufSignal {
    pub call_id: CallId,
    pub recipient_id: Option<UserId>,
    pub signal: Value,
    pub signal_type: SignalType,
}

/// Qualitaetsmetriken eines Anrufs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitaetsMetriken {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_lost: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
}

/// `call:quality`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnrufQualitaet {
    pub call_id: CallId,
    #[serde(default)]
    pub metrics: QualitaetsMetriken,
}

// ---------------------------------------------------------------------------
// Raeume
// ---------------------------------------------------------------------------

/// `room:join`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaumBeitreten {
    pub room_id: RoomId,
    #[serde(default = "standard_raum_typ")]
    pub room_type: RoomType,
    pub metadata: Option<Value>,
}

fn standard_raum_typ() -> RoomType {
    RoomType::Chat
}

/// `room:leave` / `room:participants`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaumAnfrage {
    pub room_id: RoomId,
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// `presence:get` / `presence:subscribe`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenutzerListe {
    #[serde(default)]
    pub user_ids: Vec<UserId>,
}

/// `presence:setStatus`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSetzen {
    pub status: PresenceStatus,
    pub custom_status: Option<String>,
}

// ---------------------------------------------------------------------------
// Benachrichtigungen
// ---------------------------------------------------------------------------

/// `notification:read`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenachrichtigungLesen {
    pub notification_id: String,
}

/// `notification:subscribe` / `notification:unsubscribe`
#[derive(Debug, Clone, Deserialize)]
pub struct Themen {
    #[serde(default)]
    pub topics: Vec<String>,
}

// ---------------------------------------------------------------------------
// ClientPayload
// ---------------------------------------------------------------------------

/// Alle Events, die ein Client senden kann
#[derive(Debug, Clone)]
pub enum ClientPayload {
    NachrichtSenden(NachrichtSenden),
    NachrichtEmpfangen(NachrichtEmpfangen),
    NachrichtGelesen(NachrichtGelesen),
    TippenStart(Tippen),
    TippenStop(Tippen),
    Verlauf(VerlaufAnfrage),

    AnrufStarten(AnrufStarten),
    AnrufAnnehmen(AnrufAnnehmen),
    AnrufAblehnen(AnrufAblehnen),
    AnrufBeenden(AnrufBeenden),
    AnrufSignal(AnrufSignal),
    AnrufQualitaet(AnrufQualitaet),

    RaumBeitreten(RaumBeitreten),
    RaumVerlassen(RaumAnfrage),
    RaumTeilnehmer(RaumAnfrage),

    PresenceAbfragen(BenutzerListe),
    PresenceStatusSetzen(StatusSetzen),
    PresenceAbonnieren(BenutzerListe),

    BenachrichtigungGelesen(BenachrichtigungLesen),
    AlleBenachrichtigungenGelesen,
    UngelesenAnzahl,
    ThemenAbonnieren(Themen),
    ThemenAbbestellen(Themen),
}

impl ClientPayload {
    /// Wandelt Event-Name und Roh-Daten in eine typisierte Nutzlast
    pub fn aus_event(event: &str, daten: Value) -> Result<Self, ProtokollFehler> {
        let daten = if daten.is_null() {
            Value::Object(Default::default())
        } else {
            daten
        };

        let payload = match event {
            eingehend::MESSAGE_SEND => Self::NachrichtSenden(lesen(event, daten)?),
            eingehend::MESSAGE_RECEIVED => Self::NachrichtEmpfangen(lesen(event, daten)?),
            eingehend::MESSAGE_READ => Self::NachrichtGelesen(lesen(event, daten)?),
            eingehend::TYPING_START => Self::TippenStart(lesen(event, daten)?),
            eingehend::TYPING_STOP => Self::TippenStop(lesen(event, daten)?),
            eingehend::MESSAGE_HISTORY => Self::Verlauf(lesen(event, daten)?),

            eingehend::CALL_INITIATE => Self::AnrufStarten(lesen(event, daten)?),
            eingehend::CALL_ACCEPT => Self::AnrufAnnehmen(lesen(event, daten)?),
            eingehend::CALL_REJECT => Self::AnrufAblehnen(lesen(event, daten)?),
            eingehend::CALL_END => Self::AnrufBeenden(lesen(event, daten)?),
            eingehend::CALL_SIGNAL => Self::AnrufSignal(lesen(event, daten)?),
            eingehend::CALL_QUALITY => Self::AnrufQualitaet(lesen(event, daten)?),

            eingehend::ROOM_JOIN => Self::RaumBeitreten(lesen(event, daten)?),
            eingehend::ROOM_LEAVE => Self::RaumVerlassen(lesen(event, daten)?),
            eingehend::ROOM_PARTICIPANTS => Self::RaumTeilnehmer(lesen(event, daten)?),

            eingehend::PRESENCE_GET => Self::PresenceAbfragen(lesen(event, daten)?),
            eingehend::PRESENCE_SET_STATUS => Self::PresenceStatusSetzen(lesen(event, daten)?),
            eingehend::PRESENCE_SUBSCRIBE => Self::PresenceAbonnieren(lesen(event, daten)?),

            eingehend::NOTIFICATION_READ => Self::BenachrichtigungGelesen(lesen(event, daten)?),
            eingehend::NOTIFICATION_READ_ALL => Self::AlleBenachrichtigungenGelesen,
            eingehend::NOTIFICATION_UNREAD_COUNT => Self::UngelesenAnzahl,
            eingehend::NOTIFICATION_SUBSCRIBE => Self::ThemenAbonnieren(lesen(event, daten)?),
            eingehend::NOTIFICATION_UNSUBSCRIBE => Self::ThemenAbbestellen(lesen(event, daten)?),

            unbekannt => return Err(ProtokollFehler::UnbekanntesEvent(unbekannt.to_string())),
        };
        Ok(payload)
    }

    /// Gibt true zurueck fuer Events, auf die der Server mit einem Ack antwortet
    ///
    /// Alle anderen Events sind fire-and-forget: Fehler werden nur geloggt.
    pub fn erwartet_antwort(&self) -> bool {
        !matches!(
            self,
            Self::NachrichtEmpfangen(_)
                | Self::NachrichtGelesen(_)
                | Self::TippenStart(_)
                | Self::TippenStop(_)
                | Self::AnrufSignal(_)
                | Self::AnrufQualitaet(_)
                | Self::PresenceStatusSetzen(_)
                | Self::PresenceAbonnieren(_)
                | Self::ThemenAbonnieren(_)
                | Self::ThemenAbbestellen(_)
        )
    }
}

fn lesen<T: serde::de::DeserializeOwned>(event: &str, daten: Value) -> Result<T, ProtokollFehler> {
    serde_json::from_value(daten).map_err(|e| ProtokollFehler::UngueltigeDaten {
        event: event.to_string(),
        grund: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anruf_starten_lesen() {
        let payload = ClientPayload::aus_event(
            "call:initiate",
            json!({ "recipientId": "u2", "callType": "video", "visitId": "v9" }),
        )
        .unwrap();

        match payload {
            ClientPayload::AnrufStarten(a) => {
                assert_eq!(a.recipient_id, UserId::neu("u2"));
                assert_eq!(a.call_type, CallType::Video);
                assert_eq!(a.visit_id.as_deref(), Some("v9"));
            }
            anderes => panic!("Erwartet AnrufStarten, erhalten {anderes:?}"),
        }
    }

    #[test]
    fn signal_typ_ice_candidate() {
        let payload = ClientPayload::aus_event(
            "call:signal",
            json!({
                "callId": "00000000-0000-0000-0000-000000000001",
                "signal": { "candidate": "a=..." },
                "signalType": "ice-candidate"
            }),
        )
        .unwrap();
        match payload {
            ClientPayload::AnrufSignal(s) => assert_eq!(s.signal_type, SignalType::IceCandidate),
            anderes => panic!("Erwartet AnrufSignal, erhalten {anderes:?}"),
        }
    }

    #[test]
    fn event_ohne_daten() {
        let payload = ClientPayload::aus_event("notification:readAll", Value::Null).unwrap();
        assert!(matches!(payload, ClientPayload::AlleBenachrichtigungenGelesen));

        let payload = ClientPayload::aus_event("typing:start", Value::Null).unwrap();
        assert!(matches!(payload, ClientPayload::TippenStart(_)));
    }

    #[test]
    fn unbekanntes_event() {
        let fehler = ClientPayload::aus_event("call:teleport", json!({})).unwrap_err();
        assert!(matches!(fehler, ProtokollFehler::UnbekanntesEvent(e) if e == "call:teleport"));
    }

    #[test]
    fn fehlendes_pflichtfeld() {
        let fehler = ClientPayload::aus_event("call:accept", json!({})).unwrap_err();
        assert!(matches!(fehler, ProtokollFehler::UngueltigeDaten { .. }));
    }

    #[test]
    fn raum_typ_standard_ist_chat() {
        let payload = ClientPayload::aus_event("room:join", json!({ "roomId": "r1" })).unwrap();
        match payload {
            ClientPayload::RaumBeitreten(r) => assert_eq!(r.room_type, RoomType::Chat),
            anderes => panic!("Erwartet RaumBeitreten, erhalten {anderes:?}"),
        }
    }

    #[test]
    fn fire_and_forget_events() {
        let signal = ClientPayload::aus_event(
            "call:signal",
            json!({
                "callId": "00000000-0000-0000-0000-000000000001",
                "signal": {},
                "signalType": "offer"
            }),
        )
        .unwrap();
        assert!(!signal.erwartet_antwort());

        let beenden = ClientPayload::aus_event(
            "call:end",
            json!({ "callId": "00000000-0000-0000-0000-000000000001" }),
        )
        .unwrap();
        assert!(beenden.erwartet_antwort());
    }

    #[test]
    fn status_wire_format() {
        assert_eq!(
            serde_json::to_value(CallStatus::InProgress).unwrap(),
            json!("in_progress")
        );
        assert_eq!(CallStatus::InProgress.to_string(), "in_progress");
        assert_eq!(
            serde_json::to_value(PresenceStatus::InCall).unwrap(),
            json!("in_call")
        );
        assert!(CallStatus::Missed.ist_terminal());
        assert!(!CallStatus::Accepted.ist_terminal());
        assert_eq!(CallStatus::Ringing.erlaubte_aktionen(), vec!["accept", "reject", "signal"]);
    }
}
