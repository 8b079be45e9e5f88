//! Raum-Handler – Join, Leave, Participants

use serde_json::{json, Value};
use vitalink_core::jetzt;
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::payload::{RaumAnfrage, RaumBeitreten};

use crate::error::{SignalingError, SignalingResult};
use crate::registry::VerbindungsInfo;
use crate::rooms::Teilnehmer;
use crate::server_state::SignalingState;

fn mitglied_event(raum_id: &vitalink_core::RoomId, teilnehmer: &Teilnehmer) -> Value {
    json!({
        "roomId": raum_id,
        "userId": teilnehmer.user_id,
        "userRole": teilnehmer.user_role,
        "timestamp": jetzt(),
    })
}

/// `room:join`
///
/// Vor dem Beitritt entscheidet die Zugriffsrichtlinie. Andere Mitglieder
/// erfahren nur von einem neuen Beitritt, nicht von einem wiederholten.
pub async fn handle_join(req: RaumBeitreten, info: &VerbindungsInfo, state: &SignalingState) -> SignalingResult<Value> {
    let erlaubt = state
        .richtlinie
        .raum_zugriff(
            &info.user_id,
            &info.rolle,
            &req.room_id,
            req.room_type,
            req.metadata.as_ref(),
        )
        .await?;
    if !erlaubt {
        tracing::warn!(room_id = %req.room_id, user_id = %info.user_id, "Raumbeitritt verweigert");
        return Err(SignalingError::ZugriffVerweigert("Access denied to this room".into()));
    }

    let (teilnehmer, neu) = state.raeume.beitreten(
        &req.room_id,
        req.room_type,
        info.connection_id,
        &info.user_id,
        &info.rolle,
        req.metadata,
    );

    if neu {
        state.verteiler.an_raum(
            &req.room_id,
            ausgehend::ROOM_USER_JOINED,
            mitglied_event(&req.room_id, &teilnehmer),
            Some(info.connection_id),
        );
        tracing::info!(
            room_id = %req.room_id,
            user_id = %info.user_id,
            room_type = req.room_type.als_str(),
            "Raum beigetreten"
        );
    }

    Ok(json!({
        "roomId": req.room_id,
        "participants": state.raeume.teilnehmer(&req.room_id),
    }))
}

/// `room:leave`
pub fn handle_leave(req: RaumAnfrage, info: &VerbindungsInfo, state: &SignalingState) -> SignalingResult<Value> {
    if let Some(teilnehmer) = state.raeume.verlassen(&req.room_id, &info.connection_id) {
        state.verteiler.an_raum(
            &req.room_id,
            ausgehend::ROOM_USER_LEFT,
            mitglied_event(&req.room_id, &teilnehmer),
            None,
        );
        tracing::info!(room_id = %req.room_id, user_id = %info.user_id, "Raum verlassen");
    }
    Ok(json!({ "roomId": req.room_id }))
}

/// `room:participants`
pub fn handle_participants(req: RaumAnfrage, state: &SignalingState) -> SignalingResult<Value> {
    Ok(json!({
        "roomId": req.room_id,
        "participants": state.raeume.teilnehmer(&req.room_id),
    }))
}
