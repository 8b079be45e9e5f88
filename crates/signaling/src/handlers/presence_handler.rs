//! Presence-Handler – Abfragen, eigener Status, Abonnements

use serde_json::{json, Value};
use vitalink_core::jetzt;
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::payload::{BenutzerListe, StatusSetzen};

use crate::error::SignalingResult;
use crate::registry::VerbindungsInfo;
use crate::server_state::SignalingState;

/// `presence:get`
pub async fn handle_get(req: BenutzerListe, state: &SignalingState) -> SignalingResult<Value> {
    Ok(json!({ "presence": state.presence.cluster_abfragen(&req.user_ids).await }))
}

/// `presence:setStatus` (fire-and-forget)
///
/// Der Aufrufer bekommt `presence:statusUpdated`, die Abonnenten
/// `presence:changed`.
pub fn handle_set_status(req: StatusSetzen, info: &VerbindungsInfo, state: &SignalingState) -> SignalingResult<()> {
    let presence = state
        .presence
        .status_setzen(&info.user_id, req.status, req.custom_status)?;

    state.verteiler.an_verbindung(
        &info.connection_id,
        ausgehend::PRESENCE_STATUS_UPDATED,
        json!({
            "status": presence.status,
            "customStatus": presence.custom_status,
            "timestamp": jetzt(),
        }),
    );
    state.presence_melden(presence);
    Ok(())
}

/// `presence:subscribe` (fire-and-forget)
///
/// Der Anfangszustand kommt aus dem Cluster, nicht nur aus diesem Prozess.
pub async fn handle_subscribe(req: BenutzerListe, info: &VerbindungsInfo, state: &SignalingState) {
    state.presence.abonnieren(info.connection_id, &req.user_ids);
    let anfang = state.presence.cluster_abfragen(&req.user_ids).await;
    tracing::debug!(
        connection_id = %info.connection_id,
        anzahl = req.user_ids.len(),
        "Presence abonniert"
    );
    state.verteiler.an_verbindung(
        &info.connection_id,
        ausgehend::PRESENCE_INITIAL,
        json!({ "presence": anfang }),
    );
}
