//! Anruf-Handler – Initiate, Accept, Reject, End, Signal, Quality
//!
//! Nur Teilnehmer eines Anrufs duerfen ihn veraendern. Die Zustandspruefung
//! selbst liegt in der [`crate::calls::AnrufEngine`].

use serde_json::{json, Value};
use vitalink_protocol::payload::{
    AnrufAblehnen, AnrufAnnehmen, AnrufBeenden, AnrufQualitaet, AnrufSignal, AnrufStarten,
};

use crate::calls::BeendenErgebnis;
use crate::error::SignalingResult;
use crate::registry::VerbindungsInfo;
use crate::server_state::SignalingState;

/// `call:initiate`
pub async fn handle_initiate(
    req: AnrufStarten,
    info: &VerbindungsInfo,
    state: &SignalingState,
) -> SignalingResult<Value> {
    state.anrufe.starten(info, req).await
}

/// `call:accept`
pub fn handle_accept(req: AnrufAnnehmen, info: &VerbindungsInfo, state: &SignalingState) -> SignalingResult<Value> {
    state.anrufe.annehmen(info, req)
}

/// `call:reject`
pub async fn handle_reject(
    req: AnrufAblehnen,
    info: &VerbindungsInfo,
    state: &SignalingState,
) -> SignalingResult<Value> {
    state.anrufe.ablehnen(info, req).await
}

/// `call:end`
///
/// Ein bereits beendeter Anruf wird mit `alreadyEnded` bestaetigt.
pub async fn handle_end(
    req: AnrufBeenden,
    info: &VerbindungsInfo,
    state: &SignalingState,
) -> SignalingResult<Value> {
    let call_id = req.call_id;
    match state.anrufe.beenden(info, req).await? {
        BeendenErgebnis::Beendet(anruf) => Ok(json!({
            "callId": call_id,
            "status": anruf.status,
            "duration": anruf.duration,
        })),
        BeendenErgebnis::BereitsBeendet(status) => Ok(json!({
            "callId": call_id,
            "alreadyEnded": true,
            "status": status,
        })),
    }
}

/// `call:signal` (fire-and-forget)
pub fn handle_signal(req: AnrufSignal, info: &VerbindungsInfo, state: &SignalingState) {
    state.anrufe.signal(info, req);
}

/// `call:quality` (fire-and-forget)
pub fn handle_quality(req: AnrufQualitaet, info: &VerbindungsInfo, state: &SignalingState) {
    state.anrufe.qualitaet(info, req);
}
