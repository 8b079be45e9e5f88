//! Nachrichten-Handler – Senden, Bestaetigungen, Tippen, Verlauf

use serde_json::Value;
use vitalink_protocol::payload::{
    NachrichtEmpfangen, NachrichtGelesen, NachrichtSenden, Tippen, VerlaufAnfrage,
};

use crate::error::SignalingResult;
use crate::registry::VerbindungsInfo;
use crate::server_state::SignalingState;

/// `message:send`
pub async fn handle_send(
    req: NachrichtSenden,
    info: &VerbindungsInfo,
    state: &SignalingState,
) -> SignalingResult<Value> {
    state.relay.senden(info, req).await
}

/// `message:received` (fire-and-forget)
pub fn handle_received(req: NachrichtEmpfangen, info: &VerbindungsInfo, state: &SignalingState) {
    state.relay.empfangen(info, req);
}

/// `message:read` (fire-and-forget)
pub fn handle_read(req: NachrichtGelesen, info: &VerbindungsInfo, state: &SignalingState) {
    state.relay.gelesen(info, req);
}

/// `typing:start` / `typing:stop` (fire-and-forget)
pub fn handle_typing(req: Tippen, start: bool, info: &VerbindungsInfo, state: &SignalingState) {
    state.relay.tippen(info, req, start);
}

/// `message:history`
pub async fn handle_history(
    req: VerlaufAnfrage,
    info: &VerbindungsInfo,
    state: &SignalingState,
) -> SignalingResult<Value> {
    state.relay.verlauf(info, req).await
}
