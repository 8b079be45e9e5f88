//! Benachrichtigungs-Handler – Lesen, Zaehlen, Themen

use serde_json::Value;
use vitalink_protocol::payload::{BenachrichtigungLesen, Themen};

use crate::error::SignalingResult;
use crate::registry::VerbindungsInfo;
use crate::server_state::SignalingState;

/// `notification:read`
pub async fn handle_read(
    req: BenachrichtigungLesen,
    info: &VerbindungsInfo,
    state: &SignalingState,
) -> SignalingResult<Value> {
    state.benachrichtigungen.lesen(info, req).await
}

/// `notification:readAll`
pub async fn handle_read_all(info: &VerbindungsInfo, state: &SignalingState) -> SignalingResult<Value> {
    state.benachrichtigungen.alle_lesen(info).await
}

/// `notification:getUnreadCount`
pub async fn handle_unread_count(info: &VerbindungsInfo, state: &SignalingState) -> SignalingResult<Value> {
    state.benachrichtigungen.ungelesen(info).await
}

/// `notification:subscribe` / `notification:unsubscribe` (fire-and-forget)
pub fn handle_topics(req: Themen, abonnieren: bool, info: &VerbindungsInfo, state: &SignalingState) {
    if abonnieren {
        state.benachrichtigungen.themen_abonnieren(info, req);
    } else {
        state.benachrichtigungen.themen_abbestellen(info, req);
    }
}
