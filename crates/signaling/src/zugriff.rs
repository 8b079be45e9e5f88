//! Zugriffsrichtlinie fuer Besuche und Raeume
//!
//! Der Kern entscheidet keine Geschaeftsregeln selbst. Er fragt vor
//! besuchsbezogenen Aktionen (Anruf, Nachricht, Verlauf) und vor jedem
//! `room:join` die Richtlinie.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use vitalink_core::{RoomId, Rolle, UserId};
use vitalink_protocol::RoomType;

use crate::error::SignalingResult;

/// Externe Richtlinie fuer den Zugriff auf Besuche
#[async_trait]
pub trait ZugriffsRichtlinie: Send + Sync {
    /// Darf `user_id` mit `rolle` auf den Besuch `visit_id` zugreifen?
    async fn besuch_zugriff(&self, user_id: &UserId, rolle: &Rolle, visit_id: &str) -> SignalingResult<bool>;

    /// Darf `user_id` dem Raum `raum_id` beitreten?
    async fn raum_zugriff(
        &self,
        user_id: &UserId,
        rolle: &Rolle,
        raum_id: &RoomId,
        raum_typ: RoomType,
        metadata: Option<&Value>,
    ) -> SignalingResult<bool>;
}

/// Beteiligte eines Besuchs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Besuch {
    pub patient: UserId,
    pub behandler: UserId,
}

/// Standard-Richtlinie auf Basis von Rollen und registrierten Besuchen
///
/// Rollen mit Vollzugriff (z.B. `admin`) duerfen alles. Alle anderen
/// Benutzer nur Besuche, bei denen sie Patient oder Behandler sind.
///
/// Raeume:
/// - `chat:a:b` nur fuer die genannten Benutzer
/// - `notifications:{id}` nur fuer den Benutzer selbst
/// - `call:{visit}`, `visit:{visit}` und Raeume mit `visitId` in den
///   Metadaten nur fuer Beteiligte des Besuchs
/// - alle anderen Raeume (z.B. `topic:*`) sind offen
#[derive(Clone)]
pub struct RollenZugriff {
    vollzugriff: Arc<Vec<String>>,
    besuche: Arc<DashMap<String, Besuch>>,
}

impl RollenZugriff {
    pub fn neu(vollzugriff_rollen: Vec<String>) -> Self {
        Self {
            vollzugriff: Arc::new(vollzugriff_rollen),
            besuche: Arc::new(DashMap::new()),
        }
    }

    /// Registriert die Beteiligten eines Besuchs
    pub fn besuch_registrieren(&self, visit_id: impl Into<String>, besuch: Besuch) {
        let visit_id = visit_id.into();
        tracing::debug!(visit_id = %visit_id, patient = %besuch.patient, behandler = %besuch.behandler, "Besuch registriert");
        self.besuche.insert(visit_id, besuch);
    }

    /// Gibt true zurueck wenn die Rolle Vollzugriff hat
    pub fn hat_vollzugriff(&self, rolle: &Rolle) -> bool {
        self.vollzugriff.iter().any(|r| rolle.ist(r))
    }
}

#[async_trait]
impl ZugriffsRichtlinie for RollenZugriff {
    async fn besuch_zugriff(&self, user_id: &UserId, rolle: &Rolle, visit_id: &str) -> SignalingResult<bool> {
        if self.hat_vollzugriff(rolle) {
            return Ok(true);
        }

        let erlaubt = self
            .besuche
            .get(visit_id)
            .map(|b| &b.patient == user_id || &b.behandler == user_id)
            .unwrap_or(false);

        if !erlaubt {
            tracing::debug!(user_id = %user_id, visit_id = %visit_id, "Kein Zugriff auf Besuch");
        }
        Ok(erlaubt)
    }

    async fn raum_zugriff(
        &self,
        user_id: &UserId,
        rolle: &Rolle,
        raum_id: &RoomId,
        raum_typ: RoomType,
        metadata: Option<&Value>,
    ) -> SignalingResult<bool> {
        if self.hat_vollzugriff(rolle) {
            return Ok(true);
        }

        if let Some(visit_id) = metadata.and_then(|m| m.get("visitId")).and_then(Value::as_str) {
            return self.besuch_zugriff(user_id, rolle, visit_id).await;
        }

        let id = raum_id.as_str();
        if let Some(rest) = id.strip_prefix("chat:") {
            return Ok(rest.split(':').any(|teil| teil == user_id.as_str()));
        }
        if let Some(rest) = id.strip_prefix("notifications:") {
            return Ok(rest == user_id.as_str());
        }
        if let Some(visit_id) = id.strip_prefix("call:").or_else(|| id.strip_prefix("visit:")) {
            return self.besuch_zugriff(user_id, rolle, visit_id).await;
        }

        // Benachrichtigungsraeume ohne bekanntes Praefix gehoeren niemandem
        if raum_typ == RoomType::Notification {
            tracing::debug!(user_id = %user_id, room_id = %raum_id, "Unbekannter Benachrichtigungsraum");
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn richtlinie() -> RollenZugriff {
        let r = RollenZugriff::neu(vec!["admin".into()]);
        r.besuch_registrieren(
            "v1",
            Besuch {
                patient: UserId::neu("p1"),
                behandler: UserId::neu("d1"),
            },
        );
        r
    }

    #[tokio::test]
    async fn beteiligte_haben_zugriff() {
        let r = richtlinie();
        let patient = Rolle::neu("patient");
        assert!(r.besuch_zugriff(&UserId::neu("p1"), &patient, "v1").await.unwrap());
        assert!(r
            .besuch_zugriff(&UserId::neu("d1"), &Rolle::neu("provider"), "v1")
            .await
            .unwrap());
        assert!(!r.besuch_zugriff(&UserId::neu("p2"), &patient, "v1").await.unwrap());
        assert!(!r.besuch_zugriff(&UserId::neu("p1"), &patient, "v2").await.unwrap());
    }

    async fn raum(r: &RollenZugriff, user: &str, raum: &str, typ: RoomType, meta: Option<Value>) -> bool {
        r.raum_zugriff(&UserId::neu(user), &Rolle::neu("patient"), &RoomId::neu(raum), typ, meta.as_ref())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fremde_duerfen_keinem_chat_beitreten() {
        let r = richtlinie();
        assert!(raum(&r, "u1", "chat:u1:u2", RoomType::Chat, None).await);
        assert!(raum(&r, "u2", "chat:u1:u2", RoomType::Chat, None).await);
        assert!(!raum(&r, "u3", "chat:u1:u2", RoomType::Chat, None).await);
        // Teilstring einer ID reicht nicht
        assert!(!raum(&r, "u", "chat:u1:u2", RoomType::Chat, None).await);
    }

    #[tokio::test]
    async fn benachrichtigungsraum_nur_fuer_eigentuemer() {
        let r = richtlinie();
        assert!(raum(&r, "x", "notifications:x", RoomType::Notification, None).await);
        assert!(!raum(&r, "u3", "notifications:x", RoomType::Notification, None).await);
        assert!(!raum(&r, "u3", "notifications:x", RoomType::Chat, None).await);
        assert!(!raum(&r, "u3", "irgendwas", RoomType::Notification, None).await);
    }

    #[tokio::test]
    async fn besuchsraeume_nur_fuer_beteiligte() {
        let r = richtlinie();
        assert!(raum(&r, "p1", "call:v1", RoomType::VideoCall, None).await);
        assert!(raum(&r, "d1", "visit:v1", RoomType::Chat, None).await);
        assert!(!raum(&r, "p2", "call:v1", RoomType::VideoCall, None).await);

        let meta = Some(serde_json::json!({ "visitId": "v1" }));
        assert!(raum(&r, "p1", "lobby", RoomType::Chat, meta.clone()).await);
        assert!(!raum(&r, "p2", "lobby", RoomType::Chat, meta).await);

        assert!(raum(&r, "p2", "topic:news", RoomType::Chat, None).await);
        assert!(r
            .raum_zugriff(
                &UserId::neu("root"),
                &Rolle::neu("admin"),
                &RoomId::neu("chat:u1:u2"),
                RoomType::Chat,
                None,
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn admin_hat_vollzugriff() {
        let r = richtlinie();
        assert!(r
            .besuch_zugriff(&UserId::neu("root"), &Rolle::neu("ADMIN"), "unbekannt")
            .await
            .unwrap());
    }
}
