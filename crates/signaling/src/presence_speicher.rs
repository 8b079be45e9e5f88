//! Presence-Speicher – Gemeinsamer Presence-Stand aller Prozesse
//!
//! Jeder Prozess spiegelt die Presence seiner eigenen Benutzer in den
//! Speicher. Abfragen (`presence:get`, `presence:initial`) lesen von dort
//! den Stand der Benutzer, die lokal nicht verbunden sind.
//!
//! ## Speicher
//! - [`SpeicherPresence`]: DashMap im Prozess, fuer Einzelbetrieb und Tests
//! - [`RedisPresence`]: ein Schluessel pro Benutzer mit TTL (SETEX/MGET)
//!
//! Eintraege verfallen nach [`PRESENCE_TTL`]. Der Tracker frischt die
//! Eintraege seiner online-Benutzer vorher auf.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vitalink_core::UserId;

use crate::error::{SignalingError, SignalingResult};
use crate::presence::PresenceInfo;

/// Lebensdauer eines Presence-Eintrags im Speicher
pub const PRESENCE_TTL: Duration = Duration::from_secs(300);

/// Schluessel-Praefix im Redis
pub const STANDARD_PRAEFIX: &str = "vitalink:presence";

/// Prozessuebergreifender Presence-Stand
#[async_trait]
pub trait PresenceSpeicher: Send + Sync {
    /// Schreibt den Stand eines Benutzers (ueberschreibt, setzt die TTL neu)
    async fn schreiben(&self, info: &PresenceInfo) -> SignalingResult<()>;

    /// Liest den Stand mehrerer Benutzer, `None` fuer unbekannte oder verfallene
    async fn lesen(&self, user_ids: &[UserId]) -> SignalingResult<Vec<Option<PresenceInfo>>>;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// SpeicherPresence
// ---------------------------------------------------------------------------

/// In-Memory-Speicher
///
/// Mehrere Tracker mit demselben SpeicherPresence verhalten sich wie
/// mehrere Prozesse an einem gemeinsamen Redis.
#[derive(Clone)]
pub struct SpeicherPresence {
    eintraege: Arc<DashMap<UserId, (PresenceInfo, Instant)>>,
    ttl: Duration,
}

impl SpeicherPresence {
    pub fn neu() -> Self {
        Self::mit_ttl(PRESENCE_TTL)
    }

    pub fn mit_ttl(ttl: Duration) -> Self {
        Self {
            eintraege: Arc::new(DashMap::new()),
            ttl,
        }
    }
}

impl Default for SpeicherPresence {
    fn default() -> Self {
        Self::neu()
    }
}

#[async_trait]
impl PresenceSpeicher for SpeicherPresence {
    async fn schreiben(&self, info: &PresenceInfo) -> SignalingResult<()> {
        self.eintraege
            .insert(info.user_id.clone(), (info.clone(), Instant::now() + self.ttl));
        Ok(())
    }

    async fn lesen(&self, user_ids: &[UserId]) -> SignalingResult<Vec<Option<PresenceInfo>>> {
        let jetzt = Instant::now();
        Ok(user_ids
            .iter()
            .map(|id| {
                self.eintraege
                    .get(id)
                    .filter(|e| e.1 > jetzt)
                    .map(|e| e.0.clone())
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "speicher"
    }
}

// ---------------------------------------------------------------------------
// RedisPresence
// ---------------------------------------------------------------------------

/// Redis-Speicher: `{praefix}:{userId}` → PresenceInfo als JSON
pub struct RedisPresence {
    verbindung: redis::aio::MultiplexedConnection,
    praefix: String,
}

impl RedisPresence {
    /// Oeffnet eine Verbindung zum Redis-Server
    pub async fn verbinden(url: &str, praefix: impl Into<String>) -> SignalingResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;
        let verbindung = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;

        Ok(Self {
            verbindung,
            praefix: praefix.into(),
        })
    }

    fn schluessel(&self, user_id: &UserId) -> String {
        format!("{}:{}", self.praefix, user_id)
    }
}

#[async_trait]
impl PresenceSpeicher for RedisPresence {
    async fn schreiben(&self, info: &PresenceInfo) -> SignalingResult<()> {
        let json = serde_json::to_string(info).map_err(|e| SignalingError::intern(e.to_string()))?;
        let mut verbindung = self.verbindung.clone();
        let _: () = verbindung
            .set_ex(self.schluessel(&info.user_id), json, PRESENCE_TTL.as_secs())
            .await
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;
        Ok(())
    }

    async fn lesen(&self, user_ids: &[UserId]) -> SignalingResult<Vec<Option<PresenceInfo>>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let schluessel: Vec<String> = user_ids.iter().map(|u| self.schluessel(u)).collect();
        let mut verbindung = self.verbindung.clone();
        let werte: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&schluessel)
            .query_async(&mut verbindung)
            .await
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;

        Ok(werte
            .into_iter()
            .map(|wert| {
                wert.and_then(|json| match serde_json::from_str(&json) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        tracing::warn!(fehler = %e, "Unlesbarer Presence-Eintrag");
                        None
                    }
                })
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitalink_protocol::PresenceStatus;

    fn info(user: &str, online: bool) -> PresenceInfo {
        PresenceInfo {
            user_id: UserId::neu(user),
            status: if online { PresenceStatus::Online } else { PresenceStatus::Offline },
            last_seen: Some(vitalink_core::jetzt()),
            custom_status: None,
            is_online: online,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn eintraege_verfallen_nach_ttl() {
        let speicher = SpeicherPresence::neu();
        speicher.schreiben(&info("u1", true)).await.unwrap();

        let stand = speicher.lesen(&[UserId::neu("u1"), UserId::neu("u2")]).await.unwrap();
        assert!(stand[0].as_ref().unwrap().is_online);
        assert!(stand[1].is_none());

        tokio::time::advance(PRESENCE_TTL + Duration::from_secs(1)).await;
        assert!(speicher.lesen(&[UserId::neu("u1")]).await.unwrap()[0].is_none());
    }

    #[test]
    fn presence_info_ueberlebt_json() {
        let original = info("u1", false);
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"isOnline\":false"));
        let zurueck: PresenceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck, original);
    }
}
