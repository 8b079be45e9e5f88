//! Fan-out – Zustellung an Benutzer, Raeume und Abonnenten im ganzen Cluster
//!
//! Jeder Prozess stellt ein Event zuerst an seine eigenen Verbindungen zu
//! und veroeffentlicht es danach als [`ClusterEvent`] auf dem Broker-Kanal.
//! Die anderen Prozesse empfangen es und stellen es lokal zu. Das eigene
//! Echo wird an der `herkunft` erkannt und verworfen.
//!
//! ## Broker
//! - [`SpeicherBroker`]: broadcast-Kanaele im Prozess, fuer Einzelbetrieb und Tests
//! - [`RedisBroker`]: Redis PUBLISH/SUBSCRIBE mit automatischem Wiederverbinden
//!
//! Ohne erreichbaren Broker laeuft der Prozess rein lokal weiter.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use vitalink_core::{jetzt, ClusterEvent, ConnectionId, RoomId, UserId, Ziel};
use vitalink_protocol::events::ausgehend;
use vitalink_protocol::ServerEvent;

use crate::error::{SignalingError, SignalingResult};
use crate::presence::PresenceTracker;
use crate::registry::Registry;
use crate::rooms::RaumManager;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Puffer fuer ausgehende Cluster-Events
const AUSGANG_PUFFER: usize = 1024;

/// Puffer pro Kanal im SpeicherBroker
const SPEICHER_PUFFER: usize = 1024;

/// Wartezeit vor dem ersten Wiederverbindungsversuch
const MIN_BACKOFF: Duration = Duration::from_millis(500);

/// Maximale Wartezeit zwischen zwei Wiederverbindungsversuchen
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Broker-Trait
// ---------------------------------------------------------------------------

/// Callback fuer eingehende Broker-Nachrichten
pub type NachrichtenHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Pub/Sub-Backend fuer den prozessuebergreifenden Fan-out
#[async_trait]
pub trait Broker: Send + Sync {
    /// Veroeffentlicht eine Nachricht auf einem Kanal
    async fn veroeffentlichen(&self, kanal: &str, nutzlast: Vec<u8>) -> SignalingResult<()>;

    /// Abonniert einen Kanal
    ///
    /// Startet einen Hintergrund-Task, der fuer jede Nachricht `handler`
    /// aufruft. Schlaegt fehl, wenn schon das erste Abonnement scheitert.
    async fn abonnieren(&self, kanal: &str, handler: NachrichtenHandler) -> SignalingResult<()>;

    /// Gibt true zurueck solange das Abonnement lebt
    fn verbunden(&self) -> bool;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// SpeicherBroker
// ---------------------------------------------------------------------------

/// In-Memory-Broker auf Basis von `tokio::sync::broadcast`
///
/// Mehrere `Verteiler` mit demselben SpeicherBroker verhalten sich wie
/// mehrere Prozesse an einem gemeinsamen Redis.
#[derive(Clone, Default)]
pub struct SpeicherBroker {
    kanaele: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl SpeicherBroker {
    pub fn neu() -> Self {
        Self::default()
    }

    fn kanal(&self, name: &str) -> broadcast::Sender<Vec<u8>> {
        self.kanaele
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(SPEICHER_PUFFER).0)
            .clone()
    }
}

#[async_trait]
impl Broker for SpeicherBroker {
    async fn veroeffentlichen(&self, kanal: &str, nutzlast: Vec<u8>) -> SignalingResult<()> {
        // Err nur ohne Empfaenger
        let _ = self.kanal(kanal).send(nutzlast);
        Ok(())
    }

    async fn abonnieren(&self, kanal: &str, handler: NachrichtenHandler) -> SignalingResult<()> {
        let mut rx = self.kanal(kanal).subscribe();
        let kanal = kanal.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(nutzlast) => handler(nutzlast),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(kanal = %kanal, verloren = n, "Broker-Empfaenger hinkt hinterher");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    fn verbunden(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "speicher"
    }
}

// ---------------------------------------------------------------------------
// RedisBroker
// ---------------------------------------------------------------------------

/// Redis-Broker ueber PUBLISH/SUBSCRIBE
pub struct RedisBroker {
    client: redis::Client,
    verbindung: redis::aio::MultiplexedConnection,
    verbunden: Arc<AtomicBool>,
}

impl RedisBroker {
    /// Oeffnet eine Verbindung zum Redis-Server
    pub async fn verbinden(url: &str) -> SignalingResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;
        let verbindung = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;

        tracing::info!("Redis-Broker verbunden");

        Ok(Self {
            client,
            verbindung,
            verbunden: Arc::new(AtomicBool::new(true)),
        })
    }
}

async fn redis_abonnieren(client: &redis::Client, kanal: &str) -> redis::RedisResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(kanal).await?;
    Ok(pubsub)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn veroeffentlichen(&self, kanal: &str, nutzlast: Vec<u8>) -> SignalingResult<()> {
        let mut verbindung = self.verbindung.clone();
        let _: i64 = verbindung
            .publish(kanal, nutzlast)
            .await
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;
        Ok(())
    }

    async fn abonnieren(&self, kanal: &str, handler: NachrichtenHandler) -> SignalingResult<()> {
        let erstes = redis_abonnieren(&self.client, kanal)
            .await
            .map_err(|e| SignalingError::BrokerNichtVerfuegbar(e.to_string()))?;
        self.verbunden.store(true, Ordering::Relaxed);

        let client = self.client.clone();
        let kanal = kanal.to_string();
        let verbunden = self.verbunden.clone();

        tokio::spawn(async move {
            let mut naechstes = Some(erstes);
            let mut wartezeit = MIN_BACKOFF;

            loop {
                let pubsub = match naechstes.take() {
                    Some(p) => p,
                    None => match redis_abonnieren(&client, &kanal).await {
                        Ok(p) => {
                            tracing::info!(kanal = %kanal, "Redis-Abonnement wiederhergestellt");
                            verbunden.store(true, Ordering::Relaxed);
                            wartezeit = MIN_BACKOFF;
                            p
                        }
                        Err(e) => {
                            tracing::warn!(
                                kanal = %kanal,
                                fehler = %e,
                                wartezeit_ms = wartezeit.as_millis() as u64,
                                "Redis nicht erreichbar – neuer Versuch"
                            );
                            tokio::time::sleep(wartezeit).await;
                            wartezeit = (wartezeit * 2).min(MAX_BACKOFF);
                            continue;
                        }
                    },
                };

                let mut nachrichten = std::pin::pin!(pubsub.into_on_message());
                while let Some(nachricht) = nachrichten.next().await {
                    match nachricht.get_payload::<Vec<u8>>() {
                        Ok(nutzlast) => handler(nutzlast),
                        Err(e) => tracing::warn!(fehler = %e, "Unlesbare Redis-Nachricht"),
                    }
                }

                verbunden.store(false, Ordering::Relaxed);
                tracing::warn!(kanal = %kanal, "Redis-Abonnement unterbrochen");
            }
        });

        Ok(())
    }

    fn verbunden(&self) -> bool {
        self.verbunden.load(Ordering::Relaxed)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ---------------------------------------------------------------------------
// Verteiler
// ---------------------------------------------------------------------------

/// Stellt Events lokal zu und spiegelt sie ueber den Broker
///
/// Alle Methoden sind nicht-blockierend und duerfen unter Locks aufgerufen
/// werden. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct Verteiler {
    inner: Arc<VerteilerInner>,
}

struct VerteilerInner {
    node_id: String,
    registry: Registry,
    raeume: RaumManager,
    presence: PresenceTracker,
    broker: OnceLock<Arc<dyn Broker>>,
    ausgang: OnceLock<mpsc::Sender<Vec<u8>>>,
    veroeffentlicht: AtomicU64,
    empfangen: AtomicU64,
}

impl Verteiler {
    pub fn neu(
        node_id: impl Into<String>,
        registry: Registry,
        raeume: RaumManager,
        presence: PresenceTracker,
    ) -> Self {
        Self {
            inner: Arc::new(VerteilerInner {
                node_id: node_id.into(),
                registry,
                raeume,
                presence,
                broker: OnceLock::new(),
                ausgang: OnceLock::new(),
                veroeffentlicht: AtomicU64::new(0),
                empfangen: AtomicU64::new(0),
            }),
        }
    }

    /// Verbindet den Verteiler mit einem Broker
    ///
    /// Abonniert `kanal` und startet den Task, der ausgehende Events
    /// veroeffentlicht. Kann nur einmal aufgerufen werden.
    pub async fn broker_verbinden(&self, broker: Arc<dyn Broker>, kanal: &str) -> SignalingResult<()> {
        if self.inner.broker.get().is_some() {
            return Err(SignalingError::intern("Broker bereits verbunden"));
        }

        let schwach: Weak<VerteilerInner> = Arc::downgrade(&self.inner);
        let handler: NachrichtenHandler = Arc::new(move |nutzlast: Vec<u8>| {
            if let Some(inner) = schwach.upgrade() {
                Verteiler { inner }.eingang(&nutzlast);
            }
        });
        broker.abonnieren(kanal, handler).await?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(AUSGANG_PUFFER);
        let sender_broker = broker.clone();
        let sender_kanal = kanal.to_string();
        tokio::spawn(async move {
            while let Some(nutzlast) = rx.recv().await {
                if let Err(e) = sender_broker.veroeffentlichen(&sender_kanal, nutzlast).await {
                    tracing::warn!(fehler = %e, "Cluster-Event nicht veroeffentlicht");
                }
            }
        });

        let name = broker.name();
        let _ = self.inner.broker.set(broker);
        let _ = self.inner.ausgang.set(tx);

        tracing::info!(broker = name, kanal = %kanal, node_id = %self.inner.node_id, "Fan-out aktiv");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Zustellung
    // -----------------------------------------------------------------------

    /// Sendet ein Event nur an eine lokale Verbindung
    pub fn an_verbindung(&self, connection_id: &ConnectionId, event: &str, daten: Value) -> bool {
        self.inner
            .registry
            .an_verbindung(connection_id, ServerEvent::neu(event, daten))
    }

    /// Sendet ein Event an alle Verbindungen eines Benutzers im Cluster
    pub fn an_user(&self, user_id: &UserId, event: &str, daten: Value) {
        self.verteilen(
            Ziel::User {
                user_id: user_id.clone(),
            },
            event,
            daten,
        );
    }

    /// Sendet ein Event an alle Mitglieder eines Raums, optional ohne eine Verbindung
    pub fn an_raum(&self, raum_id: &RoomId, event: &str, daten: Value, ausser: Option<ConnectionId>) {
        self.verteilen(
            Ziel::Raum {
                raum_id: raum_id.clone(),
                ausser,
            },
            event,
            daten,
        );
    }

    /// Sendet ein Event an alle Presence-Abonnenten eines Benutzers
    pub fn an_abonnenten(&self, user_id: &UserId, event: &str, daten: Value) {
        self.verteilen(
            Ziel::Abonnenten {
                user_id: user_id.clone(),
            },
            event,
            daten,
        );
    }

    /// Sendet ein Event an jede Verbindung im Cluster
    pub fn an_alle(&self, event: &str, daten: Value) {
        self.verteilen(Ziel::Alle, event, daten);
    }

    /// Trennt alle Verbindungen eines Benutzers im Cluster
    ///
    /// Gibt die Anzahl der lokal getrennten Verbindungen zurueck.
    pub fn benutzer_trennen(&self, user_id: &UserId, grund: &str) -> usize {
        let ziel = Ziel::Trennen {
            user_id: user_id.clone(),
            grund: grund.to_string(),
        };
        let lokal = self.lokal_zustellen(&ziel, ausgehend::DISCONNECT, Value::Null);
        self.veroeffentlichen(ziel, ausgehend::DISCONNECT, Value::Null);
        lokal
    }

    fn verteilen(&self, ziel: Ziel, event: &str, daten: Value) {
        self.lokal_zustellen(&ziel, event, daten.clone());
        self.veroeffentlichen(ziel, event, daten);
    }

    fn lokal_zustellen(&self, ziel: &Ziel, event: &str, daten: Value) -> usize {
        let inner = &self.inner;
        let nachricht = ServerEvent::neu(event, daten);

        let an_liste = |ids: Vec<ConnectionId>| {
            ids.iter()
                .filter(|id| inner.registry.an_verbindung(id, nachricht.clone()))
                .count()
        };

        match ziel {
            Ziel::User { user_id } => inner.registry.an_user(user_id, &nachricht),
            Ziel::Raum { raum_id, ausser } => {
                let mut ids = inner.raeume.verbindungen_in(raum_id);
                if let Some(ausser) = ausser {
                    ids.retain(|id| id != ausser);
                }
                an_liste(ids)
            }
            Ziel::Abonnenten { user_id } => an_liste(inner.presence.abonnenten_von(user_id)),
            Ziel::Alle => inner.registry.an_alle(&nachricht),
            Ziel::Trennen { user_id, grund } => {
                let ids = inner.registry.verbindungen_von(user_id);
                let hinweis = ServerEvent::neu(
                    ausgehend::DISCONNECT,
                    json!({ "reason": grund, "timestamp": jetzt() }),
                );
                for id in &ids {
                    inner.registry.an_verbindung(id, hinweis.clone());
                    inner.registry.abbrechen(id);
                }
                if !ids.is_empty() {
                    tracing::info!(user_id = %user_id, verbindungen = ids.len(), grund = %grund, "Benutzer getrennt");
                }
                ids.len()
            }
        }
    }

    fn veroeffentlichen(&self, ziel: Ziel, event: &str, daten: Value) {
        let Some(ausgang) = self.inner.ausgang.get() else {
            return;
        };

        let bytes = match ClusterEvent::neu(self.inner.node_id.clone(), ziel, event, daten).zu_bytes() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(fehler = %e, event = %event, "Cluster-Event nicht serialisierbar");
                return;
            }
        };

        match ausgang.try_send(bytes) {
            Ok(()) => {
                self.inner.veroeffentlicht.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(event = %event, "Fan-out-Puffer voll – Cluster-Event verworfen");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(event = %event, "Fan-out-Task beendet");
            }
        }
    }

    /// Verarbeitet eine Nachricht vom Broker
    fn eingang(&self, nutzlast: &[u8]) {
        let event = match ClusterEvent::aus_bytes(nutzlast) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(fehler = %e, "Ungueltiges Cluster-Event verworfen");
                return;
            }
        };

        if event.herkunft == self.inner.node_id {
            return;
        }

        self.inner.empfangen.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(herkunft = %event.herkunft, event = %event.event, "Cluster-Event empfangen");
        self.lokal_zustellen(&event.ziel, &event.event, event.daten);
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Gibt true zurueck wenn ein Broker konfiguriert wurde
    pub fn broker_konfiguriert(&self) -> bool {
        self.inner.broker.get().is_some()
    }

    /// Gibt true zurueck wenn der Broker erreichbar ist
    pub fn broker_aktiv(&self) -> bool {
        self.inner
            .broker
            .get()
            .map(|b| b.verbunden())
            .unwrap_or(false)
    }

    /// Anzahl der veroeffentlichten Cluster-Events
    pub fn veroeffentlicht(&self) -> u64 {
        self.inner.veroeffentlicht.load(Ordering::Relaxed)
    }

    /// Anzahl der empfangenen fremden Cluster-Events
    pub fn empfangen(&self) -> u64 {
        self.inner.empfangen.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
