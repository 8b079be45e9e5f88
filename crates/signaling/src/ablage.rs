//! Datenablage – Schnittstelle zum externen Speicher
//!
//! Der Kern speichert Anrufprotokolle, Besuchsnachrichten und
//! Benachrichtigungen nicht selbst, sondern ueber [`Datenablage`].
//! [`SpeicherAblage`] haelt alles im Prozess und dient als Standard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use vitalink_core::{jetzt, Rolle, UserId};
use vitalink_protocol::Prioritaet;

use crate::calls::Anruf;
use crate::error::SignalingResult;

// ---------------------------------------------------------------------------
// Datensaetze
// ---------------------------------------------------------------------------

/// Gespeicherte Nachricht eines Besuchs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GespeicherteNachricht {
    pub id: String,
    pub sender_id: UserId,
    #[serde(skip)]
    pub sender_role: Rolle,
    pub visit_id: String,
    pub message: String,
    pub attachments: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Benachrichtigung eines Benutzers
#[derive(Debug, Clone, PartialEq)]
pub struct Benachrichtigung {
    pub id: String,
    pub user_id: UserId,
    /// Freier Typ, z.B. `appointment_reminder` oder `call_missed`
    pub typ: String,
    pub prioritaet: Prioritaet,
    pub titel: String,
    pub text: String,
    pub daten: Option<Value>,
    pub gelesen: bool,
    pub erstellt: DateTime<Utc>,
    pub gelesen_am: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Externer Datenspeicher
#[async_trait]
pub trait Datenablage: Send + Sync {
    /// Speichert das Protokoll eines abgeschlossenen Anrufs
    async fn anruf_speichern(&self, anruf: Anruf) -> SignalingResult<()>;

    async fn nachricht_speichern(&self, nachricht: GespeicherteNachricht) -> SignalingResult<()>;

    /// Nachrichten eines Besuchs, neueste zuerst, hoechstens `limit`
    async fn verlauf(
        &self,
        visit_id: &str,
        limit: usize,
        vor: Option<DateTime<Utc>>,
    ) -> SignalingResult<Vec<GespeicherteNachricht>>;

    async fn benachrichtigung_speichern(&self, benachrichtigung: Benachrichtigung) -> SignalingResult<()>;

    /// Markiert eine Benachrichtigung als gelesen
    ///
    /// Gibt false zurueck, wenn der Benutzer keine solche Benachrichtigung hat.
    async fn benachrichtigung_gelesen(&self, user_id: &UserId, id: &str) -> SignalingResult<bool>;

    /// Markiert alle Benachrichtigungen als gelesen und gibt die Anzahl zurueck
    async fn alle_gelesen(&self, user_id: &UserId) -> SignalingResult<usize>;

    async fn ungelesen_anzahl(&self, user_id: &UserId) -> SignalingResult<usize>;
}

// ---------------------------------------------------------------------------
// SpeicherAblage
// ---------------------------------------------------------------------------

/// In-Memory-Ablage
///
/// Clone teilt den inneren Zustand.
#[derive(Clone, Default)]
pub struct SpeicherAblage {
    anrufe: Arc<Mutex<Vec<Anruf>>>,
    nachrichten: Arc<DashMap<String, Vec<GespeicherteNachricht>>>,
    benachrichtigungen: Arc<DashMap<UserId, Vec<Benachrichtigung>>>,
}

impl SpeicherAblage {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Alle gespeicherten Anrufprotokolle
    pub fn anrufe(&self) -> Vec<Anruf> {
        self.anrufe.lock().clone()
    }

    /// Alle Benachrichtigungen eines Benutzers
    pub fn benachrichtigungen_von(&self, user_id: &UserId) -> Vec<Benachrichtigung> {
        self.benachrichtigungen
            .get(user_id)
            .map(|b| b.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Datenablage for SpeicherAblage {
    async fn anruf_speichern(&self, anruf: Anruf) -> SignalingResult<()> {
        tracing::debug!(call_id = %anruf.call_id, status = %anruf.status, "Anrufprotokoll gespeichert");
        self.anrufe.lock().push(anruf);
        Ok(())
    }

    async fn nachricht_speichern(&self, nachricht: GespeicherteNachricht) -> SignalingResult<()> {
        self.nachrichten
            .entry(nachricht.visit_id.clone())
            .or_default()
            .push(nachricht);
        Ok(())
    }

    async fn verlauf(
        &self,
        visit_id: &str,
        limit: usize,
        vor: Option<DateTime<Utc>>,
    ) -> SignalingResult<Vec<GespeicherteNachricht>> {
        let Some(nachrichten) = self.nachrichten.get(visit_id) else {
            return Ok(Vec::new());
        };

        let mut treffer: Vec<GespeicherteNachricht> = nachrichten
            .iter()
            .filter(|n| vor.map_or(true, |grenze| n.timestamp < grenze))
            .cloned()
            .collect();
        treffer.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        treffer.truncate(limit);
        Ok(treffer)
    }

    async fn benachrichtigung_speichern(&self, benachrichtigung: Benachrichtigung) -> SignalingResult<()> {
        self.benachrichtigungen
            .entry(benachrichtigung.user_id.clone())
            .or_default()
            .push(benachrichtigung);
        Ok(())
    }

    async fn benachrichtigung_gelesen(&self, user_id: &UserId, id: &str) -> SignalingResult<bool> {
        let Some(mut liste) = self.benachrichtigungen.get_mut(user_id) else {
            return Ok(false);
        };
        match liste.iter_mut().find(|b| b.id == id) {
            Some(b) => {
                if !b.gelesen {
                    b.gelesen = true;
                    b.gelesen_am = Some(jetzt());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn alle_gelesen(&self, user_id: &UserId) -> SignalingResult<usize> {
        let Some(mut liste) = self.benachrichtigungen.get_mut(user_id) else {
            return Ok(0);
        };
        let zeit = jetzt();
        let mut markiert = 0;
        for b in liste.iter_mut().filter(|b| !b.gelesen) {
            b.gelesen = true;
            b.gelesen_am = Some(zeit);
            markiert += 1;
        }
        Ok(markiert)
    }

    async fn ungelesen_anzahl(&self, user_id: &UserId) -> SignalingResult<usize> {
        Ok(self
            .benachrichtigungen
            .get(user_id)
            .map(|liste| liste.iter().filter(|b| !b.gelesen).count())
            .unwrap_or(0))
    }
}
