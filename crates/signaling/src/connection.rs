//! Client-Connection – Verwaltet eine einzelne WebSocket-Sitzung
//!
//! Jede Sitzung laeuft in einem eigenen tokio-Task. Die Schleife liest
//! Frames vom Client, schreibt Events aus der Send-Queue und sendet
//! periodisch Pings.
//!
//! ## Ende einer Sitzung
//! - Client schliesst oder Lesefehler
//! - Abbruch-Token (Admin-Trennung, Leerlauf): Queue wird vorher geleert
//! - Shutdown-Signal
//!
//! In jedem Fall laeuft danach die Trenn-Kaskade des [`SignalingState`].

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::Instrument;
use vitalink_core::ConnectionId;
use vitalink_protocol::{ClientFrame, ErrorCode, ServerEvent};

use crate::dispatcher::{fehler_event, MessageDispatcher};
use crate::registry::VerbindungsHandle;
use crate::server_state::SignalingState;

/// Verarbeitet eine einzelne WebSocket-Verbindung
pub struct ClientConnection {
    state: Arc<SignalingState>,
    dispatcher: MessageDispatcher,
}

impl ClientConnection {
    /// Erstellt eine neue ClientConnection
    pub fn neu(state: Arc<SignalingState>) -> Self {
        let dispatcher = MessageDispatcher::neu(Arc::clone(&state));
        Self { state, dispatcher }
    }

    /// Startet die Verbindungs-Verarbeitungsschleife
    ///
    /// Laeuft bis die Verbindung getrennt wird oder ein Shutdown-Signal
    /// eingeht.
    pub async fn verarbeiten(self, socket: WebSocket, handle: VerbindungsHandle) {
        let Some(info) = self.state.registry.info(&handle.connection_id) else {
            tracing::warn!(connection_id = %handle.connection_id, "Sitzung ohne Registrierung");
            return;
        };
        let span = tracing::info_span!(
            "verbindung",
            connection_id = %info.connection_id,
            user_id = %info.user_id
        );
        let (sender, empfaenger) = socket.split();
        self.sitzung(sender, empfaenger, handle).instrument(span).await;
    }

    /// Sitzungsschleife ueber einer beliebigen Frame-Quelle und -Senke
    pub async fn sitzung<W, R, E>(self, mut socket: W, mut eingang: R, handle: VerbindungsHandle)
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let VerbindungsHandle {
            connection_id,
            mut rx,
            abbruch,
        } = handle;
        let ping_intervall = self.state.config.ping_intervall;
        let mut ping = interval_at(Instant::now() + ping_intervall, ping_intervall);
        let mut shutdown_rx = self.state.shutdown_empfaenger();

        let grund = loop {
            tokio::select! {
                // Eingehende Nachricht vom Client
                nachricht = eingang.next() => match nachricht {
                    Some(Ok(Message::Text(text))) => {
                        self.state.registry.beruehren(&connection_id);
                        if let Some(antwort) = self.frame_verarbeiten(&connection_id, &text).await {
                            if senden(&mut socket, &antwort).await.is_err() {
                                break "Sendefehler";
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        self.state.registry.beruehren(&connection_id);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let fehler = fehler_event("", ErrorCode::InvalidRequest, "Binary frames are not supported");
                        if senden(&mut socket, &fehler).await.is_err() {
                            break "Sendefehler";
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "Client getrennt",
                    Some(Err(e)) => {
                        tracing::warn!(fehler = %e, "WebSocket-Lesefehler");
                        break "Lesefehler";
                    }
                },

                // Ausgehende Events aus der Send-Queue
                Some(event) = rx.recv() => {
                    if senden(&mut socket, &event).await.is_err() {
                        break "Sendefehler";
                    }
                }

                // Admin-Trennung oder Leerlauf
                _ = abbruch.cancelled() => {
                    queue_leeren(&mut socket, &mut rx).await;
                    break "Abgebrochen";
                }

                // Keepalive-Ping
                _ = ping.tick() => {
                    if let Err(e) = socket.send(Message::Ping(Vec::new())).await {
                        tracing::debug!(fehler = %e, "Ping-Senden fehlgeschlagen");
                        break "Sendefehler";
                    }
                }

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        queue_leeren(&mut socket, &mut rx).await;
                        break "Shutdown";
                    }
                }
            }
        };

        let _ = socket.send(Message::Close(None)).await;
        self.state.verbindung_trennen(&connection_id, grund).await;
        tracing::debug!(grund, "Verbindungs-Task beendet");
    }

    async fn frame_verarbeiten(&self, connection_id: &ConnectionId, text: &str) -> Option<ServerEvent> {
        let frame = match ClientFrame::parsen(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(fehler = %e, "Frame verworfen");
                return Some(fehler_event("", ErrorCode::InvalidRequest, "Malformed frame"));
            }
        };

        // Verbindung kann parallel getrennt worden sein
        let info = self.state.registry.info(connection_id)?;
        tracing::trace!(event = %frame.event, ack = ?frame.ack, "Event empfangen");
        self.dispatcher.dispatch(&info, frame).await
    }
}

async fn senden<W>(socket: &mut W, event: &ServerEvent) -> Result<(), W::Error>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let text = match event.to_json() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(event = %event.event, fehler = %e, "Event nicht serialisierbar");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await.map_err(|e| {
        tracing::warn!(fehler = %e, "Senden fehlgeschlagen");
        e
    })
}

/// Schickt alle noch wartenden Events, z.B. `server:disconnect`
async fn queue_leeren<W>(socket: &mut W, rx: &mut mpsc::Receiver<ServerEvent>)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Ok(event) = rx.try_recv() {
        if senden(socket, &event).await.is_err() {
            break;
        }
    }
}
