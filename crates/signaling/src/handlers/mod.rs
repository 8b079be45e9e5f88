//! Handler fuer alle Client-Events
//!
//! Jeder Handler ist fuer eine Event-Gruppe zustaendig und hat Zugriff auf
//! den gemeinsamen SignalingState. Handler mit Antwort liefern die Felder
//! des Erfolgs-Acks, der Dispatcher baut daraus den Frame.

pub mod call_handler;
pub mod message_handler;
pub mod notification_handler;
pub mod presence_handler;
pub mod room_handler;
