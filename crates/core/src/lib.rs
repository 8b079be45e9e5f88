//! vitalink-core – Gemeinsame Typen, Cluster-Events und Fehlertypen
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen Vitalink-Crates gemeinsam genutzt werden.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{CoreError, CoreResult};
pub use event::{ClusterEvent, Ziel};
pub use types::{jetzt, CallId, ConnectionId, Rolle, RoomId, UserId};
