//! vitalink-signaling – Echtzeit-Kern
//!
//! Dieser Crate verwaltet die WebSocket-Verbindungen von Patienten und
//! Behandlern: Presence, Raeume, Chat-Relay, Benachrichtigungen und die
//! Anruf-Zustandsmaschine fuer WebRTC-Signaling. Ueber einen Pub/Sub-Broker
//! erreichen Events auch Verbindungen anderer Prozesse.
//!
//! ## Architektur
//!
//! ```text
//! /ws (Auth-Gate im Handshake)
//!     |
//!     v
//! ClientConnection (pro Verbindung ein Task)
//!     |
//!     v
//! MessageDispatcher
//!     |
//!     +-- CallHandler         (Initiate, Accept, Reject, End, Signal, Quality)
//!     +-- MessageHandler      (Send, Received, Read, Typing, History)
//!     +-- RoomHandler         (Join, Leave, Participants)
//!     +-- PresenceHandler     (Get, SetStatus, Subscribe)
//!     +-- NotificationHandler (Read, ReadAll, UnreadCount, Topics)
//!
//! Registry    – lebende Verbindungen und ihre Send-Queues
//! Verteiler   – lokale Zustellung und Cluster-Fan-out ueber den Broker
//! AnrufEngine – Anrufe, Timer und Grabsteine
//! ```

pub mod ablage;
pub mod benachrichtigung;
pub mod calls;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod presence;
pub mod presence_speicher;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod server_state;
pub mod ws;
pub mod zugriff;

// Bequeme Re-Exporte
pub use ablage::{Datenablage, SpeicherAblage};
pub use benachrichtigung::{BenachrichtigungsDienst, NeueBenachrichtigung};
pub use calls::{AnrufEngine, AnrufZeiten};
pub use connection::ClientConnection;
pub use dispatcher::MessageDispatcher;
pub use error::{SignalingError, SignalingResult};
pub use fanout::{Broker, RedisBroker, SpeicherBroker, Verteiler};
pub use presence::PresenceTracker;
pub use presence_speicher::{PresenceSpeicher, RedisPresence, SpeicherPresence};
pub use registry::Registry;
pub use rooms::RaumManager;
pub use server_state::{SignalingConfig, SignalingState};
pub use ws::ws_router;
pub use zugriff::{Besuch, RollenZugriff, ZugriffsRichtlinie};
