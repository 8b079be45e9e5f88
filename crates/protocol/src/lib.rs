//! vitalink-protocol – Event-Protokoll-Definitionen
//!
//! Dieses Crate definiert das JSON-Event-Format, das zwischen Client und
//! Server ueber die WebSocket-Verbindung ausgetauscht wird.
//!
//! ## Frames
//! ```text
//! Client -> Server: {"event": "call:initiate", "data": {...}, "ack": 7}
//! Server -> Client: {"event": "call:incoming", "data": {...}}
//! Server -> Client: {"event": "ack", "ack": 7, "data": {"success": true, ...}}
//! ```

pub mod ack;
pub mod error;
pub mod events;
pub mod frame;
pub mod payload;

pub use error::{ErrorCode, ProtokollFehler};
pub use frame::{ClientFrame, ServerEvent};
pub use payload::{
    CallStatus, CallType, ClientPayload, PresenceStatus, Prioritaet, RoomType, SignalType,
};
