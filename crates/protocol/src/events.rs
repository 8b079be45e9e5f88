//! Event-Namen des Protokolls

/// Vom Client gesendete Events
pub mod eingehend {
    pub const MESSAGE_SEND: &str = "message:send";
    pub const MESSAGE_RECEIVED: &str = "message:received";
    pub const MESSAGE_READ: &str = "message:read";
    pub const TYPING_START: &str = "typing:start";
    pub const TYPING_STOP: &str = "typing:stop";
    pub const MESSAGE_HISTORY: &str = "message:history";

    pub const CALL_INITIATE: &str = "call:initiate";
    pub const CALL_ACCEPT: &str = "call:accept";
    pub const CALL_REJECT: &str = "call:reject";
    pub const CALL_END: &str = "call:end";
    pub const CALL_SIGNAL: &str = "call:signal";
    pub const CALL_QUALITY: &str = "call:quality";

    pub const ROOM_JOIN: &str = "room:join";
    pub const ROOM_LEAVE: &str = "room:leave";
    pub const ROOM_PARTICIPANTS: &str = "room:participants";

    pub const PRESENCE_GET: &str = "presence:get";
    pub const PRESENCE_SET_STATUS: &str = "presence:setStatus";
    pub const PRESENCE_SUBSCRIBE: &str = "presence:subscribe";

    pub const NOTIFICATION_READ: &str = "notification:read";
    pub const NOTIFICATION_READ_ALL: &str = "notification:readAll";
    pub const NOTIFICATION_UNREAD_COUNT: &str = "notification:getUnreadCount";
    pub const NOTIFICATION_SUBSCRIBE: &str = "notification:subscribe";
    pub const NOTIFICATION_UNSUBSCRIBE: &str = "notification:unsubscribe";
}

/// Vom Server gesendete Events
pub mod ausgehend {
    /// Antwort auf ein Event mit `ack`-ID
    pub const ACK: &str = "ack";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECT: &str = "server:disconnect";
    pub const SERVER_SHUTDOWN: &str = "server:shutdown";
    pub const ERROR: &str = "error";

    pub const CALL_INCOMING: &str = "call:incoming";
    pub const CALL_ACCEPTED: &str = "call:accepted";
    pub const CALL_REJECTED: &str = "call:rejected";
    pub const CALL_ENDED: &str = "call:ended";
    pub const CALL_MISSED: &str = "call:missed";
    pub const CALL_SIGNAL: &str = "call:signal";
    pub const CALL_QUALITY_ISSUE: &str = "call:qualityIssue";

    pub const ROOM_USER_JOINED: &str = "room:userJoined";
    pub const ROOM_USER_LEFT: &str = "room:userLeft";

    pub const PRESENCE_CHANGED: &str = "presence:changed";
    pub const PRESENCE_STATUS_UPDATED: &str = "presence:statusUpdated";
    pub const PRESENCE_INITIAL: &str = "presence:initial";

    pub const MESSAGE_NEW: &str = "message:new";
    pub const MESSAGE_SENT: &str = "message:sent";
    pub const MESSAGE_DELIVERED: &str = "message:delivered";
    pub const MESSAGE_READ: &str = "message:read";
    pub const TYPING_START: &str = "typing:start";
    pub const TYPING_STOP: &str = "typing:stop";

    pub const NOTIFICATION_NEW: &str = "notification:new";
    pub const NOTIFICATION_SUBSCRIBED: &str = "notification:subscribed";
    pub const NOTIFICATION_UNSUBSCRIBED: &str = "notification:unsubscribed";
}
