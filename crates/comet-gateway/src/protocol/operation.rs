//! Reserved operation codes
//!
//! Codes below [`Operation::MAX_RESERVED`] are interpreted by the gateway
//! itself; everything else belongs to the business handler.

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Operation {
    Handshake = 0,
    HandshakeReply = 1,
    /// Keep-alive from the client, answered in place
    Heartbeat = 2,
    HeartbeatReply = 3,
    SendMsg = 4,
    SendMsgReply = 5,
    DisconnectReply = 6,
    /// First frame of every connection
    Auth = 7,
    AuthReply = 8,
    /// Server push whose body is already an encoded frame batch
    Raw = 9,
    ProtoReady = 10,
    ProtoFinish = 11,
    /// Move the connection to another room; body is the room id
    ChangeRoom = 12,
    ChangeRoomReply = 13,
    /// Subscribe to operations; body is a comma separated op list
    Sub = 14,
    SubReply = 15,
    Unsub = 16,
    UnsubReply = 17,
}

impl Operation {
    /// Highest reserved code
    pub const MAX_RESERVED: i32 = 17;

    /// Create an `Operation` from a raw wire value
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        let op = match value {
            0 => Self::Handshake,
            1 => Self::HandshakeReply,
            2 => Self::Heartbeat,
            3 => Self::HeartbeatReply,
            4 => Self::SendMsg,
            5 => Self::SendMsgReply,
            6 => Self::DisconnectReply,
            7 => Self::Auth,
            8 => Self::AuthReply,
            9 => Self::Raw,
            10 => Self::ProtoReady,
            11 => Self::ProtoFinish,
            12 => Self::ChangeRoom,
            13 => Self::ChangeRoomReply,
            14 => Self::Sub,
            15 => Self::SubReply,
            16 => Self::Unsub,
            17 => Self::UnsubReply,
            _ => return None,
        };
        Some(op)
    }

    /// Raw wire value
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether a raw code is owned by the gateway
    #[must_use]
    pub const fn is_reserved(value: i32) -> bool {
        value >= 0 && value <= Self::MAX_RESERVED
    }

    /// Reply code for a request code handled by the gateway
    #[must_use]
    pub const fn reply(self) -> Option<Self> {
        match self {
            Self::Handshake => Some(Self::HandshakeReply),
            Self::Heartbeat => Some(Self::HeartbeatReply),
            Self::SendMsg => Some(Self::SendMsgReply),
            Self::Auth => Some(Self::AuthReply),
            Self::ChangeRoom => Some(Self::ChangeRoomReply),
            Self::Sub => Some(Self::SubReply),
            Self::Unsub => Some(Self::UnsubReply),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Handshake => "Handshake",
            Self::HandshakeReply => "HandshakeReply",
            Self::Heartbeat => "Heartbeat",
            Self::HeartbeatReply => "HeartbeatReply",
            Self::SendMsg => "SendMsg",
            Self::SendMsgReply => "SendMsgReply",
            Self::DisconnectReply => "DisconnectReply",
            Self::Auth => "Auth",
            Self::AuthReply => "AuthReply",
            Self::Raw => "Raw",
            Self::ProtoReady => "ProtoReady",
            Self::ProtoFinish => "ProtoFinish",
            Self::ChangeRoom => "ChangeRoom",
            Self::ChangeRoomReply => "ChangeRoomReply",
            Self::Sub => "Sub",
            Self::SubReply => "SubReply",
            Self::Unsub => "Unsub",
            Self::UnsubReply => "UnsubReply",
        }
    }
}

impl From<Operation> for i32 {
    fn from(op: Operation) -> Self {
        op.as_i32()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}
