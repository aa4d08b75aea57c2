use std::fmt;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched (receive)
    Dispatch = 0,
    /// Keep-alive, sent by either side
    Heartbeat = 1,
    /// Start a new session (send)
    Identify = 2,
    /// Update the client's presence (send)
    PresenceUpdate = 3,
    /// Join, move or leave a voice channel (send)
    VoiceStateUpdate = 4,
    /// Resume a previous session (send)
    Resume = 6,
    /// Remote asks the client to reconnect and resume (receive)
    Reconnect = 7,
    /// Request guild member chunks (send)
    RequestGuildMembers = 8,
    /// Session is invalid; `d` says whether it can be resumed (receive)
    InvalidSession = 9,
    /// First frame after connecting, carries the heartbeat interval (receive)
    Hello = 10,
    /// Acknowledges a heartbeat (receive)
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Opcodes a client is allowed to send.
    pub fn is_sendable(self) -> bool {
        matches!(
            self,
            Self::Heartbeat
                | Self::Identify
                | Self::PresenceUpdate
                | Self::VoiceStateUpdate
                | Self::Resume
                | Self::RequestGuildMembers
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}
