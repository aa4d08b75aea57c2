use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Lifecycle of one connection.
///
/// `Dead` is terminal until the caller opens again: reached on a fatal close
/// code or when the reconnect supervisor runs out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    WaitingForHello,
    Identifying,
    Resuming,
    Ready,
    Disconnected,
    Dead,
}

impl ConnectionState {
    /// A socket is open (handshake may still be running)
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::WaitingForHello | Self::Identifying | Self::Resuming | Self::Ready
        )
    }

    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// Ready, or on the way back to ready with a session in hand
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Ready | Self::Resuming)
    }

    /// States from which `open` may start a new attempt
    pub fn can_open(self) -> bool {
        matches!(self, Self::Unconnected | Self::Disconnected | Self::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::WaitingForHello => "waiting_for_hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resumable logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    /// Last dispatch sequence processed
    pub sequence: Option<u64>,
    pub resume_url: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, resume_url: Option<String>, sequence: Option<u64>) -> Self {
        Self {
            id: id.into(),
            sequence,
            resume_url,
        }
    }

    pub fn record(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }
}

/// Heartbeat timing for the current socket.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatClock {
    interval: Option<Duration>,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
}

impl HeartbeatClock {
    /// Start over with the interval from a new HELLO.
    pub fn reset(&mut self, interval: Duration) {
        *self = Self {
            interval: Some(interval),
            ..Self::default()
        };
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn record_sent(&mut self, at: Instant) {
        self.last_sent = Some(at);
    }

    pub fn record_ack(&mut self, at: Instant) {
        self.last_ack = Some(at);
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    /// The last heartbeat has not been acknowledged.
    ///
    /// Compares timestamps only: an ack for an older heartbeat that arrives
    /// after a newer send still counts as missing.
    pub fn is_zombied(&self) -> bool {
        match (self.last_sent, self.last_ack) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(sent), Some(ack)) => ack < sent,
        }
    }

    /// Time between the last send and the ack that followed it.
    ///
    /// An approximation of round-trip latency: it is a delta between two
    /// local timestamps, not a matched request/response pair.
    pub fn latency(&self) -> Option<Duration> {
        match (self.last_sent, self.last_ack) {
            (Some(sent), Some(ack)) if ack >= sent => Some(ack - sent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_clock_is_not_zombied() {
        let mut clock = HeartbeatClock::default();
        clock.reset(Duration::from_millis(100));
        assert!(!clock.is_zombied());
        assert_eq!(clock.latency(), None);
    }

    #[test]
    fn unacked_heartbeat_is_zombied() {
        let start = Instant::now();
        let mut clock = HeartbeatClock::default();
        clock.record_sent(start);
        assert!(clock.is_zombied());

        clock.record_ack(start + Duration::from_millis(40));
        assert!(!clock.is_zombied());
        assert_eq!(clock.latency(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn late_ack_for_older_heartbeat_does_not_mask_a_miss() {
        let start = Instant::now();
        let mut clock = HeartbeatClock::default();
        clock.record_sent(start);
        clock.record_ack(start + Duration::from_millis(10));
        clock.record_sent(start + Duration::from_millis(100));

        assert!(clock.is_zombied());
        assert_eq!(clock.latency(), None);
    }

    #[test]
    fn reset_clears_timestamps() {
        let mut clock = HeartbeatClock::default();
        clock.record_sent(Instant::now());
        clock.reset(Duration::from_secs(41));
        assert_eq!(clock.interval(), Some(Duration::from_secs(41)));
        assert!(clock.last_sent().is_none());
        assert!(!clock.is_zombied());
    }

    #[test]
    fn session_tracks_last_sequence() {
        let mut session = Session::new("abc", None, Some(1));
        for seq in 2..=5 {
            session.record(seq);
        }
        assert_eq!(session.sequence, Some(5));
    }

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::Dead.can_open());
        assert!(!ConnectionState::Resuming.can_open());
        assert!(ConnectionState::Resuming.is_healthy());
        assert!(ConnectionState::Identifying.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert_eq!(ConnectionState::WaitingForHello.to_string(), "waiting_for_hello");
    }
}
