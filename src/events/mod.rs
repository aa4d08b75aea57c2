//! Event delivery to external collaborators
//!
//! The gateway never interprets dispatch payloads beyond READY/RESUMED: every
//! dispatch frame is handed verbatim to an [`EventHandler`], and voice updates
//! are additionally mirrored to a [`VoiceStateSink`] when one is installed.

pub mod serialize;

pub use serialize::{serialize_event, EventEnvelope};

use serde_json::value::RawValue;

/// One decoded dispatch frame.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    /// Event name from the `t` field, e.g. `MESSAGE_CREATE`
    pub event_type: String,
    pub sequence: u64,
    pub shard_id: u64,
    /// The `d` field, untouched
    pub payload: Box<RawValue>,
}

/// Receives every dispatch frame, in order, on the shard's receive task.
///
/// Runs inline with the receive loop: long work should be handed off to a
/// channel or a spawned task.
pub trait EventHandler: Send + Sync + 'static {
    fn on_dispatch(&self, event: DispatchEvent);
}

impl<F> EventHandler for F
where
    F: Fn(DispatchEvent) + Send + Sync + 'static,
{
    fn on_dispatch(&self, event: DispatchEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn on_dispatch(&self, _event: DispatchEvent) {}
}

/// Bridge for the voice subsystem: VOICE_STATE_UPDATE and
/// VOICE_SERVER_UPDATE payloads, forwarded as-is.
pub trait VoiceStateSink: Send + Sync + 'static {
    fn on_voice_state_update(&self, shard_id: u64, payload: &RawValue);
    fn on_voice_server_update(&self, shard_id: u64, payload: &RawValue);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closures_are_handlers() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        let handler = move |event: DispatchEvent| sink.lock().unwrap().push(event.sequence);

        handler.on_dispatch(DispatchEvent {
            event_type: "GUILD_CREATE".to_string(),
            sequence: 3,
            shard_id: 0,
            payload: RawValue::from_string("{}".to_string()).unwrap(),
        });

        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }
}
