use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::OpCode;
use crate::error::GatewayError;

/// Inbound gateway envelope.
///
/// `d` stays raw: dispatch payloads are forwarded verbatim and only the
/// handful of control payloads this layer needs are decoded.
#[derive(Debug, Deserialize)]
pub struct GatewayPayload {
    /// Wider than any known opcode so unknown ones still decode
    pub op: u64,
    #[serde(default)]
    pub d: Option<Box<RawValue>>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GatewayError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn opcode(&self) -> Option<OpCode> {
        u8::try_from(self.op).ok().and_then(OpCode::from_u8)
    }

    /// Decode `d` into a concrete control payload.
    pub fn data<'a, T: Deserialize<'a>>(&'a self) -> Result<T, GatewayError> {
        let raw = self.d.as_deref().map_or("null", RawValue::get);
        Ok(serde_json::from_str(raw)?)
    }
}

/// Outbound gateway envelope.
#[derive(Debug, Serialize)]
pub struct OutgoingPayload<'a, T: Serialize + ?Sized> {
    pub op: u8,
    pub d: &'a T,
}

impl<'a, T: Serialize + ?Sized> OutgoingPayload<'a, T> {
    pub fn new(op: OpCode, d: &'a T) -> Self {
        Self { op: op.as_u8(), d }
    }

    pub fn to_json(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// HELLO payload
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats
    pub heartbeat_interval: u64,
}

/// The slice of READY this layer needs to resume later.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dispatch_envelope_and_keeps_payload_raw() {
        let frame = br#"{"op":0,"s":42,"t":"MESSAGE_CREATE","d":{"id":"1","content":"hi"}}"#;
        let payload = GatewayPayload::from_slice(frame).unwrap();

        assert_eq!(payload.opcode(), Some(OpCode::Dispatch));
        assert_eq!(payload.s, Some(42));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(
            payload.d.as_deref().map(RawValue::get),
            Some(r#"{"id":"1","content":"hi"}"#)
        );
    }

    #[test]
    fn parses_hello_interval() {
        let payload =
            GatewayPayload::from_slice(br#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#)
                .unwrap();
        let hello: Hello = payload.data().unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
        assert_eq!(payload.s, None);
    }

    #[test]
    fn invalid_session_flag_decodes_as_bool() {
        let payload = GatewayPayload::from_slice(br#"{"op":9,"d":false}"#).unwrap();
        let resumable: bool = payload.data().unwrap();
        assert!(!resumable);
    }

    #[test]
    fn missing_data_decodes_as_null() {
        let payload = GatewayPayload::from_slice(br#"{"op":11}"#).unwrap();
        assert!(payload.d.is_none());
        let unit: Option<u64> = payload.data().unwrap();
        assert_eq!(unit, None);
    }

    #[test]
    fn opcode_beyond_u8_decodes_as_unknown() {
        let payload = GatewayPayload::from_slice(br#"{"op":300,"d":null}"#).unwrap();
        assert_eq!(payload.op, 300);
        assert_eq!(payload.opcode(), None);

        let payload = GatewayPayload::from_slice(br#"{"op":42}"#).unwrap();
        assert_eq!(payload.opcode(), None);
    }

    #[test]
    fn malformed_frame_is_a_decode_error() {
        let err = GatewayPayload::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[test]
    fn outgoing_envelope_shape() {
        let json = OutgoingPayload::new(OpCode::Heartbeat, &Some(7u64)).to_json().unwrap();
        assert_eq!(json, r#"{"op":1,"d":7}"#);
    }
}
