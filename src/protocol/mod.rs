//! Gateway wire protocol
//!
//! JSON envelopes of the form `{op, d, s, t}`, the opcode and close-code
//! tables, and the typed commands a client may send.

mod close_code;
pub mod command;
mod intents;
mod opcode;
mod payload;

pub use close_code::{CloseCode, ReconnectAction};
pub use intents::Intents;
pub use opcode::OpCode;
pub use payload::{GatewayPayload, Hello, OutgoingPayload, Ready};

/// Gateway API version requested in the connect URL.
pub const API_VERSION: u8 = 10;
