//! Websocket transport
//!
//! Turns the raw socket into discrete gateway payloads and back. The socket
//! is split once at dial time: the write half is shared (heartbeats and
//! caller sends race for it), the read half belongs to the receive loop.

mod inflater;

pub use inflater::{inflate_payload, StreamInflater};

use std::fmt;
use std::str::FromStr;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsErr, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::protocol::{GatewayPayload, API_VERSION};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Compression negotiated with the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Plain text frames
    None,
    /// Individual payloads may arrive as self-contained zlib binary frames
    Payload,
    /// One zlib context spans every frame on the socket
    #[default]
    Stream,
}

impl Compression {
    fn query(self) -> &'static str {
        match self {
            Self::Stream => "&compress=zlib-stream",
            Self::None | Self::Payload => "",
        }
    }
}

impl FromStr for Compression {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "payload" => Ok(Self::Payload),
            "zlib-stream" | "stream" => Ok(Self::Stream),
            other => Err(GatewayError::Config(format!(
                "unknown compression '{other}', expected none, payload or zlib-stream"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Payload => "payload",
            Self::Stream => "zlib-stream",
        })
    }
}

/// Build the dial URL: version, encoding and stream compression go in the
/// query string.
pub fn connect_url(base: &str, compression: Compression) -> String {
    let (base, separator) = if base.contains('?') {
        (base, "&")
    } else {
        (base.trim_end_matches('/'), "/?")
    };
    format!(
        "{base}{separator}v={API_VERSION}&encoding=json{}",
        compression.query()
    )
}

/// One decoded inbound event.
#[derive(Debug)]
pub enum Incoming {
    Payload(GatewayPayload),
    /// Remote closed the socket (or the stream ended without a close frame)
    Closed { code: Option<u16>, reason: String },
}

/// Dial `url` and split the socket into its two halves.
pub async fn connect(
    url: &str,
    compression: Compression,
) -> Result<(TransportSink, TransportStream), GatewayError> {
    let (socket, _response) = connect_async(url).await?;
    debug!(url, %compression, "Websocket connected");

    let (sink, stream) = socket.split();
    Ok((
        TransportSink { sink, closed: false },
        TransportStream {
            stream,
            compression,
            inflater: (compression == Compression::Stream).then(StreamInflater::new),
        },
    ))
}

/// Write half of the socket.
pub struct TransportSink {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

impl TransportSink {
    /// Write one serialized payload. No retry: that policy lives above.
    pub async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        if self.closed {
            return Err(GatewayError::ConnectionClosed {
                code: None,
                reason: "transport already closed".to_string(),
            });
        }
        trace!(len = text.len(), "Sending frame");
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a close frame with `code` and shut the write half. Idempotent.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), GatewayError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let sent = self.sink.send(Message::Close(Some(frame))).await;
        let closed = self.sink.close().await;
        match (sent, closed) {
            // the peer may already be gone; a close on a dead socket is not news
            (Err(WsErr::ConnectionClosed | WsErr::AlreadyClosed), _) => Ok(()),
            (Err(e), _) => Err(e.into()),
            (Ok(()), Err(WsErr::ConnectionClosed | WsErr::AlreadyClosed)) => Ok(()),
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Read half of the socket, with the connection's decompression state.
pub struct TransportStream {
    stream: SplitStream<WsStream>,
    compression: Compression,
    inflater: Option<StreamInflater>,
}

impl TransportStream {
    /// Wait for the next complete payload.
    ///
    /// Decode failures are returned without touching the socket; the caller
    /// decides whether to close.
    pub async fn receive_message(&mut self) -> Result<Incoming, GatewayError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsErr::ConnectionClosed | WsErr::AlreadyClosed)) | None => {
                    return Ok(Incoming::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                }
                Some(Err(e)) => return Err(e.into()),
            };

            let bytes = match message {
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Binary(data) => match (self.compression, self.inflater.as_mut()) {
                    (Compression::Stream, Some(inflater)) => match inflater.push(&data)? {
                        Some(inflated) => inflated,
                        None => continue,
                    },
                    (Compression::Payload, _) => inflate_payload(&data)?,
                    _ => return Err(GatewayError::UnexpectedFrame("binary frame without compression")),
                },
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return Ok(Incoming::Closed { code, reason });
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            return GatewayPayload::from_slice(&bytes).map(Incoming::Payload);
        }
    }

    /// Drop decompression state.
    pub fn close(&mut self) {
        if let Some(inflater) = self.inflater.as_mut() {
            inflater.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_appends_version_and_compression() {
        assert_eq!(
            connect_url("wss://gateway.discord.gg", Compression::Stream),
            "wss://gateway.discord.gg/?v=10&encoding=json&compress=zlib-stream"
        );
        assert_eq!(
            connect_url("wss://gateway.discord.gg/", Compression::None),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            connect_url("ws://127.0.0.1:9000/?region=x", Compression::Payload),
            "ws://127.0.0.1:9000/?region=x&v=10&encoding=json"
        );
    }

    #[test]
    fn compression_parses_from_config_strings() {
        assert_eq!("zlib-stream".parse::<Compression>().unwrap(), Compression::Stream);
        assert_eq!("PAYLOAD".parse::<Compression>().unwrap(), Compression::Payload);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("gzip".parse::<Compression>().is_err());
    }
}
