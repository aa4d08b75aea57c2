//! In-process gateway double for integration tests.
//!
//! Speaks plain-text JSON frames over a websocket bound to 127.0.0.1:0.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shardwire::{ConnectionConfig, Compression, DispatchEvent, EventHandler, ReconnectPolicy};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Upper bound on any single wait in a test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockGateway {
    listener: TcpListener,
    pub url: String,
}

impl MockGateway {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    /// Accept the next client and finish the websocket upgrade.
    pub async fn accept(&self) -> MockConn {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("no client connected in time")
            .unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        MockConn { ws }
    }

    /// True when a client dials within `within`.
    pub async fn dialed_within(&self, within: Duration) -> bool {
        tokio::time::timeout(within, self.listener.accept()).await.is_ok()
    }
}

pub struct MockConn {
    ws: WebSocketStream<TcpStream>,
}

impl MockConn {
    pub async fn send_json(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    pub async fn hello(&mut self, interval_ms: u64) {
        self.send_json(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}))
            .await;
    }

    pub async fn dispatch(&mut self, event_type: &str, seq: u64, data: Value) {
        self.send_json(json!({"op": 0, "t": event_type, "s": seq, "d": data}))
            .await;
    }

    pub async fn ready(&mut self, session_id: &str, seq: u64, resume_url: &str) {
        self.dispatch(
            "READY",
            seq,
            json!({"session_id": session_id, "resume_gateway_url": resume_url}),
        )
        .await;
    }

    /// Next frame with opcode `op`, skipping everything else. Returns the
    /// frame's `d`.
    pub async fn recv_op(&mut self, op: u64) -> Value {
        tokio::time::timeout(STEP_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                        if frame["op"] == op {
                            return frame["d"].clone();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        panic!("client closed while waiting for op {op}: {frame:?}")
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => panic!("read failed while waiting for op {op}: {e}"),
                    None => panic!("stream ended while waiting for op {op}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for op {op}"))
    }

    /// Read until the client's close frame; returns its code.
    pub async fn recv_close(&mut self) -> Option<u16> {
        tokio::time::timeout(STEP_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("timed out waiting for close")
    }

    pub async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }
}

/// Connection settings pointed at the mock: no compression, quick retries.
pub fn test_config(url: &str) -> ConnectionConfig {
    ConnectionConfig::default()
        .with_gateway_url(url)
        .with_compression(Compression::None)
        .with_reconnect_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: Some(5),
        })
        .with_invalid_session_delay(Duration::from_millis(10))
}

/// Handler that forwards every dispatch into a channel.
pub fn channel_handler() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<DispatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn EventHandler> = Arc::new(move |event: DispatchEvent| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

/// Wait for the dispatch carrying `seq`.
pub async fn wait_for_sequence(rx: &mut mpsc::UnboundedReceiver<DispatchEvent>, seq: u64) -> DispatchEvent {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("handler dropped");
            if event.sequence == seq {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no dispatch with seq {seq}"))
}
