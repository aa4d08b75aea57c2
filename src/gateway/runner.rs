//! Per-socket tasks: handshake, heartbeat loop, receive loop, and the
//! reconnect supervisor.

use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{Attempt, ConnectionState, Inner, LiveSink, Session, Supervisor, Termination};
use crate::context::Context;
use crate::error::GatewayError;
use crate::events::DispatchEvent;
use crate::protocol::command::{Command, Heartbeat, Identify, Resume};
use crate::protocol::{CloseCode, GatewayPayload, Hello, OpCode, Ready, ReconnectAction};
use crate::transport::{self, Compression, Incoming, TransportStream};

/// Upper bound on flushing a close frame to a peer that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a socket is being torn down.
enum Disconnect {
    /// We decided to drop the socket
    Local {
        code: CloseCode,
        reason: &'static str,
        clear_session: bool,
        delay: Option<Duration>,
    },
    /// The remote closed it
    Remote { code: Option<u16>, reason: String },
    /// Read, write or decode failure
    Transport(GatewayError),
}

impl Disconnect {
    fn zombied() -> Self {
        Self::Local {
            code: CloseCode::ServiceRestart,
            reason: "heartbeat not acknowledged",
            clear_session: false,
            delay: None,
        }
    }

    fn reconnect_requested() -> Self {
        Self::Local {
            code: CloseCode::ServiceRestart,
            reason: "reconnect requested",
            clear_session: false,
            delay: None,
        }
    }

    fn invalid_session(resumable: bool, delay: Duration) -> Self {
        Self::Local {
            code: if resumable {
                CloseCode::ServiceRestart
            } else {
                CloseCode::Normal
            },
            reason: "invalid session",
            clear_session: !resumable,
            delay: Some(delay),
        }
    }
}

impl Inner {
    fn shard_id(&self) -> u64 {
        self.config.shard_id
    }

    pub(super) fn set_state(&self, state: ConnectionState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            debug!(shard_id = self.shard_id(), from = %previous, to = %state, "State transition");
        }
        if let Some(shard_state) = &self.shard_state {
            shard_state.set_state(self.shard_id(), state);
        }
    }

    fn record_error(&self, error: GatewayError) {
        self.metrics.record_error(self.shard_id(), error.error_type_label());
        self.remember_error(error);
    }

    fn remember_error(&self, error: GatewayError) {
        self.shared.lock().last_error = Some(Arc::new(error));
    }

    /// Run one connection attempt. The caller has already moved the state
    /// to `Connecting`.
    pub(super) async fn connect(self: &Arc<Self>, ctx: &Context) -> Result<(), GatewayError> {
        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.generation
        };

        let result = self.handshake(ctx, generation).await;
        if let Err(err) = &result {
            warn!(shard_id = self.shard_id(), error = %err, "Connection attempt failed");
            self.metrics.record_error(self.shard_id(), err.error_type_label());
            self.abort(generation).await;
        }
        result
    }

    async fn handshake(self: &Arc<Self>, ctx: &Context, generation: u64) -> Result<(), GatewayError> {
        let shard_id = self.shard_id();
        let base = self.gateway_url(ctx).await?;
        let compression = self.config.compression;
        let url = transport::connect_url(&base, compression);

        let (sink, mut stream) = ctx.run(transport::connect(&url, compression)).await?;
        *self.sink.lock().await = Some(LiveSink { generation, sink });
        self.set_state(ConnectionState::WaitingForHello);

        let hello: Hello = match ctx.run(stream.receive_message()).await? {
            Incoming::Payload(payload) if payload.opcode() == Some(OpCode::Hello) => payload.data()?,
            Incoming::Payload(payload) => {
                return Err(GatewayError::Protocol {
                    shard_id,
                    message: format!("expected HELLO as first frame, got op {}", payload.op),
                });
            }
            Incoming::Closed { code, reason } => {
                return Err(GatewayError::ConnectionClosed { code, reason });
            }
        };
        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        debug!(shard_id, interval_ms = hello.heartbeat_interval, "Received HELLO");

        let (cancel, session) = {
            let mut shared = self.shared.lock();
            if shared.closed_by_user {
                return Err(GatewayError::Cancelled);
            }
            shared.clock.reset(interval);
            let cancel = CancellationToken::new();
            shared.attempt = Some(Attempt {
                generation,
                cancel: cancel.clone(),
            });
            (cancel, shared.session.clone())
        };

        tokio::spawn(Arc::clone(self).heartbeat_loop(generation, cancel.clone(), interval));
        tokio::spawn(Arc::clone(self).receive_loop(generation, cancel, stream));

        match session {
            Some(session) => {
                self.set_state(ConnectionState::Resuming);
                info!(shard_id, seq = ?session.sequence, "Resuming session");
                let resume = Resume {
                    token: self.token.clone(),
                    session_id: session.id,
                    seq: session.sequence,
                };
                self.send_json(ctx, resume.payload().to_json()?).await?;
            }
            None => {
                self.set_state(ConnectionState::Identifying);
                self.identify(ctx).await?;
            }
        }

        if self.shared.lock().closed_by_user {
            return Err(GatewayError::Cancelled);
        }
        Ok(())
    }

    /// Gateway URL: resume URL of the session, then the cached or
    /// configured URL, then the resolver.
    async fn gateway_url(&self, ctx: &Context) -> Result<String, GatewayError> {
        {
            let shared = self.shared.lock();
            let resume_url = shared.session.as_ref().and_then(|s| s.resume_url.clone());
            if let Some(url) = resume_url.or_else(|| shared.resolved_url.clone()) {
                return Ok(url);
            }
        }
        if let Some(url) = &self.config.gateway_url {
            return Ok(url.clone());
        }
        let resolver = self.resolver.as_ref().ok_or_else(|| {
            GatewayError::Config("no gateway URL configured and no resolver installed".to_string())
        })?;

        let url = ctx.run(resolver.gateway_url()).await?;
        self.shared.lock().resolved_url = Some(url.clone());
        Ok(url)
    }

    async fn identify(&self, ctx: &Context) -> Result<(), GatewayError> {
        let shard_id = self.shard_id();
        let identify = Identify {
            token: self.token.clone(),
            properties: self.config.properties.clone(),
            compress: self.config.compression == Compression::Payload,
            large_threshold: self.config.large_threshold,
            shard: [shard_id, self.config.shard_count],
            presence: self.config.presence.clone(),
            intents: self.config.intents,
        };
        let json = identify.payload().to_json()?;

        let started = Instant::now();
        let permit = self.identify.wait(ctx, shard_id).await?;
        self.metrics.record_identify_wait(shard_id, started.elapsed());
        info!(shard_id, shard_count = self.config.shard_count, "Identifying");

        let result = self.send_json(ctx, json).await;
        permit.release();
        result
    }

    /// Tear down a failed attempt of `generation` without reconnecting.
    async fn abort(&self, generation: u64) {
        let attempt = {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                return;
            }
            if shared.attempt.as_ref().is_some_and(|a| a.generation == generation) {
                shared.attempt.take()
            } else {
                None
            }
        };
        if let Some(attempt) = attempt {
            attempt.cancel.cancel();
        }
        self.close_sink(Some(generation), CloseCode::ServiceRestart.as_u16(), "handshake failed")
            .await;
        if !matches!(*self.status.borrow(), ConnectionState::Dead) {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Write one serialized payload through the command limiter.
    pub(super) async fn send_json(&self, ctx: &Context, json: String) -> Result<(), GatewayError> {
        if self.sink.lock().await.is_none() {
            return Err(GatewayError::NotConnected {
                shard_id: self.shard_id(),
            });
        }
        let _permit = self.commands.wait(ctx).await?;
        self.write_frame(ctx, json).await
    }

    async fn write_frame(&self, ctx: &Context, json: String) -> Result<(), GatewayError> {
        let shard_id = self.shard_id();
        ctx.run(async {
            let mut slot = self.sink.lock().await;
            match slot.as_mut() {
                Some(live) => live.sink.send_text(json).await,
                None => Err(GatewayError::NotConnected { shard_id }),
            }
        })
        .await
    }

    async fn send_heartbeat(&self, ctx: &Context) -> Result<(), GatewayError> {
        let sequence = self.shared.lock().session.as_ref().and_then(|s| s.sequence);
        let json = Heartbeat(sequence).payload().to_json()?;

        let _permit = self.commands.wait(ctx).await?;
        self.shared.lock().clock.record_sent(Instant::now());
        trace!(shard_id = self.shard_id(), seq = ?sequence, "Sending heartbeat");
        self.write_frame(ctx, json).await
    }

    /// Close the live sink. With `Some(generation)` only that socket is
    /// closed; a newer one is left alone.
    pub(super) async fn close_sink(&self, generation: Option<u64>, code: u16, reason: &str) {
        let mut slot = self.sink.lock().await;
        let matches = match (generation, slot.as_ref()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(generation), Some(live)) => live.generation == generation,
        };
        if !matches {
            return;
        }
        if let Some(mut live) = slot.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, live.sink.close(code, reason)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(shard_id = self.shard_id(), error = %e, "Error closing socket"),
                Err(_) => debug!(shard_id = self.shard_id(), "Timed out flushing close frame"),
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64, cancel: CancellationToken, interval: Duration) {
        let ctx = Context::from_token(cancel.clone());
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if self.shared.lock().clock.is_zombied() {
                warn!(shard_id = self.shard_id(), "Heartbeat not acknowledged, connection zombied");
                self.disconnect(generation, Disconnect::zombied()).await;
                return;
            }

            if let Err(err) = self.send_heartbeat(&ctx).await {
                if cancel.is_cancelled() {
                    return;
                }
                self.disconnect(generation, Disconnect::Transport(err)).await;
                return;
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, generation: u64, cancel: CancellationToken, mut stream: TransportStream) {
        let ctx = Context::from_token(cancel.clone());

        let cause = loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break None,
                incoming = stream.receive_message() => incoming,
            };

            match incoming {
                Ok(Incoming::Payload(payload)) => match self.handle_payload(&ctx, payload).await {
                    Ok(None) => continue,
                    Ok(Some(cause)) => break Some(cause),
                    Err(_) if cancel.is_cancelled() => break None,
                    Err(err) => break Some(Disconnect::Transport(err)),
                },
                Ok(Incoming::Closed { code, reason }) => break Some(Disconnect::Remote { code, reason }),
                Err(err) => break Some(Disconnect::Transport(err)),
            }
        };

        stream.close();
        if let Some(cause) = cause {
            self.disconnect(generation, cause).await;
        }
    }

    /// Returns a disconnect cause when the payload ends the socket.
    async fn handle_payload(&self, ctx: &Context, payload: GatewayPayload) -> Result<Option<Disconnect>, GatewayError> {
        let shard_id = self.shard_id();
        match payload.opcode() {
            Some(OpCode::Dispatch) => {
                self.handle_dispatch(payload)?;
                Ok(None)
            }
            Some(OpCode::Heartbeat) => {
                debug!(shard_id, "Heartbeat requested by remote");
                self.send_heartbeat(ctx).await?;
                Ok(None)
            }
            Some(OpCode::Reconnect) => {
                info!(shard_id, "Remote requested reconnect");
                Ok(Some(Disconnect::reconnect_requested()))
            }
            Some(OpCode::InvalidSession) => {
                let resumable = match payload.data::<bool>() {
                    Ok(resumable) => resumable,
                    Err(err) => {
                        debug!(
                            shard_id,
                            error = %err,
                            "Malformed INVALID_SESSION payload, treating as not resumable"
                        );
                        false
                    }
                };
                warn!(shard_id, resumable, "Session invalidated");
                Ok(Some(Disconnect::invalid_session(
                    resumable,
                    self.config.invalid_session_delay,
                )))
            }
            Some(OpCode::HeartbeatAck) => {
                let latency = {
                    let mut shared = self.shared.lock();
                    shared.clock.record_ack(Instant::now());
                    shared.clock.latency()
                };
                trace!(shard_id, latency_ms = ?latency.map(|d| d.as_millis()), "Heartbeat acknowledged");
                if let Some(latency) = latency {
                    self.metrics.record_heartbeat_ack(shard_id, latency);
                }
                if let Some(shard_state) = &self.shard_state {
                    shard_state.record_heartbeat_ack(shard_id, latency);
                }
                Ok(None)
            }
            _ => {
                debug!(shard_id, op = payload.op, "Ignoring unexpected opcode");
                Ok(None)
            }
        }
    }

    fn handle_dispatch(&self, mut payload: GatewayPayload) -> Result<(), GatewayError> {
        let shard_id = self.shard_id();
        let event_type = payload.t.take().unwrap_or_default();
        let sequence = payload.s;

        match event_type.as_str() {
            "READY" => {
                let ready: Ready = payload.data()?;
                {
                    let mut shared = self.shared.lock();
                    shared.session = Some(Session::new(ready.session_id, ready.resume_gateway_url, sequence));
                    shared.failures = 0;
                }
                self.set_state(ConnectionState::Ready);
                info!(shard_id, seq = ?sequence, "Shard ready");
            }
            "RESUMED" => {
                self.shared.lock().failures = 0;
                self.set_state(ConnectionState::Ready);
                info!(shard_id, seq = ?sequence, "Shard resumed");
            }
            _ => {}
        }

        if let Some(sequence) = sequence {
            if let Some(session) = self.shared.lock().session.as_mut() {
                session.record(sequence);
            }
        }

        let payload = match payload.d.take() {
            Some(raw) => raw,
            None => RawValue::from_string("null".to_string())?,
        };

        if let Some(voice) = &self.voice {
            match event_type.as_str() {
                "VOICE_STATE_UPDATE" => voice.on_voice_state_update(shard_id, &payload),
                "VOICE_SERVER_UPDATE" => voice.on_voice_server_update(shard_id, &payload),
                _ => {}
            }
        }

        self.metrics.record_event(shard_id, &event_type);
        if let Some(shard_state) = &self.shard_state {
            shard_state.record_event(shard_id);
        }
        trace!(shard_id, seq = ?sequence, event_type = %event_type, "Dispatch");

        self.handler.on_dispatch(DispatchEvent {
            event_type,
            sequence: sequence.unwrap_or_default(),
            shard_id,
            payload,
        });
        Ok(())
    }

    /// Tear down the socket of `generation` and decide what comes next.
    /// Only the first caller per generation gets past the attempt check.
    async fn disconnect(self: &Arc<Self>, generation: u64, cause: Disconnect) {
        let shard_id = self.shard_id();
        let attempt = {
            let mut shared = self.shared.lock();
            if shared.attempt.as_ref().is_some_and(|a| a.generation == generation) {
                shared.attempt.take()
            } else {
                None
            }
        };
        let Some(attempt) = attempt else {
            return;
        };
        attempt.cancel.cancel();

        let (action, delay, termination) = match cause {
            Disconnect::Local {
                code,
                reason,
                clear_session,
                delay,
            } => {
                debug!(shard_id, close_code = code.as_u16(), reason, "Dropping connection");
                self.close_sink(Some(generation), code.as_u16(), reason).await;
                let action = if clear_session {
                    ReconnectAction::Reidentify
                } else {
                    ReconnectAction::Resume
                };
                (action, delay, None)
            }
            Disconnect::Remote { code, reason } => {
                self.close_sink(Some(generation), CloseCode::ServiceRestart.as_u16(), "reconnecting")
                    .await;
                let action = code.map_or(ReconnectAction::Resume, |c| CloseCode::from_u16(c).reconnect_action());
                let termination = match (action, code) {
                    (ReconnectAction::Fatal, Some(code)) => {
                        let reason = if reason.is_empty() {
                            CloseCode::from_u16(code).description().to_string()
                        } else {
                            reason
                        };
                        error!(shard_id, close_code = code, %reason, "Gateway closed with fatal code");
                        Some(Termination::FatalClose { code, reason })
                    }
                    _ => {
                        warn!(shard_id, close_code = ?code, %reason, "Gateway closed by remote");
                        None
                    }
                };
                (action, None, termination)
            }
            Disconnect::Transport(err) => {
                warn!(shard_id, error = %err, "Transport error, reconnecting");
                self.record_error(err);
                self.close_sink(Some(generation), CloseCode::ServiceRestart.as_u16(), "transport error")
                    .await;
                (ReconnectAction::Resume, None, None)
            }
        };

        let reconnect = {
            let mut shared = self.shared.lock();
            if action != ReconnectAction::Resume {
                shared.session = None;
            }
            !shared.closed_by_user && self.config.auto_reconnect
        };

        if let Some(termination) = termination {
            self.terminate(termination);
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        if reconnect {
            self.spawn_reconnect(delay);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, first_delay: Option<Duration>) {
        let cancel = CancellationToken::new();
        let id = {
            let mut shared = self.shared.lock();
            if shared.closed_by_user {
                return;
            }
            shared.next_supervisor += 1;
            let id = shared.next_supervisor;
            let supervisor = Supervisor {
                id,
                cancel: cancel.clone(),
            };
            if let Some(previous) = shared.supervisor.replace(supervisor) {
                previous.cancel.cancel();
            }
            id
        };
        tokio::spawn(Arc::clone(self).reconnect(id, cancel, first_delay));
    }

    /// Retry `connect` with capped exponential backoff until it succeeds,
    /// the attempts run out, or the supervisor is cancelled.
    async fn reconnect(self: Arc<Self>, id: u64, cancel: CancellationToken, mut first_delay: Option<Duration>) {
        let shard_id = self.shard_id();
        let ctx = Context::from_token(cancel.clone());
        let policy = self.config.reconnect;

        loop {
            let attempt = {
                let mut shared = self.shared.lock();
                shared.failures += 1;
                shared.failures
            };
            if let Some(max) = policy.max_attempts {
                if attempt > max {
                    let attempts = attempt - 1;
                    error!(shard_id, attempts, "Giving up on reconnecting");
                    self.terminate(Termination::Exhausted { attempts });
                    return;
                }
            }

            let delay = first_delay.take().unwrap_or_else(|| policy.delay_for_attempt(attempt));
            info!(shard_id, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            if ctx.sleep_until(Instant::now() + delay).await.is_err() {
                return;
            }

            if !self.begin_reconnect(id) {
                return;
            }
            self.metrics.record_reconnect(shard_id);
            if let Some(shard_state) = &self.shard_state {
                shard_state.record_reconnect(shard_id);
            }

            match self.connect(&ctx).await {
                Ok(()) => break,
                Err(_) if cancel.is_cancelled() => return,
                Err(GatewayError::Config(message)) => {
                    error!(shard_id, %message, "Reconnect failed fatally");
                    self.terminate(Termination::Config(message));
                    return;
                }
                Err(err) => {
                    warn!(shard_id, attempt, error = %err, "Reconnect attempt failed");
                    self.remember_error(err);
                }
            }
        }

        let mut shared = self.shared.lock();
        if shared.supervisor.as_ref().is_some_and(|current| current.id == id) {
            shared.supervisor = None;
        }
    }

    /// Claim the `Connecting` state for supervisor `id`.
    fn begin_reconnect(&self, id: u64) -> bool {
        let shared = self.shared.lock();
        let owned = shared
            .supervisor
            .as_ref()
            .is_some_and(|current| current.id == id && !current.cancel.is_cancelled());
        if !owned || shared.closed_by_user || !self.status.borrow().can_open() {
            return false;
        }
        self.set_state(ConnectionState::Connecting);
        true
    }

    fn terminate(&self, termination: Termination) {
        let error = termination.to_error(self.shard_id());
        {
            let mut shared = self.shared.lock();
            shared.termination = Some(termination);
            shared.supervisor = None;
        }
        self.record_error(error);
        self.set_state(ConnectionState::Dead);
    }
}
