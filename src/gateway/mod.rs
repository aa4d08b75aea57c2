//! Gateway connection state machine
//!
//! One [`Gateway`] owns one socket at a time and runs
//! hello → identify/resume → heartbeat, then resume-or-reidentify after a
//! disconnect:
//!
//! ```text
//! Unconnected → Connecting → WaitingForHello → Identifying ─┐
//!                   ↑                        └→ Resuming ───┴→ Ready
//!                   └──────────── Disconnected ←──────────────────┘
//!                                      └→ Dead (fatal close, retries exhausted)
//! ```
//!
//! Each socket gets a generation number. The heartbeat and receive tasks of
//! an attempt carry it, and only the first task to report a disconnect for
//! the current generation tears the socket down and schedules a reconnect.

mod config;
mod runner;
mod session;

pub use config::{ConnectionConfig, ReconnectPolicy};
pub use session::{ConnectionState, HeartbeatClock, Session};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::Context;
use crate::error::GatewayError;
use crate::events::{EventHandler, NoopHandler, VoiceStateSink};
use crate::metrics::GatewayMetrics;
use crate::protocol::command::{Command, RequestGuildMembers, UpdatePresence, UpdateVoiceState};
use crate::protocol::{CloseCode, OpCode, OutgoingPayload};
use crate::ratelimit::{CommandRateLimiter, IdentifyRateLimiter};
use crate::rest::GatewayUrlResolver;
use crate::shard::ShardState;
use crate::transport::TransportSink;

/// Handle to one gateway connection. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    token: String,
    config: ConnectionConfig,
    handler: Arc<dyn EventHandler>,
    voice: Option<Arc<dyn VoiceStateSink>>,
    resolver: Option<Arc<dyn GatewayUrlResolver>>,
    identify: Arc<IdentifyRateLimiter>,
    commands: CommandRateLimiter,
    shard_state: Option<ShardState>,
    metrics: GatewayMetrics,
    shared: Mutex<Shared>,
    sink: AsyncMutex<Option<LiveSink>>,
    status: watch::Sender<ConnectionState>,
}

/// Bookkeeping guarded by one short-lived lock.
#[derive(Default)]
struct Shared {
    session: Option<Session>,
    clock: HeartbeatClock,
    /// URL resolved through the REST collaborator, reused across reconnects
    resolved_url: Option<String>,
    attempt: Option<Attempt>,
    generation: u64,
    supervisor: Option<Supervisor>,
    next_supervisor: u64,
    /// Consecutive reconnects without reaching Ready
    failures: u32,
    closed_by_user: bool,
    termination: Option<Termination>,
    last_error: Option<Arc<GatewayError>>,
}

/// Loops of the current socket
struct Attempt {
    generation: u64,
    cancel: CancellationToken,
}

/// Pending reconnect task
struct Supervisor {
    id: u64,
    cancel: CancellationToken,
}

struct LiveSink {
    generation: u64,
    sink: TransportSink,
}

/// Why a connection went `Dead`.
#[derive(Debug, Clone)]
enum Termination {
    FatalClose { code: u16, reason: String },
    Exhausted { attempts: u32 },
    Config(String),
}

impl Termination {
    fn to_error(&self, shard_id: u64) -> GatewayError {
        match self {
            Self::FatalClose { code, reason } => GatewayError::FatalClose {
                shard_id,
                code: *code,
                reason: reason.clone(),
            },
            Self::Exhausted { attempts } => GatewayError::ReconnectExhausted {
                shard_id,
                attempts: *attempts,
            },
            Self::Config(message) => GatewayError::Config(message.clone()),
        }
    }
}

impl Gateway {
    pub fn builder(token: impl Into<String>, config: ConnectionConfig) -> GatewayBuilder {
        GatewayBuilder::new(token, config)
    }

    pub fn shard_id(&self) -> u64 {
        self.inner.config.shard_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Dial, wait for HELLO, then resume the cached session or identify.
    ///
    /// Returns once the handshake command has been written; READY arrives
    /// later on the receive task (see [`wait_until_ready`](Self::wait_until_ready)).
    /// Errors are surfaced as-is: a failed open is not retried.
    pub async fn open(&self, ctx: &Context) -> Result<(), GatewayError> {
        let supervisor = {
            let mut shared = self.inner.shared.lock();
            let state = *self.inner.status.borrow();
            if !state.can_open() {
                return Err(GatewayError::AlreadyConnected {
                    shard_id: self.shard_id(),
                });
            }
            shared.closed_by_user = false;
            shared.termination = None;
            shared.failures = 0;
            self.inner.set_state(ConnectionState::Connecting);
            shared.supervisor.take()
        };
        // a pending reconnect would race this open
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
        }

        self.inner.connect(ctx).await
    }

    /// Close with the normal code, dropping the session.
    pub async fn close(&self, ctx: &Context) -> Result<(), GatewayError> {
        self.close_with_code(ctx, CloseCode::Normal.as_u16()).await
    }

    /// Stop both loops, stop any reconnect, and close the socket with `code`.
    ///
    /// 1000 and 1001 drop the session; any other code keeps it so the next
    /// [`open`](Self::open) resumes.
    pub async fn close_with_code(&self, ctx: &Context, code: u16) -> Result<(), GatewayError> {
        let close_code = CloseCode::from_u16(code);
        let (attempt, supervisor) = {
            let mut shared = self.inner.shared.lock();
            shared.closed_by_user = true;
            if close_code.clears_session() {
                shared.session = None;
            }
            (shared.attempt.take(), shared.supervisor.take())
        };
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
        }
        if let Some(attempt) = attempt {
            attempt.cancel.cancel();
        }

        ctx.run(async {
            self.inner.close_sink(None, code, "closed by client").await;
            Ok(())
        })
        .await?;

        let state = *self.inner.status.borrow();
        if !matches!(state, ConnectionState::Unconnected | ConnectionState::Dead) {
            self.inner.set_state(ConnectionState::Disconnected);
        }
        info!(shard_id = self.shard_id(), close_code = code, "Gateway closed");
        Ok(())
    }

    /// Send a typed command through the command limiter.
    pub async fn send<C: Command>(&self, ctx: &Context, command: &C) -> Result<(), GatewayError> {
        let json = command.payload().to_json()?;
        self.inner.send_json(ctx, json).await
    }

    /// Send an arbitrary payload under `op`.
    pub async fn send_raw<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        op: OpCode,
        data: &T,
    ) -> Result<(), GatewayError> {
        let json = OutgoingPayload::new(op, data).to_json()?;
        self.inner.send_json(ctx, json).await
    }

    pub async fn request_guild_members(
        &self,
        ctx: &Context,
        request: &RequestGuildMembers,
    ) -> Result<(), GatewayError> {
        self.send(ctx, request).await
    }

    pub async fn update_voice_state(
        &self,
        ctx: &Context,
        update: &UpdateVoiceState,
    ) -> Result<(), GatewayError> {
        self.send(ctx, update).await
    }

    pub async fn update_presence(
        &self,
        ctx: &Context,
        presence: &UpdatePresence,
    ) -> Result<(), GatewayError> {
        self.send(ctx, presence).await
    }

    pub fn status(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    /// Resolve once the connection is Ready; fails if it goes Dead first.
    pub async fn wait_until_ready(&self, ctx: &Context) -> Result<(), GatewayError> {
        let mut status = self.inner.status.subscribe();
        ctx.run(async {
            loop {
                let state = *status.borrow_and_update();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Dead => return Err(self.dead_error()),
                    _ => {}
                }
                if status.changed().await.is_err() {
                    return Err(GatewayError::NotConnected {
                        shard_id: self.shard_id(),
                    });
                }
            }
        })
        .await
    }

    fn dead_error(&self) -> GatewayError {
        let shard_id = self.shard_id();
        self.inner
            .shared
            .lock()
            .termination
            .as_ref()
            .map_or(GatewayError::NotConnected { shard_id }, |t| t.to_error(shard_id))
    }

    /// Snapshot of the resumable session, if any.
    pub fn session(&self) -> Option<Session> {
        self.inner.shared.lock().session.clone()
    }

    /// Approximate latency: time between the last heartbeat sent and the
    /// ack that followed it. Not a matched round trip.
    pub fn latency(&self) -> Option<Duration> {
        self.inner.shared.lock().clock.latency()
    }

    /// Most recent failure (transport error, fatal close, exhausted retries).
    pub fn last_error(&self) -> Option<Arc<GatewayError>> {
        self.inner.shared.lock().last_error.clone()
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("shard_id", &self.shard_id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    token: String,
    config: ConnectionConfig,
    handler: Arc<dyn EventHandler>,
    voice: Option<Arc<dyn VoiceStateSink>>,
    resolver: Option<Arc<dyn GatewayUrlResolver>>,
    identify: Option<Arc<IdentifyRateLimiter>>,
    shard_state: Option<ShardState>,
    metrics: GatewayMetrics,
}

impl GatewayBuilder {
    fn new(token: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            token: token.into(),
            config,
            handler: Arc::new(NoopHandler),
            voice: None,
            resolver: None,
            identify: None,
            shard_state: None,
            metrics: GatewayMetrics::disabled(),
        }
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn voice_sink(mut self, sink: Arc<dyn VoiceStateSink>) -> Self {
        self.voice = Some(sink);
        self
    }

    /// Used when neither the config nor a previous session supplies a URL.
    pub fn resolver(mut self, resolver: Arc<dyn GatewayUrlResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Share an identify limiter across connections. Without one the
    /// connection gets a private single-bucket limiter.
    pub fn identify_limiter(mut self, limiter: Arc<IdentifyRateLimiter>) -> Self {
        self.identify = Some(limiter);
        self
    }

    pub fn shard_state(mut self, state: ShardState) -> Self {
        self.shard_state = Some(state);
        self
    }

    pub fn metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Gateway {
        let (status, _) = watch::channel(ConnectionState::Unconnected);
        let commands = CommandRateLimiter::new(self.config.command_limit, self.config.command_window);
        let identify = self
            .identify
            .unwrap_or_else(|| Arc::new(IdentifyRateLimiter::new(1)));

        if let Some(state) = &self.shard_state {
            state.set_state(self.config.shard_id, ConnectionState::Unconnected);
        }

        Gateway {
            inner: Arc::new(Inner {
                token: self.token,
                config: self.config,
                handler: self.handler,
                voice: self.voice,
                resolver: self.resolver,
                identify,
                commands,
                shard_state: self.shard_state,
                metrics: self.metrics,
                shared: Mutex::new(Shared::default()),
                sink: AsyncMutex::new(None),
                status,
            }),
        }
    }
}
