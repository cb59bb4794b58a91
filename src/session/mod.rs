// Worker session
//
// One simulated chat client: acquires a subscribed connection, then runs a
// send loop and a receive loop over it until cancelled or the connection is
// lost. With reconnection enabled a lost connection is re-acquired through
// the retry loop instead of ending the session.

pub mod pattern;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::connection::ConnectionManager;
use crate::error::{ConnectStage, LoadTestError};
use crate::stats::MetricsAggregator;
use crate::stomp::message::{key_prefix, probe_content};
use crate::stomp::{decode_notification, encode_send, extract_key, make_key};
use crate::tracker::LatencyTracker;
use crate::transport::{Connection, FrameSink, FrameStream};

use self::pattern::TrafficTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Subscribing,
    Active,
    Draining,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl From<ConnectStage> for SessionState {
    fn from(stage: ConnectStage) -> Self {
        match stage {
            ConnectStage::Dial => SessionState::Connecting,
            ConnectStage::Handshake => SessionState::Handshaking,
            ConnectStage::Subscribe => SessionState::Subscribing,
        }
    }
}

/// Collaborators every session of a run shares.
#[derive(Clone)]
pub struct SessionContext {
    pub connections: Arc<ConnectionManager>,
    pub tracker: Arc<LatencyTracker>,
    pub stats: Arc<MetricsAggregator>,
}

/// What a finished session reports back to its stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: u64,
    /// `Failed` if the session gave up, `Closed` if it was cancelled.
    pub final_state: SessionState,
    pub tier: TrafficTier,
    /// Highest nonce used, which is also the number of probes attempted.
    pub probes: u64,
    pub reconnects: u32,
}

enum Termination {
    Cancelled,
    ConnectFailed,
    Lost,
}

enum ConnectionEnd {
    Cancelled,
    Lost(LoadTestError),
}

/// Per-connection view handed to the two loops.
#[derive(Clone)]
struct LoopContext {
    session_id: u64,
    token: String,
    sender_id: i64,
    channel_id: i64,
    period: Duration,
    write_timeout: Duration,
    read_deadline: Duration,
    nonce: Arc<AtomicU64>,
    tracker: Arc<LatencyTracker>,
    stats: Arc<MetricsAggregator>,
}

pub struct WorkerSession {
    id: u64,
    config: SessionConfig,
    tier: TrafficTier,
    probe_period: Duration,
    nonce: Arc<AtomicU64>,
    ctx: SessionContext,
    state: watch::Sender<SessionState>,
}

impl WorkerSession {
    pub fn new(id: u64, config: SessionConfig, ctx: SessionContext) -> Self {
        let (tier, probe_period) = pattern::assign(id, config.probe_interval, config.traffic_tiers);
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id,
            config,
            tier,
            probe_period,
            nonce: Arc::new(AtomicU64::new(0)),
            ctx,
            state,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tier(&self) -> TrafficTier {
        self.tier
    }

    pub fn probe_period(&self) -> Duration {
        self.probe_period
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions while `run` is in progress.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_replace(next);
        trace!(session_id = self.id, state = ?next, "session state");
    }

    /// Drive the session until `cancel` fires or it fails for good. Both
    /// loops are joined and the connection closed before this returns.
    pub async fn run(self, cancel: CancellationToken) -> SessionOutcome {
        self.ctx.stats.record_session_created();
        let (termination, reconnects) = self.run_inner(&cancel).await;

        let final_state = match termination {
            Termination::Cancelled => {
                self.set_state(SessionState::Closed);
                SessionState::Closed
            }
            Termination::ConnectFailed => {
                self.set_state(SessionState::Failed);
                SessionState::Failed
            }
            Termination::Lost => {
                self.set_state(SessionState::Failed);
                self.set_state(SessionState::Closed);
                SessionState::Failed
            }
        };

        SessionOutcome {
            session_id: self.id,
            final_state,
            tier: self.tier,
            probes: self.nonce.load(Ordering::Relaxed),
            reconnects,
        }
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> (Termination, u32) {
        let stats = &self.ctx.stats;
        let on_stage = |stage: ConnectStage| self.set_state(stage.into());

        self.set_state(SessionState::Connecting);
        let mut established = match self
            .ctx
            .connections
            .connect_with_retry(cancel, self.id, &self.config, &on_stage)
            .await
        {
            Ok(established) => established,
            Err(LoadTestError::Cancelled) => return (Termination::Cancelled, 0),
            Err(e) => {
                stats.record_error();
                warn!(session_id = self.id, stage = ?e.connect_stage(), error = %e, "session failed to connect");
                return (Termination::ConnectFailed, 0);
            }
        };

        stats.session_started(self.tier);
        let mut reconnects = 0;
        let termination = loop {
            self.set_state(SessionState::Active);
            let error = match self.drive(established.connection, cancel).await {
                ConnectionEnd::Cancelled => break Termination::Cancelled,
                ConnectionEnd::Lost(error) => error,
            };

            stats.record_error();
            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if !self.config.reconnect.enabled {
                warn!(session_id = self.id, error = %error, "connection lost");
                break Termination::Lost;
            }

            debug!(session_id = self.id, error = %error, "connection lost, reconnecting");
            reconnects += 1;
            self.set_state(SessionState::Connecting);
            stats.reconnect_started();
            let reconnected = self
                .ctx
                .connections
                .connect_with_retry(cancel, self.id, &self.config, &on_stage)
                .await;
            stats.reconnect_finished();
            established = match reconnected {
                Ok(established) => established,
                Err(LoadTestError::Cancelled) => break Termination::Cancelled,
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "reconnection failed");
                    break Termination::Lost;
                }
            };
        };
        stats.session_finished(self.tier);

        (termination, reconnects)
    }

    fn loop_context(&self) -> LoopContext {
        LoopContext {
            session_id: self.id,
            token: self.config.credential.token.clone(),
            sender_id: self.config.credential.member_id,
            channel_id: self.config.channel_id,
            period: self.probe_period,
            write_timeout: self.config.timeouts.write,
            read_deadline: self.config.timeouts.read_deadline,
            nonce: Arc::clone(&self.nonce),
            tracker: Arc::clone(&self.ctx.tracker),
            stats: Arc::clone(&self.ctx.stats),
        }
    }

    /// Run both loops over one connection and close it once they are joined.
    async fn drive(&self, connection: Connection, cancel: &CancellationToken) -> ConnectionEnd {
        let loops = cancel.child_token();
        let (sink, stream) = connection.into_split();
        let ctx = self.loop_context();

        let send = tokio::spawn(send_loop(ctx.clone(), sink, loops.clone()));
        let recv = tokio::spawn(recv_loop(ctx, stream, loops.clone()));
        let (send_joined, recv_joined) = tokio::join!(send, recv);
        // a panicked loop leaves the other one running otherwise
        loops.cancel();

        let (sink, send_end) = match send_joined {
            Ok((sink, end)) => (Some(sink), end),
            Err(e) => (None, Err(LoadTestError::SendError(format!("send loop aborted: {}", e)))),
        };
        let recv_end = recv_joined
            .unwrap_or_else(|e| Err(LoadTestError::ReceiveError(format!("receive loop aborted: {}", e))));

        let cancelled = cancel.is_cancelled();
        let timeouts = &self.config.timeouts;
        // a cancelled session must reach Closed within one read deadline
        let close_timeout = if cancelled {
            self.set_state(SessionState::Draining);
            timeouts.write.min(timeouts.read_deadline)
        } else {
            timeouts.write
        };
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(close_timeout, sink.close()).await;
        }

        match send_end.and(recv_end) {
            _ if cancelled => ConnectionEnd::Cancelled,
            Err(e) => ConnectionEnd::Lost(e),
            Ok(()) => ConnectionEnd::Lost(LoadTestError::ConnectionClosed),
        }
    }
}

/// Send one probe per tick. Returns the sink so the caller can close it.
async fn send_loop(
    ctx: LoopContext,
    mut sink: Box<dyn FrameSink>,
    token: CancellationToken,
) -> (Box<dyn FrameSink>, Result<(), LoadTestError>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ctx.period, ctx.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return (sink, Ok(())),
            _ = ticker.tick() => {}
        }

        let nonce = ctx.nonce.fetch_add(1, Ordering::Relaxed) + 1;
        let key = make_key(ctx.session_id, nonce);
        let frame = match encode_send(
            &ctx.token,
            ctx.channel_id,
            ctx.sender_id,
            &probe_content(&key, ctx.session_id),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                ctx.stats.record_error();
                warn!(session_id = ctx.session_id, error = %e, "probe encoding failed");
                continue;
            }
        };

        ctx.tracker.record(key.clone(), Instant::now());
        let written = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(ctx.write_timeout, sink.send_frame(frame)) => Some(result),
        };

        let failure = match written {
            None => {
                ctx.tracker.resolve(&key);
                return (sink, Ok(()));
            }
            Some(Ok(Ok(()))) => {
                ctx.stats.record_sent();
                continue;
            }
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => {
                LoadTestError::SendError(format!("write timed out after {:?}", ctx.write_timeout))
            }
        };

        ctx.tracker.resolve(&key);
        token.cancel();
        return (sink, Err(failure));
    }
}

/// Read frames under a rolling deadline and correlate echoes of this
/// session's probes.
async fn recv_loop(
    ctx: LoopContext,
    mut stream: Box<dyn FrameStream>,
    token: CancellationToken,
) -> Result<(), LoadTestError> {
    let prefix = key_prefix(ctx.session_id);

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            next = tokio::time::timeout(ctx.read_deadline, stream.next_frame()) => next,
        };

        let raw = match next {
            // routine: nothing arrived within the deadline
            Err(_) => continue,
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                token.cancel();
                return Err(LoadTestError::ConnectionClosed);
            }
            Ok(Err(e)) => {
                token.cancel();
                return Err(e);
            }
        };

        let Some(message) = decode_notification(&raw) else {
            continue;
        };
        if message.room_id != ctx.channel_id {
            continue;
        }
        ctx.stats.record_received();

        let key = extract_key(&message.content);
        if key.is_empty() || !key.starts_with(prefix.as_str()) {
            continue;
        }
        if let Some(sent_at) = ctx.tracker.resolve(key) {
            ctx.stats.record_round_trip(sent_at.elapsed());
        }
    }
}
