// Connection manager
//
// Dial, STOMP handshake and subscription for one session, plus the
// bounded exponential-backoff retry loop used when resilience is enabled.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ConnectStage, LoadTestError};
use crate::stats::MetricsAggregator;
use crate::stomp::{encode_connect, encode_subscribe, parse_frame, Command};
use crate::stomp::parser::is_heartbeat;
use crate::transport::{Connection, Dialer, FrameSink, FrameStream};

use self::backoff::ExponentialBackoff;

/// A subscribed connection with the time each setup stage took.
pub struct EstablishedConnection {
    pub connection: Connection,
    /// Transport dial time.
    pub connect_setup: Duration,
    /// CONNECT written to CONNECTED received.
    pub handshake: Duration,
}

pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    stats: Arc<MetricsAggregator>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, stats: Arc<MetricsAggregator>) -> Self {
        Self { dialer, stats }
    }

    /// Single attempt. Any failing stage is fatal.
    pub async fn connect(
        &self,
        session_id: u64,
        config: &SessionConfig,
    ) -> Result<EstablishedConnection, LoadTestError> {
        self.connect_observed(session_id, config, &|_: ConnectStage| {}).await
    }

    /// Single attempt; `on_stage` is told which stage is about to start.
    pub async fn connect_observed(
        &self,
        session_id: u64,
        config: &SessionConfig,
        on_stage: &(dyn Fn(ConnectStage) + Send + Sync),
    ) -> Result<EstablishedConnection, LoadTestError> {
        let timeouts = &config.timeouts;
        let token = config.credential.token.as_str();

        on_stage(ConnectStage::Dial);
        let dial_start = Instant::now();
        let connection = tokio::time::timeout(timeouts.dial, self.dialer.dial(&config.endpoint, token))
            .await
            .map_err(|_| LoadTestError::DialError(format!("timed out after {:?}", timeouts.dial)))??;
        let connect_setup = dial_start.elapsed();
        let (mut sink, mut stream) = connection.into_split();

        on_stage(ConnectStage::Handshake);
        let handshake_start = Instant::now();
        if let Err(e) = handshake(sink.as_mut(), stream.as_mut(), token, timeouts.handshake, timeouts.write).await {
            let _ = tokio::time::timeout(timeouts.write, sink.close()).await;
            return Err(e);
        }
        let handshake_time = handshake_start.elapsed();

        on_stage(ConnectStage::Subscribe);
        let subscribe = encode_subscribe(session_id, token, config.channel_id);
        let subscribed = match tokio::time::timeout(timeouts.write, sink.send_frame(subscribe)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LoadTestError::SubscriptionError(e.to_string())),
            Err(_) => Err(LoadTestError::SubscriptionError(format!(
                "write timed out after {:?}",
                timeouts.write
            ))),
        };
        if let Err(e) = subscribed {
            let _ = tokio::time::timeout(timeouts.write, sink.close()).await;
            return Err(e);
        }

        self.stats.record_connection_setup(connect_setup, handshake_time);
        debug!(
            session_id,
            connect_ms = connect_setup.as_secs_f64() * 1000.0,
            handshake_ms = handshake_time.as_secs_f64() * 1000.0,
            "connection established"
        );

        Ok(EstablishedConnection {
            connection: Connection::new(sink, stream),
            connect_setup,
            handshake: handshake_time,
        })
    }

    /// Retry `connect` with exponential backoff until it succeeds, the
    /// policy is exhausted, or `cancel` fires. With reconnection disabled
    /// this is a single cancellable attempt.
    pub async fn connect_with_retry(
        &self,
        cancel: &CancellationToken,
        session_id: u64,
        config: &SessionConfig,
        on_stage: &(dyn Fn(ConnectStage) + Send + Sync),
    ) -> Result<EstablishedConnection, LoadTestError> {
        let policy = &config.reconnect;
        if !policy.enabled {
            return tokio::select! {
                _ = cancel.cancelled() => Err(LoadTestError::Cancelled),
                result = self.connect_observed(session_id, config, on_stage) => result,
            };
        }

        let start = Instant::now();
        let mut backoff = ExponentialBackoff::new(policy);
        let mut attempts: u32 = 0;
        let mut last_error = String::new();

        loop {
            if cancel.is_cancelled() {
                return Err(LoadTestError::Cancelled);
            }
            attempts += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(LoadTestError::Cancelled),
                result = self.connect_observed(session_id, config, on_stage) => result,
            };

            match result {
                Ok(established) => {
                    if attempts > 1 {
                        let elapsed = start.elapsed();
                        self.stats.record_successful_reconnection(elapsed);
                        info!(session_id, attempts, elapsed_ms = elapsed.as_millis() as u64, "reconnected");
                    }
                    return Ok(established);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    self.stats.record_connection_retry();
                    warn!(session_id, attempt = attempts, stage = ?e.connect_stage(), error = %e, "connect attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempts >= policy.max_attempts {
                break;
            }
            let delay = backoff.next_delay();
            if start.elapsed() + delay > policy.max_elapsed() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LoadTestError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.stats.record_failed_reconnection();
        warn!(session_id, attempts, error = %last_error, "giving up on connection");
        Err(LoadTestError::ReconnectExhausted { attempts, last_error })
    }
}

/// Send CONNECT and wait for CONNECTED. Heart-beats and unrelated frames
/// are skipped; an ERROR frame fails at once.
async fn handshake(
    sink: &mut dyn FrameSink,
    stream: &mut dyn FrameStream,
    token: &str,
    wait: Duration,
    write_timeout: Duration,
) -> Result<(), LoadTestError> {
    match tokio::time::timeout(write_timeout, sink.send_frame(encode_connect(token))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(LoadTestError::HandshakeRejected(format!("CONNECT not written: {}", e))),
        Err(_) => return Err(LoadTestError::HandshakeTimeout(write_timeout)),
    }

    let acknowledged = async {
        loop {
            let raw = match stream.next_frame().await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    return Err(LoadTestError::HandshakeRejected(
                        "connection closed before CONNECTED".to_string(),
                    ))
                }
                Err(e) => return Err(e),
            };
            if is_heartbeat(&raw) {
                continue;
            }
            match parse_frame(&raw) {
                Ok(frame) if frame.command == Command::Connected => return Ok(()),
                Ok(frame) if frame.command == Command::Error => {
                    let reason = frame
                        .headers
                        .get("message")
                        .map(str::to_string)
                        .unwrap_or(frame.body);
                    return Err(LoadTestError::HandshakeRejected(reason));
                }
                Ok(_) | Err(_) => continue,
            }
        }
    };

    match tokio::time::timeout(wait, acknowledged).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(LoadTestError::HandshakeRejected(reason))) => Err(LoadTestError::HandshakeRejected(reason)),
        Ok(Err(e)) => Err(LoadTestError::HandshakeRejected(e.to_string())),
        Err(_) => Err(LoadTestError::HandshakeTimeout(wait)),
    }
}
