use std::time::Duration;

/// Connection setup stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    Dial,
    Handshake,
    Subscribe,
}

impl std::fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectStage::Dial => write!(f, "dial"),
            ConnectStage::Handshake => write!(f, "handshake"),
            ConnectStage::Subscribe => write!(f, "subscribe"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    #[error("STOMP parse error: {0}")]
    ParseError(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Dial failed: {0}")]
    DialError(String),
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("Subscription failed: {0}")]
    SubscriptionError(String),
    #[error("Send failed: {0}")]
    SendError(String),
    #[error("Receive failed: {0}")]
    ReceiveError(String),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Reconnect exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
    #[error("Cancelled")]
    Cancelled,
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Channel setup failed: {0}")]
    ChannelError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Account pool is empty")]
    EmptyAccountPool,
}

impl LoadTestError {
    /// Connection stage this error belongs to, if it came out of connection setup.
    pub fn connect_stage(&self) -> Option<ConnectStage> {
        match self {
            LoadTestError::DialError(_) => Some(ConnectStage::Dial),
            LoadTestError::HandshakeTimeout(_) | LoadTestError::HandshakeRejected(_) => {
                Some(ConnectStage::Handshake)
            }
            LoadTestError::SubscriptionError(_) => Some(ConnectStage::Subscribe),
            _ => None,
        }
    }

    /// Whether another connection attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LoadTestError::Cancelled
                | LoadTestError::ConfigError(_)
                | LoadTestError::AuthError(_)
                | LoadTestError::ReconnectExhausted { .. }
        )
    }
}
