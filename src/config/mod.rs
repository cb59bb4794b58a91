// Configuration manager module
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::LoadTestError;
use crate::scheduler::SESSION_ID_STRIDE;

/// ステージ定義（宣言順に実行される）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub population: u32,
    pub label: String,
    pub hold_secs: u64,
}

impl StageSpec {
    pub fn hold_duration(&self) -> Duration {
        Duration::from_secs(self.hold_secs)
    }
}

/// 再接続ポリシー（指数バックオフ + ジッタ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub randomization: f64,
    pub max_elapsed_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            randomization: 0.5,
            max_elapsed_secs: 300,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }

    fn validate_into(&self, errors: &mut Vec<String>) {
        if self.max_attempts == 0 {
            errors.push("reconnect.max_attempts must be greater than 0".to_string());
        }
        if self.initial_backoff_ms == 0 {
            errors.push("reconnect.initial_backoff_ms must be greater than 0".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            errors.push("reconnect.max_backoff_ms must be >= reconnect.initial_backoff_ms".to_string());
        }
        if self.multiplier < 1.0 {
            errors.push("reconnect.multiplier must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.randomization) {
            errors.push("reconnect.randomization must be between 0.0 and 1.0".to_string());
        }
    }
}

/// 接続先チャットルームの決め方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// 既知のルームIDを使う
    Fixed { id: i64 },
    /// 参加中ルームの先頭を使う
    FirstJoined,
    /// 1:1ルームを作成する
    Private { other_member_id: i64 },
    /// グループルームを作成する
    Group { member_ids: Vec<i64> },
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig::FirstJoined
    }
}

/// メイン設定構造体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub token: Option<String>,
    pub member_id: Option<i64>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub accounts_file: Option<String>,
    pub channel: ChannelConfig,
    pub probe_interval_ms: u64,
    pub traffic_tiers: bool,
    pub reconnect: ReconnectPolicy,
    pub http_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub read_deadline_ms: u64,
    pub write_timeout_secs: u64,
    pub pending_timeout_secs: u64,
    pub ramp_up_secs: u64,
    pub min_spawn_interval_us: u64,
    pub stage_pause_secs: u64,
    pub progress_interval_secs: u64,
    /// Prometheus `/metrics` を公開するポート（None で無効）
    pub metrics_port: Option<u16>,
    pub stages: Vec<StageSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "localhost:8080".to_string(),
            token: None,
            member_id: None,
            email: None,
            password: None,
            accounts_file: None,
            channel: ChannelConfig::default(),
            probe_interval_ms: 5000,
            traffic_tiers: true,
            reconnect: ReconnectPolicy::default(),
            http_timeout_secs: 5,
            dial_timeout_secs: 30,
            handshake_timeout_secs: 30,
            read_deadline_ms: 5000,
            write_timeout_secs: 10,
            pending_timeout_secs: 30,
            ramp_up_secs: 10,
            min_spawn_interval_us: 1,
            stage_pause_secs: 3,
            progress_interval_secs: 5,
            metrics_port: Some(2112),
            stages: vec![StageSpec {
                population: 100,
                label: "baseline".to_string(),
                hold_secs: 180,
            }],
        }
    }
}

impl Config {
    /// 設定値のバリデーション
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server_url.trim().is_empty() {
            errors.push("server_url must not be empty".to_string());
        }
        if self.probe_interval_ms == 0 {
            errors.push("probe_interval_ms must be greater than 0".to_string());
        }
        if self.dial_timeout_secs == 0 {
            errors.push("dial_timeout_secs must be greater than 0".to_string());
        }
        if self.handshake_timeout_secs == 0 {
            errors.push("handshake_timeout_secs must be greater than 0".to_string());
        }
        if self.read_deadline_ms == 0 {
            errors.push("read_deadline_ms must be greater than 0".to_string());
        }
        if self.write_timeout_secs == 0 {
            errors.push("write_timeout_secs must be greater than 0".to_string());
        }
        if self.pending_timeout_secs == 0 {
            errors.push("pending_timeout_secs must be greater than 0".to_string());
        }
        if self.min_spawn_interval_us == 0 {
            errors.push("min_spawn_interval_us must be greater than 0".to_string());
        }
        if self.progress_interval_secs == 0 {
            errors.push("progress_interval_secs must be greater than 0".to_string());
        }

        if self.stages.is_empty() {
            errors.push("stages must not be empty".to_string());
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.hold_secs == 0 {
                errors.push(format!("stages[{}].hold_secs must be greater than 0", i));
            }
            if stage.label.trim().is_empty() {
                errors.push(format!("stages[{}].label must not be empty", i));
            }
            // セッションIDはステージごとに SESSION_ID_STRIDE 幅の範囲を使う
            if u64::from(stage.population) >= SESSION_ID_STRIDE {
                errors.push(format!(
                    "stages[{}].population must be less than {}",
                    i, SESSION_ID_STRIDE
                ));
            }
        }

        // 認証情報はトークン・ログイン・アカウントファイルのいずれかが必要
        let has_token = self.token.is_some();
        let has_login = self.email.is_some() && self.password.is_some();
        if !has_token && !has_login && self.accounts_file.is_none() {
            errors.push("one of token, email/password or accounts_file is required".to_string());
        }
        if self.email.is_some() != self.password.is_some() {
            errors.push("email and password must be given together".to_string());
        }
        if has_token && self.member_id.is_none() {
            errors.push("member_id is required when token is given".to_string());
        }

        if let ChannelConfig::Group { member_ids } = &self.channel {
            if member_ids.is_empty() {
                errors.push("channel.member_ids must not be empty for a group channel".to_string());
            }
        }

        if self.reconnect.enabled {
            self.reconnect.validate_into(&mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn websocket_url(&self) -> String {
        build_websocket_url(&self.server_url)
    }

    pub fn api_base_url(&self) -> String {
        build_api_base_url(&self.server_url)
    }

    /// セッション共通のタイムアウト群
    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            dial: Duration::from_secs(self.dial_timeout_secs),
            handshake: Duration::from_secs(self.handshake_timeout_secs),
            read_deadline: Duration::from_millis(self.read_deadline_ms),
            write: Duration::from_secs(self.write_timeout_secs),
        }
    }

    /// 全セッション共通のベース設定を作る
    pub fn base_session_config(&self, credential: Credential, channel_id: i64) -> SessionConfig {
        SessionConfig {
            endpoint: self.websocket_url(),
            credential,
            channel_id,
            probe_interval: self.probe_interval(),
            traffic_tiers: self.traffic_tiers,
            reconnect: self.reconnect.clone(),
            timeouts: self.timeouts(),
        }
    }

    /// ランプアップ・ステージ間の待ち時間など、スケジューラ向けの設定
    pub fn schedule(&self) -> ScheduleSettings {
        ScheduleSettings {
            ramp_up: Duration::from_secs(self.ramp_up_secs),
            min_spawn_interval: Duration::from_micros(self.min_spawn_interval_us),
            stage_pause: Duration::from_secs(self.stage_pause_secs),
            progress_interval: Duration::from_secs(self.progress_interval_secs),
            pending_timeout: Duration::from_secs(self.pending_timeout_secs),
        }
    }
}

/// アクセストークンと送信者ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub member_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub dial: Duration,
    pub handshake: Duration,
    pub read_deadline: Duration,
    pub write: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Config::default().timeouts()
    }
}

/// セッション単位の設定。開始後は変更されない。
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub endpoint: String,
    pub credential: Credential,
    pub channel_id: i64,
    pub probe_interval: Duration,
    pub traffic_tiers: bool,
    pub reconnect: ReconnectPolicy,
    pub timeouts: SessionTimeouts,
}

impl SessionConfig {
    /// 資格情報だけ差し替えた複製
    pub fn with_credential(&self, credential: Credential) -> Self {
        Self {
            credential,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub ramp_up: Duration,
    pub min_spawn_interval: Duration,
    pub stage_pause: Duration,
    pub progress_interval: Duration,
    pub pending_timeout: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Config::default().schedule()
    }
}

/// server_url から WebSocket エンドポイントを組み立てる
///
/// - `host:port` → `ws://host:port/ws-stomp`
/// - `http://host` → `ws://host/ws-stomp`, `https://host` → `wss://host/ws-stomp`
/// - `ws://` / `wss://` はそのまま
pub fn build_websocket_url(server_url: &str) -> String {
    let server_url = server_url.trim();
    if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        return server_url.to_string();
    }

    let (scheme, rest) = if let Some(rest) = server_url.strip_prefix("https://") {
        ("wss://", rest)
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        ("ws://", rest)
    } else {
        ("ws://", server_url)
    };

    let rest = rest.trim_end_matches('/');
    if rest.contains('/') {
        format!("{}{}", scheme, rest)
    } else {
        format!("{}{}/ws-stomp", scheme, rest)
    }
}

/// server_url から REST API のベースURLを組み立てる（末尾スラッシュなし）
pub fn build_api_base_url(server_url: &str) -> String {
    let server_url = server_url.trim();
    if server_url.starts_with("http://") || server_url.starts_with("https://") {
        return server_url.trim_end_matches('/').to_string();
    }

    let (scheme, rest) = if let Some(rest) = server_url.strip_prefix("wss://") {
        ("https://", rest)
    } else if let Some(rest) = server_url.strip_prefix("ws://") {
        ("http://", rest)
    } else {
        ("http://", server_url)
    };

    let host = match rest.find('/') {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    format!("{}{}", scheme, host)
}

/// JSON文字列から設定を読み込み、バリデーションを実行する
pub fn load_from_str(json: &str) -> Result<Config, LoadTestError> {
    let config: Config = serde_json::from_str(json)
        .map_err(|e| LoadTestError::ConfigError(format!("JSON parse error: {}", e)))?;

    config.validate().map_err(|errors| {
        LoadTestError::ConfigError(format!("Validation errors: {}", errors.join("; ")))
    })?;

    Ok(config)
}

/// JSONファイルから設定を読み込み、バリデーションを実行する
pub fn load_from_file(path: &Path) -> Result<Config, LoadTestError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        LoadTestError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    load_from_str(&content)
}
