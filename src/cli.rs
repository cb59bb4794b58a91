// CLI subcommand definitions using clap derive macros
use anyhow::Context;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accounts::{AccountGenerator, AccountsFile, CredentialPool};
use crate::config::{self, Config, Credential};
use crate::connection::ConnectionManager;
use crate::directory::DirectoryClient;
use crate::error::LoadTestError;
use crate::reporter::{self, compare_reports, RunReport};
use crate::scheduler::{SessionSource, StageScheduler};
use crate::session::SessionContext;
use crate::stats::MetricsAggregator;
use crate::tracker::LatencyTracker;
use crate::transport::WsDialer;

/// STOMP over WebSocket チャットサーバ向け負荷試験ツール
#[derive(Parser, Debug, PartialEq)]
#[command(name = "stomp-load-test")]
pub enum Cli {
    /// アカウントファイルを生成する
    GenerateAccounts {
        /// メールアドレスのプレフィックス
        #[arg(long, default_value = "loadtest")]
        prefix: String,
        /// 開始番号
        #[arg(long, default_value_t = 1)]
        start: u32,
        /// 生成アカウント数
        #[arg(long)]
        count: u32,
        /// メールドメイン
        #[arg(long)]
        domain: String,
        /// パスワードパターン（例: "pass{index}"）
        #[arg(long, default_value = "password")]
        password_pattern: String,
        /// 出力ファイルパス
        #[arg(short, long)]
        output: PathBuf,
        /// 既存ファイルへの追記
        #[arg(long)]
        append: bool,
    },
    /// 負荷試験を実行する
    Run {
        /// JSON設定ファイルパス
        config: PathBuf,
        /// JSON結果出力先
        #[arg(long)]
        output: Option<PathBuf>,
        /// CSV結果出力先
        #[arg(long)]
        csv: Option<PathBuf>,
        /// 接続先サーバ（設定ファイルより優先）
        #[arg(long, env = "SERVER_URL")]
        server_url: Option<String>,
        /// プローブ送信間隔ミリ秒（設定ファイルより優先）
        #[arg(long, env = "MESSAGE_INTERVAL_MS")]
        probe_interval_ms: Option<u64>,
    },
    /// 結果を比較する
    Compare {
        /// 現在の結果JSONファイル
        current: PathBuf,
        /// 過去の結果JSONファイル
        previous: PathBuf,
    },
}

/// generate-accountsサブコマンドの実行
///
/// --appendフラグに応じてwrite_to_fileまたはappend_to_fileを使用する。
pub fn run_generate_accounts(
    prefix: &str,
    start: u32,
    count: u32,
    domain: &str,
    password_pattern: &str,
    output: &Path,
    append: bool,
) -> anyhow::Result<()> {
    let accounts = AccountGenerator::generate(prefix, start, count, domain, password_pattern);
    let result = if append {
        AccountGenerator::append_to_file(&accounts, output)
    } else {
        AccountGenerator::write_to_file(&accounts, output)
    };
    result.with_context(|| format!("Failed to write accounts file '{}'", output.display()))?;
    println!("{} accounts written to {}", count, output.display());
    Ok(())
}

/// compareサブコマンドの実行
///
/// 2つのJSON結果ファイルを読み込み、比較レポートをJSON形式で標準出力に表示する。
pub fn run_compare(current_path: &Path, previous_path: &Path) -> anyhow::Result<()> {
    let current = reporter::read_json_result(current_path)
        .with_context(|| format!("Failed to read current result file '{}'", current_path.display()))?;
    let previous = reporter::read_json_result(previous_path).with_context(|| {
        format!("Failed to read previous result file '{}'", previous_path.display())
    })?;

    let report = compare_reports(&current, &previous);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// セッションに配る資格情報
#[derive(Debug)]
pub enum Credentials {
    Single(Credential),
    Pool(CredentialPool),
}

impl Credentials {
    /// ルーム解決に使う資格情報
    pub fn primary(&self) -> &Credential {
        match self {
            Credentials::Single(c) => c,
            Credentials::Pool(pool) => pool.primary(),
        }
    }
}

/// 設定から資格情報を解決する
///
/// 優先順位: token + member_id → accounts_file → email / password
///
/// accounts_file はログインに失敗したアカウントを警告付きで除外し、
/// 全滅した場合のみエラーにする。
pub async fn resolve_credentials(
    cfg: &Config,
    directory: &DirectoryClient,
) -> Result<Credentials, LoadTestError> {
    if let Some(token) = &cfg.token {
        let member_id = cfg
            .member_id
            .ok_or_else(|| LoadTestError::ConfigError("token requires member_id".to_string()))?;
        return Ok(Credentials::Single(Credential {
            token: token.clone(),
            member_id,
        }));
    }

    if let Some(path) = &cfg.accounts_file {
        let file = AccountsFile::load_from_file(Path::new(path))?;
        let mut credentials = Vec::with_capacity(file.accounts.len());
        for account in &file.accounts {
            match directory.login(&account.email, &account.password).await {
                Ok(c) => credentials.push(c),
                Err(e) => warn!(email = %account.email, error = %e, "account login failed, skipping"),
            }
        }
        if credentials.is_empty() {
            return Err(LoadTestError::AuthError(format!(
                "no account in '{}' could log in",
                path
            )));
        }
        info!(
            logged_in = credentials.len(),
            total = file.accounts.len(),
            "account pool ready"
        );
        return Ok(Credentials::Pool(CredentialPool::new(credentials)?));
    }

    match (&cfg.email, &cfg.password) {
        (Some(email), Some(password)) => Ok(Credentials::Single(directory.login(email, password).await?)),
        _ => Err(LoadTestError::ConfigError(
            "one of token, accounts_file or email/password is required".to_string(),
        )),
    }
}

/// CLI引数で設定を上書きする
pub fn apply_overrides(cfg: &mut Config, server_url: Option<String>, probe_interval_ms: Option<u64>) {
    if let Some(url) = server_url {
        cfg.server_url = url;
    }
    if let Some(ms) = probe_interval_ms {
        cfg.probe_interval_ms = ms;
    }
}

/// Prometheus レコーダーを登録し `/metrics` を公開する
///
/// レコーダーはプロセスで一度だけ登録できる。戻り値は実際の待受アドレス。
pub async fn start_metrics_exporter(
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let handle = crate::metrics::install_recorder().context("Failed to install Prometheus recorder")?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    crate::metrics::spawn_metrics_server(handle, addr, cancel)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {}", addr))
}

/// runサブコマンドの実行
///
/// 認証とルーム解決を済ませてからステージを順に実行し、結果を出力する。
/// `cancel` がキャンセルされても実行中のセッションを回収してから結果を出す。
pub async fn run_load_test(
    config_path: &Path,
    output: Option<&Path>,
    csv: Option<&Path>,
    server_url: Option<String>,
    probe_interval_ms: Option<u64>,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let mut cfg = config::load_from_file(config_path)?;
    apply_overrides(&mut cfg, server_url, probe_interval_ms);
    cfg.validate().map_err(|errors| {
        LoadTestError::ConfigError(format!("invalid configuration: {}", errors.join("; ")))
    })?;

    let directory = DirectoryClient::new(&cfg.api_base_url(), cfg.http_timeout())?;
    let credentials = resolve_credentials(&cfg, &directory).await?;
    let channel_id = directory
        .resolve_or_create_channel(&cfg.channel, credentials.primary())
        .await?;

    info!(
        endpoint = %cfg.websocket_url(),
        channel_id,
        stages = cfg.stages.len(),
        "starting load test"
    );

    let exporter_token = CancellationToken::new();
    let exporter = match cfg.metrics_port {
        Some(port) => Some(start_metrics_exporter(port, exporter_token.clone()).await?.1),
        None => None,
    };

    let stats = Arc::new(MetricsAggregator::new());
    let ctx = SessionContext {
        connections: Arc::new(ConnectionManager::new(Arc::new(WsDialer), Arc::clone(&stats))),
        tracker: Arc::new(LatencyTracker::new()),
        stats: Arc::clone(&stats),
    };
    let base = cfg.base_session_config(credentials.primary().clone(), channel_id);
    let source = match credentials {
        Credentials::Single(_) => SessionSource::Shared(base),
        Credentials::Pool(pool) => SessionSource::Pooled {
            base,
            pool: Arc::new(pool),
        },
    };

    let started_at = chrono::Utc::now();
    let scheduler = StageScheduler::new(cfg.stages.clone(), cfg.schedule(), source, ctx);
    let outcome = scheduler.run(cancel).await;
    let finished_at = chrono::Utc::now();

    exporter_token.cancel();
    if let Some(task) = exporter {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "metrics endpoint stopped with an error"),
            Err(e) => warn!(error = %e, "metrics endpoint task aborted"),
            Ok(Ok(())) => {}
        }
    }

    let report = RunReport::build(&outcome, &stats.snapshot(), started_at, finished_at);
    reporter::display_summary(&report);

    if let Some(path) = output {
        reporter::write_json_result(&report, path)
            .with_context(|| format!("Failed to write result file '{}'", path.display()))?;
    }
    if let Some(path) = csv {
        reporter::write_csv_result(&report, path)
            .with_context(|| format!("Failed to write CSV file '{}'", path.display()))?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::NamedTempFile;

    // === generate-accounts サブコマンドテスト ===

    #[test]
    fn test_generate_accounts_with_required_args() {
        let cli = Cli::try_parse_from([
            "stomp-load-test",
            "generate-accounts",
            "--count", "100",
            "--domain", "example.com",
            "-o", "accounts.json",
        ]);
        match cli.unwrap() {
            Cli::GenerateAccounts { count, domain, output, prefix, start, password_pattern, append } => {
                assert_eq!(count, 100);
                assert_eq!(domain, "example.com");
                assert_eq!(output, PathBuf::from("accounts.json"));
                // defaults
                assert_eq!(prefix, "loadtest");
                assert_eq!(start, 1);
                assert_eq!(password_pattern, "password");
                assert!(!append);
            }
            _ => panic!("Expected GenerateAccounts"),
        }
    }

    #[test]
    fn test_generate_accounts_missing_count() {
        let cli = Cli::try_parse_from([
            "stomp-load-test",
            "generate-accounts",
            "--domain", "example.com",
            "-o", "accounts.json",
        ]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_run_generate_accounts_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        run_generate_accounts("u", 1, 3, "x.io", "pw{index}", &path, false).unwrap();
        run_generate_accounts("v", 1, 1, "x.io", "pw", &path, true).unwrap();
        let loaded = AccountsFile::load_from_file(&path).unwrap();
        assert_eq!(loaded.accounts.len(), 4);
        assert_eq!(loaded.accounts[2].password, "pw0003");
    }

    // === run サブコマンドテスト ===

    #[test]
    fn test_run_with_config_path_only() {
        let cli = Cli::try_parse_from(["stomp-load-test", "run", "config.json"]).unwrap();
        match cli {
            Cli::Run { config, output, csv, .. } => {
                assert_eq!(config, PathBuf::from("config.json"));
                assert!(output.is_none());
                assert!(csv.is_none());
            }
            _ => panic!("Expected Run"),
        }
    }

    #[test]
    fn test_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "stomp-load-test",
            "run",
            "config.json",
            "--output", "result.json",
            "--csv", "result.csv",
            "--server-url", "wss://chat.example.com",
            "--probe-interval-ms", "250",
        ])
        .unwrap();
        match cli {
            Cli::Run { output, csv, server_url, probe_interval_ms, .. } => {
                assert_eq!(output, Some(PathBuf::from("result.json")));
                assert_eq!(csv, Some(PathBuf::from("result.csv")));
                assert_eq!(server_url.as_deref(), Some("wss://chat.example.com"));
                assert_eq!(probe_interval_ms, Some(250));
            }
            _ => panic!("Expected Run"),
        }
    }

    #[test]
    fn test_run_missing_config() {
        assert!(Cli::try_parse_from(["stomp-load-test", "run"]).is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, Some("example.com:9000".to_string()), Some(100));
        assert_eq!(cfg.server_url, "example.com:9000");
        assert_eq!(cfg.probe_interval_ms, 100);

        let mut untouched = Config::default();
        apply_overrides(&mut untouched, None, None);
        assert_eq!(untouched, Config::default());
    }

    // === compare サブコマンドテスト ===

    #[test]
    fn test_compare_parses_two_paths() {
        let cli = Cli::try_parse_from(["stomp-load-test", "compare", "a.json", "b.json"]).unwrap();
        assert_eq!(
            cli,
            Cli::Compare {
                current: PathBuf::from("a.json"),
                previous: PathBuf::from("b.json"),
            }
        );
    }

    #[test]
    fn test_run_compare_missing_file() {
        let existing = NamedTempFile::new().unwrap();
        assert!(run_compare(existing.path(), Path::new("/nonexistent/previous.json")).is_err());
    }

    #[test]
    fn test_unknown_subcommand() {
        assert!(Cli::try_parse_from(["stomp-load-test", "bench"]).is_err());
    }

    // === 資格情報の解決 ===

    fn offline_directory() -> DirectoryClient {
        DirectoryClient::new("http://127.0.0.1:1", std::time::Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_credentials_literal_token() {
        let cfg = Config {
            token: Some("tok".to_string()),
            member_id: Some(5),
            ..Default::default()
        };
        let creds = resolve_credentials(&cfg, &offline_directory()).await.unwrap();
        assert_eq!(
            creds.primary(),
            &Credential {
                token: "tok".to_string(),
                member_id: 5
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_credentials_token_without_member_id() {
        let cfg = Config {
            token: Some("tok".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_credentials(&cfg, &offline_directory()).await,
            Err(LoadTestError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_credentials_nothing_configured() {
        assert!(matches!(
            resolve_credentials(&Config::default(), &offline_directory()).await,
            Err(LoadTestError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_credentials_all_logins_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        AccountGenerator::write_to_file(&AccountGenerator::generate("a", 1, 2, "x.io", "p"), &path).unwrap();
        let cfg = Config {
            accounts_file: Some(path.to_string_lossy().to_string()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_credentials(&cfg, &offline_directory()).await,
            Err(LoadTestError::AuthError(_))
        ));
    }

    // === メトリクス公開 ===

    #[tokio::test]
    async fn test_metrics_exporter_serves_recorded_counters() {
        let token = CancellationToken::new();
        let (addr, task) = start_metrics_exporter(0, token.clone()).await.unwrap();
        MetricsAggregator::new().set_current_stage(3);

        let url = format!("http://127.0.0.1:{}/metrics", addr.port());
        let body = reqwest::get(url).await.unwrap().text().await.unwrap();
        assert!(body.contains("stomp_load_test_current_stage"));

        // 二度目の登録は失敗する
        assert!(start_metrics_exporter(0, token.clone()).await.is_err());

        token.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
