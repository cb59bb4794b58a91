// Reporter module - run result model, JSON / CSV output and comparison
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::scheduler::{RunOutcome, StageReport};
use crate::stats::{calculate_percentiles, StatsSnapshot};

/// 遅延サンプルの要約（ミリ秒）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub median_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

fn as_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

impl LatencySummary {
    /// サンプルが無い場合はすべて 0
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort();
        let n = sorted.len();

        let (_, p90, p95, p99) = calculate_percentiles(&sorted);
        let total: f64 = sorted.iter().map(|d| as_ms(*d)).sum();
        let median_ms = if n % 2 == 0 {
            (as_ms(sorted[n / 2 - 1]) + as_ms(sorted[n / 2])) / 2.0
        } else {
            as_ms(sorted[n / 2])
        };

        Self {
            count: n as u64,
            avg_ms: total / n as f64,
            min_ms: as_ms(sorted[0]),
            max_ms: as_ms(sorted[n - 1]),
            median_ms,
            p90_ms: as_ms(p90),
            p95_ms: as_ms(p95),
            p99_ms: as_ms(p99),
        }
    }
}

/// ステージごとの結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub label: String,
    pub population: u32,
    pub spawned: u32,
    pub failed_sessions: u32,
    pub sent: u64,
    pub received: u64,
    pub success: u64,
    pub errors: u64,
    pub lost: u64,
    pub elapsed_secs: f64,
}

impl From<&StageReport> for StageSummary {
    fn from(stage: &StageReport) -> Self {
        Self {
            label: stage.label.clone(),
            population: stage.population,
            spawned: stage.spawned,
            failed_sessions: stage.failed,
            sent: stage.counters.sent,
            received: stage.counters.received,
            success: stage.counters.success,
            errors: stage.counters.errors,
            lost: stage.counters.lost,
            elapsed_secs: stage.elapsed.as_secs_f64(),
        }
    }
}

/// 実行結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: f64,
    pub cancelled: bool,
    pub total_sessions: u64,
    pub sent: u64,
    pub received: u64,
    pub success: u64,
    /// sent - success
    pub failed: u64,
    pub errors: u64,
    pub lost: u64,
    pub connection_retries: u64,
    pub failed_reconnections: u64,
    pub successful_reconnections: u64,
    pub success_rate_pct: f64,
    pub latency: LatencySummary,
    pub connect_setup: LatencySummary,
    pub handshake: LatencySummary,
    pub reconnection: LatencySummary,
    #[serde(default)]
    pub stages: Vec<StageSummary>,
}

impl RunReport {
    pub fn build(
        outcome: &RunOutcome,
        snapshot: &StatsSnapshot,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let c = &snapshot.counters;
        Self {
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            finished_at: finished_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_secs: outcome.elapsed.as_secs_f64(),
            cancelled: outcome.cancelled,
            total_sessions: outcome.total_sessions(),
            sent: c.sent,
            received: c.received,
            success: c.success,
            failed: c.sent.saturating_sub(c.success),
            errors: c.errors,
            lost: c.lost,
            connection_retries: c.connection_retries,
            failed_reconnections: c.failed_reconnections,
            successful_reconnections: c.successful_reconnections,
            success_rate_pct: snapshot.success_rate() * 100.0,
            latency: LatencySummary::from_samples(&snapshot.latency),
            connect_setup: LatencySummary::from_samples(&snapshot.connect_setup),
            handshake: LatencySummary::from_samples(&snapshot.handshake),
            reconnection: LatencySummary::from_samples(&snapshot.reconnection),
            stages: outcome.stages.iter().map(StageSummary::from).collect(),
        }
    }

    /// CSV 出力用の (Metric, Value, Unit) 行
    pub fn metric_rows(&self) -> Vec<(String, String, &'static str)> {
        let mut rows = vec![
            ("total_sessions".to_string(), self.total_sessions.to_string(), "sessions"),
            ("test_duration_seconds".to_string(), format!("{:.3}", self.duration_secs), "s"),
            ("messages_sent".to_string(), self.sent.to_string(), "messages"),
            ("messages_received".to_string(), self.received.to_string(), "messages"),
            ("messages_success".to_string(), self.success.to_string(), "messages"),
            ("messages_failed".to_string(), self.failed.to_string(), "messages"),
            ("messages_lost".to_string(), self.lost.to_string(), "messages"),
            ("error_count".to_string(), self.errors.to_string(), "errors"),
            ("connection_retries".to_string(), self.connection_retries.to_string(), "attempts"),
            ("failed_reconnections".to_string(), self.failed_reconnections.to_string(), "sessions"),
            ("successful_reconnections".to_string(), self.successful_reconnections.to_string(), "sessions"),
            ("success_rate_percent".to_string(), format!("{:.2}", self.success_rate_pct), "%"),
        ];
        for (label, summary) in [
            ("message_latency", &self.latency),
            ("websocket_connect", &self.connect_setup),
            ("stomp_connect", &self.handshake),
            ("reconnection", &self.reconnection),
        ] {
            if summary.count == 0 {
                continue;
            }
            for (suffix, value) in [
                ("avg", summary.avg_ms),
                ("min", summary.min_ms),
                ("max", summary.max_ms),
                ("med", summary.median_ms),
                ("p90", summary.p90_ms),
                ("p95", summary.p95_ms),
                ("p99", summary.p99_ms),
            ] {
                rows.push((format!("{}_{}", label, suffix), format!("{:.3}", value), "ms"));
            }
        }
        rows
    }
}

/// 結果比較レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub success_rate_change: f64,
    pub latency_p50_change_pct: f64,
    pub latency_p90_change_pct: f64,
    pub latency_p95_change_pct: f64,
    pub latency_p99_change_pct: f64,
    pub error_change: i64,
    pub improvements: Vec<String>,
    pub regressions: Vec<String>,
}

/// JSON結果をファイルに書き出す
pub fn write_json_result(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// JSON結果をファイルから読み込む
pub fn read_json_result(path: &Path) -> anyhow::Result<RunReport> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// CSV（Metric,Value,Unit）をファイルに書き出す
pub fn write_csv_result(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["Metric", "Value", "Unit"])?;
    for (metric, value, unit) in report.metric_rows() {
        writer.write_record([metric.as_str(), value.as_str(), unit])?;
    }
    writer.flush()?;
    Ok(())
}

fn summary_line(summary: &LatencySummary) -> String {
    if summary.count == 0 {
        return "no data".to_string();
    }
    format!(
        "Avg: {:7.2}ms, Min: {:7.2}ms, Max: {:8.2}ms, Med: {:7.2}ms, P90: {:7.2}ms, P95: {:7.2}ms, P99: {:7.2}ms",
        summary.avg_ms,
        summary.min_ms,
        summary.max_ms,
        summary.median_ms,
        summary.p90_ms,
        summary.p95_ms,
        summary.p99_ms,
    )
}

/// 最終結果を標準出力に表示する
pub fn display_summary(report: &RunReport) {
    let rule = "=".repeat(100);
    println!("\n{}", rule);
    println!("Load test results{}", if report.cancelled { " (cancelled)" } else { "" });
    println!("{}", rule);
    println!("  Total sessions: {}", report.total_sessions);
    println!("  Duration:       {:.1}s", report.duration_secs);
    println!(
        "  Success rate:   {:.2}% ({}/{} probes correlated)",
        report.success_rate_pct, report.success, report.sent
    );
    println!();
    println!("  Sent:     {}", report.sent);
    println!("  Received: {} (including broadcasts)", report.received);
    println!("  Success:  {}", report.success);
    println!("  Failed:   {}", report.failed);
    println!("  Lost:     {}", report.lost);
    println!("  Errors:   {}", report.errors);
    println!(
        "  Reconnects: {} ok / {} failed ({} retries)",
        report.successful_reconnections, report.failed_reconnections, report.connection_retries
    );
    println!();
    println!("  Message latency ({} samples)", report.latency.count);
    println!("    {}", summary_line(&report.latency));
    println!("  WebSocket connect");
    println!("    {}", summary_line(&report.connect_setup));
    println!("  STOMP handshake");
    println!("    {}", summary_line(&report.handshake));
    if report.reconnection.count > 0 {
        println!("  Reconnection");
        println!("    {}", summary_line(&report.reconnection));
    }
    if !report.stages.is_empty() {
        println!();
        for stage in &report.stages {
            println!(
                "  [{}] {}/{} sessions ({} failed), sent {}, ok {}, err {}, lost {}, {:.1}s",
                stage.label,
                stage.spawned,
                stage.population,
                stage.failed_sessions,
                stage.sent,
                stage.success,
                stage.errors,
                stage.lost,
                stage.elapsed_secs,
            );
        }
    }
    println!("{}", rule);
}

/// パーセンテージ変化を計算する。previous が 0 の場合は 0.0 を返す。
fn pct_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        (current - previous) / previous * 100.0
    }
}

/// 2つの実行結果を比較する
pub fn compare_reports(current: &RunReport, previous: &RunReport) -> ComparisonReport {
    let success_rate_change = current.success_rate_pct - previous.success_rate_pct;
    let latency_p50_change_pct = pct_change(current.latency.median_ms, previous.latency.median_ms);
    let latency_p90_change_pct = pct_change(current.latency.p90_ms, previous.latency.p90_ms);
    let latency_p95_change_pct = pct_change(current.latency.p95_ms, previous.latency.p95_ms);
    let latency_p99_change_pct = pct_change(current.latency.p99_ms, previous.latency.p99_ms);
    let error_change = current.errors as i64 - previous.errors as i64;

    let mut improvements = Vec::new();
    let mut regressions = Vec::new();

    // Success rate: higher is better
    if success_rate_change > 0.0 {
        improvements.push(format!("Success rate improved by {:.2} points", success_rate_change));
    } else if success_rate_change < 0.0 {
        regressions.push(format!("Success rate regressed by {:.2} points", success_rate_change.abs()));
    }

    // Latency: lower is better
    for (name, change) in [
        ("p50 latency", latency_p50_change_pct),
        ("p90 latency", latency_p90_change_pct),
        ("p95 latency", latency_p95_change_pct),
        ("p99 latency", latency_p99_change_pct),
    ] {
        if change < 0.0 {
            improvements.push(format!("{} improved by {:.1}%", name, change.abs()));
        } else if change > 0.0 {
            regressions.push(format!("{} regressed by {:.1}%", name, change));
        }
    }

    if error_change < 0 {
        improvements.push(format!("Errors decreased by {}", error_change.abs()));
    } else if error_change > 0 {
        regressions.push(format!("Errors increased by {}", error_change));
    }

    ComparisonReport {
        success_rate_change,
        latency_p50_change_pct,
        latency_p90_change_pct,
        latency_p95_change_pct,
        latency_p99_change_pct,
        error_change,
        improvements,
        regressions,
    }
}
