use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use stomp_load_test::config::{Config, Credential, StageSpec};
use stomp_load_test::connection::ConnectionManager;
use stomp_load_test::reporter::{write_csv_result, write_json_result, RunReport};
use stomp_load_test::scheduler::{SessionSource, StageScheduler};
use stomp_load_test::session::SessionContext;
use stomp_load_test::stats::MetricsAggregator;
use stomp_load_test::stomp::formatter::format_frame;
use stomp_load_test::stomp::{parse_frame, Command, Frame};
use stomp_load_test::tracker::LatencyTracker;
use stomp_load_test::transport::WsDialer;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const ROOM: i64 = 42;

/// Single-room STOMP broker over a real WebSocket listener. Every SEND is
/// fanned out as MESSAGE to every subscribed connection.
async fn spawn_broker(reject: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (room_tx, _) = broadcast::channel::<String>(1024);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let room_tx = room_tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut ws_tx, mut ws_rx) = ws.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

                tokio::spawn(async move {
                    while let Some(text) = out_rx.recv().await {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.close().await;
                });

                while let Some(Ok(msg)) = ws_rx.next().await {
                    let Message::Text(raw) = msg else {
                        if msg.is_close() {
                            break;
                        }
                        continue;
                    };
                    let Ok(frame) = parse_frame(&raw) else {
                        continue;
                    };
                    match frame.command {
                        Command::Connect if reject => {
                            let error = Frame::new(Command::Error)
                                .with_header("message", "invalid token");
                            let _ = out_tx.send(format_frame(&error));
                        }
                        Command::Connect => {
                            let connected = Frame::new(Command::Connected)
                                .with_header("version", "1.2")
                                .with_header("heart-beat", "0,0");
                            let _ = out_tx.send(format_frame(&connected));
                        }
                        Command::Subscribe => {
                            let mut room_rx = room_tx.subscribe();
                            let out = out_tx.clone();
                            tokio::spawn(async move {
                                while let Ok(notification) = room_rx.recv().await {
                                    if out.send(notification).is_err() {
                                        break;
                                    }
                                }
                            });
                        }
                        Command::Send => {
                            let message = Frame::new(Command::Message)
                                .with_header("destination", format!("/topic/chat/room/{}", ROOM))
                                .with_header("content-type", "application/json")
                                .with_body(frame.body.clone());
                            let _ = room_tx.send(format_frame(&message));
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{}", addr)
}

fn test_config(server_url: String, population: u32, hold_secs: u64) -> Config {
    Config {
        server_url,
        token: Some("e2e-token".to_string()),
        member_id: Some(7),
        probe_interval_ms: 100,
        traffic_tiers: false,
        read_deadline_ms: 200,
        dial_timeout_secs: 5,
        handshake_timeout_secs: 5,
        pending_timeout_secs: 5,
        ramp_up_secs: 1,
        stage_pause_secs: 0,
        progress_interval_secs: 1,
        stages: vec![StageSpec {
            population,
            label: "e2e".to_string(),
            hold_secs,
        }],
        ..Default::default()
    }
}

fn build_scheduler(cfg: &Config) -> (StageScheduler, Arc<MetricsAggregator>) {
    let stats = Arc::new(MetricsAggregator::new());
    let ctx = SessionContext {
        connections: Arc::new(ConnectionManager::new(Arc::new(WsDialer), Arc::clone(&stats))),
        tracker: Arc::new(LatencyTracker::new()),
        stats: Arc::clone(&stats),
    };
    let credential = Credential {
        token: "e2e-token".to_string(),
        member_id: 7,
    };
    let source = SessionSource::Shared(cfg.base_session_config(credential, ROOM));
    let scheduler = StageScheduler::new(cfg.stages.clone(), cfg.schedule(), source, ctx);
    (scheduler, stats)
}

#[tokio::test]
async fn test_probes_round_trip_through_websocket_broker() {
    let url = spawn_broker(false).await;
    let cfg = test_config(url, 3, 2);
    let (scheduler, stats) = build_scheduler(&cfg);

    let outcome = tokio::time::timeout(Duration::from_secs(15), scheduler.run(CancellationToken::new()))
        .await
        .expect("run should finish after its single stage");

    assert!(!outcome.cancelled);
    assert_eq!(outcome.stages.len(), 1);
    assert_eq!(outcome.stages[0].spawned, 3);
    assert_eq!(outcome.stages[0].failed, 0);

    let snapshot = stats.snapshot();
    let c = snapshot.counters;
    assert!(c.sent > 0, "sessions should have sent probes");
    assert!(c.success > 0, "some probes should have been correlated");
    assert!(c.success <= c.sent);
    // every connection sees every broadcast, its own and its peers'
    assert!(c.received >= c.success);
    assert_eq!(c.errors, 0);
    assert_eq!(c.active_sessions, 0);
    assert_eq!(snapshot.connect_setup.len(), 3);
    assert_eq!(snapshot.handshake.len(), 3);
    assert_eq!(snapshot.latency.len() as u64, c.success);
}

#[tokio::test]
async fn test_rejected_handshake_fails_sessions_without_probes() {
    let url = spawn_broker(true).await;
    let mut cfg = test_config(url, 2, 1);
    cfg.reconnect.enabled = false;
    let (scheduler, stats) = build_scheduler(&cfg);

    let outcome = tokio::time::timeout(Duration::from_secs(15), scheduler.run(CancellationToken::new()))
        .await
        .expect("run should finish");

    assert_eq!(outcome.stages[0].spawned, 2);
    assert_eq!(outcome.stages[0].failed, 2);
    let c = stats.counters();
    assert_eq!(c.sent, 0);
    assert_eq!(c.success, 0);
    assert!(stats.snapshot().handshake.is_empty());
}

#[tokio::test]
async fn test_cancelled_run_still_produces_report() {
    let url = spawn_broker(false).await;
    let cfg = test_config(url, 2, 60);
    let (scheduler, stats) = build_scheduler(&cfg);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let started_at = chrono::Utc::now();
    let outcome = tokio::time::timeout(Duration::from_secs(15), scheduler.run(cancel))
        .await
        .expect("cancelled run should drain promptly");
    let finished_at = chrono::Utc::now();

    assert!(outcome.cancelled);
    assert!(outcome.elapsed < Duration::from_secs(10));

    let report = RunReport::build(&outcome, &stats.snapshot(), started_at, finished_at);
    assert!(report.cancelled);
    assert_eq!(report.total_sessions, 2);
    assert_eq!(report.failed, report.sent - report.success);

    let dir = tempfile::tempdir().unwrap();
    let json_path = dir.path().join("result.json");
    let csv_path = dir.path().join("result.csv");
    write_json_result(&report, &json_path).unwrap();
    write_csv_result(&report, &csv_path).unwrap();

    let csv = std::fs::read_to_string(&csv_path).unwrap();
    assert!(csv.starts_with("Metric,Value,Unit"));
    assert!(csv.contains("total_sessions,2,sessions"));
}
