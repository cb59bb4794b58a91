use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::error::LoadTestError;
use crate::stomp::{parse_frame, Command, Frame};
use crate::stomp::formatter::format_frame;
use crate::transport::{BoxFuture, Connection, Dialer, FrameSink, FrameStream};

/// テスト用のインメモリ STOMP ブローカー
/// - CONNECT に CONNECTED を返し、SUBSCRIBE を記録する
/// - SEND を同じ宛先の購読者全員に MESSAGE として配信する
/// - ダイヤル失敗・無応答ハンドシェイク・送信失敗・エコー欠落・切断・close のハングを注入できる
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    peers: Mutex<HashMap<u64, Peer>>,
    next_peer: AtomicU64,
    frames: Mutex<Vec<String>>,
    dial_count: AtomicUsize,
    fail_dials: AtomicUsize,
    should_fail_dial: AtomicBool,
    silent_handshake: AtomicBool,
    reject_handshake: AtomicBool,
    should_fail_send: AtomicBool,
    drop_echoes: AtomicBool,
    hang_on_close: AtomicBool,
}

struct Peer {
    tx: mpsc::UnboundedSender<String>,
    destination: Option<String>,
}

impl BrokerState {
    fn peers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, peer_id: u64, frame: String) {
        if let Some(peer) = self.peers().get(&peer_id) {
            let _ = peer.tx.send(frame);
        }
    }

    fn handle(&self, peer_id: u64, raw: String) -> Result<(), LoadTestError> {
        if !self.peers().contains_key(&peer_id) {
            return Err(LoadTestError::SendError("mock connection closed".to_string()));
        }
        let frame = parse_frame(&raw)?;
        let command = frame.command.clone();
        if command == Command::Send && self.should_fail_send.load(Ordering::Relaxed) {
            return Err(LoadTestError::SendError("mock send failure".to_string()));
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(raw);

        match command {
            Command::Connect => {
                if self.reject_handshake.load(Ordering::Relaxed) {
                    let error = Frame::new(Command::Error)
                        .with_header("message", "invalid token")
                        .with_body("rejected");
                    self.deliver(peer_id, format_frame(&error));
                } else if !self.silent_handshake.load(Ordering::Relaxed) {
                    // 受信側がハートビートを読み飛ばすことも確認する
                    self.deliver(peer_id, "\n".to_string());
                    let connected = Frame::new(Command::Connected)
                        .with_header("version", "1.2")
                        .with_header("heart-beat", "0,0");
                    self.deliver(peer_id, format_frame(&connected));
                }
            }
            Command::Subscribe => {
                if let Some(peer) = self.peers().get_mut(&peer_id) {
                    peer.destination = frame.headers.get("destination").map(str::to_string);
                }
            }
            Command::Send => {
                if self.drop_echoes.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let Some(publish) = frame.headers.get("destination") else {
                    return Ok(());
                };
                let room = publish.trim_start_matches("/publish/");
                let topic = format!("/topic/chat/room/{}", room);
                let notification = format_frame(
                    &Frame::new(Command::Message)
                        .with_header("destination", topic.clone())
                        .with_header("content-type", "application/json")
                        .with_header("subscription", "sub-0")
                        .with_body(frame.body.clone()),
                );
                for peer in self.peers().values() {
                    if peer.destination.as_deref() == Some(topic.as_str()) {
                        let _ = peer.tx.send(notification.clone());
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 次の `count` 回のダイヤルを失敗させる
    pub fn fail_next_dials(&self, count: usize) {
        self.state.fail_dials.store(count, Ordering::Relaxed);
    }

    /// すべてのダイヤルを失敗させる
    pub fn set_should_fail_dial(&self, fail: bool) {
        self.state.should_fail_dial.store(fail, Ordering::Relaxed);
    }

    /// CONNECT に何も返さない
    pub fn set_silent_handshake(&self, silent: bool) {
        self.state.silent_handshake.store(silent, Ordering::Relaxed);
    }

    /// CONNECT に ERROR フレームを返す
    pub fn set_reject_handshake(&self, reject: bool) {
        self.state.reject_handshake.store(reject, Ordering::Relaxed);
    }

    pub fn set_should_fail_send(&self, fail: bool) {
        self.state.should_fail_send.store(fail, Ordering::Relaxed);
    }

    /// SEND を受け付けるが配信しない
    pub fn set_drop_echoes(&self, drop: bool) {
        self.state.drop_echoes.store(drop, Ordering::Relaxed);
    }

    /// クライアントの close を永久に完了させない
    pub fn set_hang_on_close(&self, hang: bool) {
        self.state.hang_on_close.store(hang, Ordering::Relaxed);
    }

    /// 全接続をサーバー側から切断する
    pub fn disconnect_all(&self) {
        self.state.peers().clear();
    }

    /// 任意のフレームを全接続へ送り込む
    pub fn inject(&self, raw: &str) {
        for peer in self.state.peers().values() {
            let _ = peer.tx.send(raw.to_string());
        }
    }

    pub fn dial_count(&self) -> usize {
        self.state.dial_count.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.state.peers().len()
    }

    /// ブローカーが受理したフレーム
    pub fn frames(&self) -> Vec<String> {
        self.state
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 受理したフレームのうち指定コマンドの数
    pub fn count_of(&self, command: Command) -> usize {
        self.frames()
            .iter()
            .filter_map(|raw| parse_frame(raw).ok())
            .filter(|frame| frame.command == command)
            .count()
    }
}

impl Dialer for MockBroker {
    fn dial<'a>(
        &'a self,
        _endpoint: &'a str,
        _token: &'a str,
    ) -> BoxFuture<'a, Result<Connection, LoadTestError>> {
        Box::pin(async move {
            let state = &self.state;
            state.dial_count.fetch_add(1, Ordering::Relaxed);
            let scheduled_failure = state
                .fail_dials
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if scheduled_failure || state.should_fail_dial.load(Ordering::Relaxed) {
                return Err(LoadTestError::DialError("mock dial refused".to_string()));
            }

            let peer_id = state.next_peer.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::unbounded_channel();
            state.peers().insert(
                peer_id,
                Peer {
                    tx,
                    destination: None,
                },
            );

            Ok(Connection::new(
                Box::new(MockSink {
                    peer_id,
                    state: Arc::clone(state),
                }),
                Box::new(MockStream { rx }),
            ))
        })
    }
}

struct MockSink {
    peer_id: u64,
    state: Arc<BrokerState>,
}

impl FrameSink for MockSink {
    fn send_frame<'a>(&'a mut self, frame: String) -> BoxFuture<'a, Result<(), LoadTestError>> {
        Box::pin(async move { self.state.handle(self.peer_id, frame) })
    }

    fn close<'a>(&'a mut self) -> BoxFuture<'a, Result<(), LoadTestError>> {
        Box::pin(async move {
            if self.state.hang_on_close.load(Ordering::Relaxed) {
                std::future::pending::<()>().await;
            }
            self.state.peers().remove(&self.peer_id);
            Ok(())
        })
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<String>,
}

impl FrameStream for MockStream {
    fn next_frame<'a>(&'a mut self) -> BoxFuture<'a, Result<Option<String>, LoadTestError>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}
