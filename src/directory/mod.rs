//! REST collaborators run before the load starts: account login and chat
//! room lookup or creation.
//!
//! Every endpoint answers with the same envelope,
//! `{"result": "SUCCESS" | "ERROR", "data": ..., "error": ...}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ChannelConfig, Credential};
use crate::error::LoadTestError;

const RESULT_SUCCESS: &str = "SUCCESS";

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    result: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    token_info: TokenInfo,
    member_info: MemberInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenInfo {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberInfo {
    member_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomSummary {
    room_id: i64,
}

/// HTTP client bound to one API base URL.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LoadTestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoadTestError::ConfigError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Log in with email and password.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, LoadTestError> {
        let url = format!("{}/v1/auth/login", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| LoadTestError::AuthError(format!("login request: {}", e)))?;

        let data: LoginData = read_envelope(response)
            .await
            .map_err(|reason| LoadTestError::AuthError(format!("login {}: {}", email, reason)))?;

        if data.token_info.access_token.is_empty() {
            return Err(LoadTestError::AuthError(format!(
                "login {}: empty access token",
                email
            )));
        }
        debug!(email, member_id = data.member_info.member_id, "logged in");
        Ok(Credential {
            token: data.token_info.access_token,
            member_id: data.member_info.member_id,
        })
    }

    /// Turn a channel selection into a concrete room id, creating the room
    /// when asked to.
    pub async fn resolve_or_create_channel(
        &self,
        channel: &ChannelConfig,
        credential: &Credential,
    ) -> Result<i64, LoadTestError> {
        let room_id = match channel {
            ChannelConfig::Fixed { id } => return Ok(*id),
            ChannelConfig::FirstJoined => {
                let url = format!("{}/v1/chat/rooms/me", self.base_url);
                let rooms: Vec<RoomSummary> = self
                    .call(self.client.get(url), credential, "room list")
                    .await?;
                rooms
                    .first()
                    .map(|r| r.room_id)
                    .ok_or_else(|| LoadTestError::ChannelError("no joined rooms".to_string()))?
            }
            ChannelConfig::Private { other_member_id } => {
                let url = format!("{}/v1/chat/rooms/private", self.base_url);
                let request = self
                    .client
                    .post(url)
                    .query(&[("otherMemberId", *other_member_id)]);
                self.call(request, credential, "private room").await?
            }
            ChannelConfig::Group { member_ids } => {
                let url = format!("{}/v1/chat/rooms/group", self.base_url);
                let query: Vec<(&str, i64)> = other_member_ids(member_ids, credential.member_id)
                    .into_iter()
                    .map(|id| ("otherMemberIds", id))
                    .collect();
                let request = self.client.post(url).query(&query);
                self.call(request, credential, "group room").await?
            }
        };
        info!(room_id, "chat room resolved");
        Ok(room_id)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        credential: &Credential,
        what: &str,
    ) -> Result<T, LoadTestError> {
        let response = request
            .bearer_auth(&credential.token)
            .send()
            .await
            .map_err(|e| LoadTestError::ChannelError(format!("{} request: {}", what, e)))?;
        read_envelope(response)
            .await
            .map_err(|reason| LoadTestError::ChannelError(format!("{}: {}", what, reason)))
    }
}

/// Group members minus the caller, who the server adds on its own.
pub fn other_member_ids(member_ids: &[i64], own_id: i64) -> Vec<i64> {
    member_ids.iter().copied().filter(|id| *id != own_id).collect()
}

async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("reading body: {}", e))?;
    if !status.is_success() {
        return Err(format!("status {}: {}", status.as_u16(), body));
    }
    parse_envelope(&body)
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<T, String> {
    let envelope: ApiEnvelope<T> =
        serde_json::from_str(body).map_err(|e| format!("malformed response: {}", e))?;
    if envelope.result != RESULT_SUCCESS {
        let detail = envelope
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no detail".to_string());
        return Err(format!("result {}: {}", envelope.result, detail));
    }
    envelope.data.ok_or_else(|| "response has no data".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 stub: answers every request with the same status and
    /// body and keeps the request heads it saw.
    struct HttpStub {
        base_url: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    async fn spawn_stub(status: u16, body: &'static str) -> HttpStub {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).to_string();
                        if let Some(head_end) = text.find("\r\n\r\n") {
                            let content_length = text[..head_end]
                                .lines()
                                .find_map(|l| {
                                    let lower = l.to_ascii_lowercase();
                                    lower
                                        .strip_prefix("content-length:")
                                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                })
                                .unwrap_or(0);
                            if buf.len() >= head_end + 4 + content_length {
                                seen.lock().unwrap().push(text);
                                break;
                            }
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        HttpStub {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    fn client(stub: &HttpStub) -> DirectoryClient {
        DirectoryClient::new(&stub.base_url, Duration::from_secs(5)).unwrap()
    }

    fn cred() -> Credential {
        Credential {
            token: "tok-1".to_string(),
            member_id: 7,
        }
    }

    #[tokio::test]
    async fn test_login_success() {
        let stub = spawn_stub(
            200,
            r#"{"result":"SUCCESS","data":{"tokenInfo":{"accessToken":"abc","refreshToken":"r"},"memberInfo":{"memberId":42,"memberName":"n"}},"error":null}"#,
        )
        .await;
        let credential = client(&stub).login("a@example.com", "pw").await.unwrap();
        assert_eq!(credential.token, "abc");
        assert_eq!(credential.member_id, 42);

        let requests = stub.requests.lock().unwrap();
        assert!(requests[0].starts_with("POST /v1/auth/login "));
        assert!(requests[0].contains(r#""email":"a@example.com""#));
    }

    #[tokio::test]
    async fn test_login_non_success_result() {
        let stub = spawn_stub(200, r#"{"result":"ERROR","data":null,"error":{"code":"BAD"}}"#).await;
        let err = client(&stub).login("a@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, LoadTestError::AuthError(ref m) if m.contains("BAD")));
    }

    #[tokio::test]
    async fn test_login_http_error_status() {
        let stub = spawn_stub(401, r#"{"result":"ERROR"}"#).await;
        let err = client(&stub).login("a@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, LoadTestError::AuthError(ref m) if m.contains("401")));
    }

    #[tokio::test]
    async fn test_login_empty_token() {
        let stub = spawn_stub(
            200,
            r#"{"result":"SUCCESS","data":{"tokenInfo":{"accessToken":""},"memberInfo":{"memberId":1}}}"#,
        )
        .await;
        assert!(matches!(
            client(&stub).login("a@example.com", "pw").await,
            Err(LoadTestError::AuthError(_))
        ));
    }

    #[tokio::test]
    async fn test_login_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = DirectoryClient::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.login("a@example.com", "pw").await,
            Err(LoadTestError::AuthError(_))
        ));
    }

    #[tokio::test]
    async fn test_fixed_channel_makes_no_request() {
        let stub = spawn_stub(500, "{}").await;
        let id = client(&stub)
            .resolve_or_create_channel(&ChannelConfig::Fixed { id: 99 }, &cred())
            .await
            .unwrap();
        assert_eq!(id, 99);
        assert!(stub.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_joined_picks_first_room() {
        let stub = spawn_stub(
            200,
            r#"{"result":"SUCCESS","data":[{"roomId":11,"unreadCount":0,"chatRoomType":"GROUP"},{"roomId":12}]}"#,
        )
        .await;
        let id = client(&stub)
            .resolve_or_create_channel(&ChannelConfig::FirstJoined, &cred())
            .await
            .unwrap();
        assert_eq!(id, 11);

        let requests = stub.requests.lock().unwrap();
        assert!(requests[0].starts_with("GET /v1/chat/rooms/me "));
        assert!(requests[0].to_ascii_lowercase().contains("authorization: bearer tok-1"));
    }

    #[tokio::test]
    async fn test_first_joined_without_rooms() {
        let stub = spawn_stub(200, r#"{"result":"SUCCESS","data":[]}"#).await;
        let err = client(&stub)
            .resolve_or_create_channel(&ChannelConfig::FirstJoined, &cred())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadTestError::ChannelError(_)));
    }

    #[tokio::test]
    async fn test_private_room_creation() {
        let stub = spawn_stub(201, r#"{"result":"SUCCESS","data":501}"#).await;
        let id = client(&stub)
            .resolve_or_create_channel(&ChannelConfig::Private { other_member_id: 3 }, &cred())
            .await
            .unwrap();
        assert_eq!(id, 501);
        let requests = stub.requests.lock().unwrap();
        assert!(requests[0].starts_with("POST /v1/chat/rooms/private?otherMemberId=3 "));
    }

    #[tokio::test]
    async fn test_group_room_excludes_own_id() {
        let stub = spawn_stub(200, r#"{"result":"SUCCESS","data":77}"#).await;
        let channel = ChannelConfig::Group {
            member_ids: vec![7, 8, 9],
        };
        let id = client(&stub)
            .resolve_or_create_channel(&channel, &cred())
            .await
            .unwrap();
        assert_eq!(id, 77);
        let requests = stub.requests.lock().unwrap();
        assert!(requests[0]
            .starts_with("POST /v1/chat/rooms/group?otherMemberIds=8&otherMemberIds=9 "));
    }

    #[tokio::test]
    async fn test_channel_error_on_failure_status() {
        let stub = spawn_stub(500, "boom").await;
        let err = client(&stub)
            .resolve_or_create_channel(&ChannelConfig::Private { other_member_id: 3 }, &cred())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadTestError::ChannelError(ref m) if m.contains("500")));
    }

    #[test]
    fn test_other_member_ids() {
        assert_eq!(other_member_ids(&[1, 2, 3, 2], 2), vec![1, 3]);
        assert!(other_member_ids(&[5], 5).is_empty());
    }

    #[test]
    fn test_parse_envelope_missing_data() {
        let result: Result<i64, String> = parse_envelope(r#"{"result":"SUCCESS"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_envelope_malformed() {
        let result: Result<i64, String> = parse_envelope("not json");
        assert!(result.unwrap_err().contains("malformed"));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = DirectoryClient::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
