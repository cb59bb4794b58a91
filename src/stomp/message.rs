use serde::{Deserialize, Serialize};

/// Chat message kinds accepted by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Image,
    Video,
    File,
    Audio,
    System,
}

/// JSON body of SEND and MESSAGE frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_id: i64,
    pub sender_id: i64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    #[serde(default)]
    pub created_at: String,
}

impl ChatMessage {
    pub fn text(room_id: i64, sender_id: i64, content: impl Into<String>, created_at: String) -> Self {
        Self {
            room_id,
            sender_id,
            message_type: MessageType::Text,
            content: content.into(),
            file_url: None,
            file_name: None,
            file_size: None,
            created_at,
        }
    }
}

/// Correlation key for probe `nonce` of session `session_id`: `W<id>-N<nonce>`.
pub fn make_key(session_id: u64, nonce: u64) -> String {
    let mut ids = itoa::Buffer::new();
    let mut key = String::with_capacity(24);
    key.push('W');
    key.push_str(ids.format(session_id));
    key.push_str("-N");
    key.push_str(ids.format(nonce));
    key
}

/// Prefix shared by every key of one session.
pub fn key_prefix(session_id: u64) -> String {
    let mut ids = itoa::Buffer::new();
    let mut prefix = String::with_capacity(16);
    prefix.push('W');
    prefix.push_str(ids.format(session_id));
    prefix.push('-');
    prefix
}

/// Content of a probe message; the key sits in the leading brackets.
pub fn probe_content(key: &str, session_id: u64) -> String {
    format!("[{}] Test message from worker {}", key, session_id)
}

/// Pull the bracketed correlation key off the front of `content`.
/// Returns an empty string when there is none.
pub fn extract_key(content: &str) -> &str {
    if !content.starts_with('[') {
        return "";
    }
    match content.find(']') {
        Some(end) if end > 1 => &content[1..end],
        _ => "",
    }
}
