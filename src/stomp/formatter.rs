// STOMP frame formatter
// Serializes frames into the text form the broker expects over WebSocket.

use chrono::{DateTime, SecondsFormat, Utc};

use super::frame::{Command, Frame, NULL};
use super::message::ChatMessage;
use crate::error::LoadTestError;

pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";
/// Outgoing / incoming heart-beat in milliseconds offered on CONNECT.
pub const HEART_BEAT: (u32, u32) = (10_000, 10_000);

fn needs_escape(b: u8) -> bool {
    matches!(b, b'\\' | b'\n' | b'\r' | b':')
}

fn escaped_len(s: &str) -> usize {
    s.len() + s.bytes().filter(|b| needs_escape(*b)).count()
}

fn push_escaped(out: &mut String, s: &str) {
    if !s.bytes().any(needs_escape) {
        out.push_str(s);
        return;
    }
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
}

pub fn estimate_frame_size(frame: &Frame) -> usize {
    let escape = frame.command.escapes_headers();
    let mut size = frame.command.as_str().len() + 1;
    for (name, value) in frame.headers.iter() {
        size += if escape {
            escaped_len(name) + 1 + escaped_len(value) + 1
        } else {
            name.len() + 1 + value.len() + 1
        };
    }
    size + 1 + frame.body.len() + 1
}

/// Format a frame: command line, `name:value` header lines, blank line,
/// body, terminator. Header escaping follows STOMP 1.2.
pub fn format_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(estimate_frame_size(frame));
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in frame.headers.iter() {
        if escape {
            push_escaped(&mut out, name);
            out.push(':');
            push_escaped(&mut out, value);
        } else {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push(NULL);
    out
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Subscription destination for a chat room.
pub fn room_destination(channel_id: i64) -> String {
    let mut buf = itoa::Buffer::new();
    format!("/topic/chat/room/{}", buf.format(channel_id))
}

/// Publish destination for a chat room.
pub fn publish_destination(channel_id: i64) -> String {
    let mut buf = itoa::Buffer::new();
    format!("/publish/{}", buf.format(channel_id))
}

/// CONNECT frame. An empty token still yields a frame; the broker rejects it.
pub fn encode_connect(token: &str) -> String {
    let mut hb = itoa::Buffer::new();
    let mut heart_beat = String::from(hb.format(HEART_BEAT.0));
    heart_beat.push(',');
    heart_beat.push_str(hb.format(HEART_BEAT.1));

    format_frame(
        &Frame::new(Command::Connect)
            .with_header("Authorization", bearer(token))
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("heart-beat", heart_beat),
    )
}

/// SUBSCRIBE frame. Each connection carries exactly one subscription, so
/// `sub-<session id>` is unique per connection.
pub fn encode_subscribe(session_id: u64, token: &str, channel_id: i64) -> String {
    let mut buf = itoa::Buffer::new();
    let sub_id = format!("sub-{}", buf.format(session_id));
    format_frame(
        &Frame::new(Command::Subscribe)
            .with_header("id", sub_id)
            .with_header("Authorization", bearer(token))
            .with_header("destination", room_destination(channel_id)),
    )
}

/// SEND frame carrying a TEXT chat message stamped with the current time.
pub fn encode_send(
    token: &str,
    channel_id: i64,
    sender_id: i64,
    content: &str,
) -> Result<String, LoadTestError> {
    encode_send_at(token, channel_id, sender_id, content, Utc::now())
}

pub fn encode_send_at(
    token: &str,
    channel_id: i64,
    sender_id: i64,
    content: &str,
    created_at: DateTime<Utc>,
) -> Result<String, LoadTestError> {
    let message = ChatMessage::text(
        channel_id,
        sender_id,
        content,
        created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    let body = serde_json::to_string(&message)?;
    Ok(format_frame(
        &Frame::new(Command::Send)
            .with_header("Authorization", bearer(token))
            .with_header("destination", publish_destination(channel_id))
            .with_header("content-type", "application/json")
            .with_body(body),
    ))
}
