// STOMP frame parser using nom combinators

use std::borrow::Cow;

use nom::{
    bytes::complete::{take_till1, take_while1},
    character::complete::{char, line_ending, not_line_ending},
    IResult,
};

use super::frame::{Command, Frame, Headers, NULL};
use super::message::ChatMessage;
use crate::error::LoadTestError;

fn parse_error(message: impl Into<String>) -> LoadTestError {
    LoadTestError::ParseError(message.into())
}

/// COMMAND EOL
fn command_line(input: &str) -> IResult<&str, &str> {
    let (input, command) = take_while1(|c: char| c.is_ascii_uppercase())(input)?;
    let (input, _) = line_ending(input)?;
    Ok((input, command))
}

/// name:value EOL. The value keeps any further colons.
fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, name) = take_till1(|c: char| c == ':' || c == '\n' || c == '\r')(input)?;
    let (input, _) = char(':')(input)?;
    let (input, value) = not_line_ending(input)?;
    let (input, _) = line_ending(input)?;
    Ok((input, (name, value)))
}

/// Header lines up to and including the blank separator line.
fn header_block(mut input: &str) -> IResult<&str, Headers> {
    let mut headers = Headers::new();
    loop {
        if let Ok((rest, _)) = line_ending::<&str, nom::error::Error<&str>>(input) {
            return Ok((rest, headers));
        }
        let (rest, (name, value)) = header_line(input)?;
        headers.add(name, value);
        input = rest;
    }
}

/// Undo STOMP 1.2 header escaping. An undefined escape is a protocol error.
pub fn unescape_header(raw: &str) -> Result<Cow<'_, str>, LoadTestError> {
    if !raw.contains('\\') {
        return Ok(Cow::Borrowed(raw));
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(parse_error(format!("undefined header escape \\{}", other))),
            None => return Err(parse_error("header ends inside an escape")),
        }
    }
    Ok(Cow::Owned(out))
}

fn unescape_headers(raw: &Headers) -> Result<Headers, LoadTestError> {
    let mut headers = Headers::new();
    for (name, value) in raw.iter() {
        headers.add(unescape_header(name)?, unescape_header(value)?);
    }
    Ok(headers)
}

/// Parse one text frame. Trailing EOLs after the terminator are tolerated;
/// a frame without a terminator is accepted as-is.
pub fn parse_frame(input: &str) -> Result<Frame, LoadTestError> {
    let input = input.trim_start_matches(['\r', '\n']);
    if input.is_empty() {
        return Err(parse_error("empty frame"));
    }
    let (rest, command) =
        command_line(input).map_err(|e| parse_error(format!("invalid command line: {}", e)))?;
    let (rest, headers) =
        header_block(rest).map_err(|e| parse_error(format!("invalid header block: {}", e)))?;

    let command = Command::from_name(command);
    let headers = if command.escapes_headers() {
        unescape_headers(&headers)?
    } else {
        headers
    };

    let body = rest.trim_end_matches(['\r', '\n']);
    let body = body.strip_suffix(NULL).unwrap_or(body);

    Ok(Frame {
        command,
        headers,
        body: body.to_string(),
    })
}

/// True for the bare EOL frames brokers send as heart-beats.
pub fn is_heartbeat(input: &str) -> bool {
    input.trim_matches(['\r', '\n']).is_empty()
}

/// Decode an inbound MESSAGE frame into its chat payload. Any other frame,
/// or a body that is not a chat message, yields `None`.
pub fn decode_notification(input: &str) -> Option<ChatMessage> {
    if !input.starts_with("MESSAGE") {
        return None;
    }
    let frame = parse_frame(input).ok()?;
    if frame.command != Command::Message {
        return None;
    }
    serde_json::from_str(&frame.body).ok()
}
