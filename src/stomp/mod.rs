// STOMP 1.2 codec for the chat broker: frame model, nom parser, formatter
// and the chat payload carried inside SEND / MESSAGE bodies.

pub mod formatter;
pub mod frame;
pub mod message;
pub mod parser;

pub use formatter::{encode_connect, encode_send, encode_subscribe};
pub use frame::{Command, Frame, Headers};
pub use message::{extract_key, make_key, ChatMessage, MessageType};
pub use parser::{decode_notification, parse_frame};
