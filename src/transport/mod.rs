// WebSocket transport module
//
// Sessions talk to the broker through the Dialer / FrameSink / FrameStream
// traits so tests can swap in an in-memory broker.

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::LoadTestError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Write half of a connection. Only the send loop writes.
pub trait FrameSink: Send {
    fn send_frame<'a>(&'a mut self, frame: String) -> BoxFuture<'a, Result<(), LoadTestError>>;

    fn close<'a>(&'a mut self) -> BoxFuture<'a, Result<(), LoadTestError>>;
}

/// Read half of a connection. Only the receive loop reads.
///
/// `Ok(None)` means the peer closed the connection. Dropping the returned
/// future before it completes must not lose a frame.
pub trait FrameStream: Send {
    fn next_frame<'a>(&'a mut self) -> BoxFuture<'a, Result<Option<String>, LoadTestError>>;
}

pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl Connection {
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self { sink, stream }
    }

    pub fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (self.sink, self.stream)
    }
}

/// Opens transport-level connections to the broker endpoint.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        endpoint: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Connection, LoadTestError>>;
}

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dialer backed by tokio-tungstenite. The bearer token is also sent on
/// the upgrade request.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsDialer;

impl WsDialer {
    pub fn new() -> Self {
        Self
    }
}

impl Dialer for WsDialer {
    fn dial<'a>(
        &'a self,
        endpoint: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Connection, LoadTestError>> {
        Box::pin(async move {
            let mut request = endpoint
                .into_client_request()
                .map_err(|e| LoadTestError::DialError(format!("invalid endpoint '{}': {}", endpoint, e)))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| LoadTestError::DialError(format!("invalid token header: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);

            let (ws, _response) = connect_async(request)
                .await
                .map_err(|e| LoadTestError::DialError(e.to_string()))?;
            let (sink, stream) = ws.split();

            Ok(Connection::new(
                Box::new(WsFrameSink { inner: sink }),
                Box::new(WsFrameStream { inner: stream }),
            ))
        })
    }
}

struct WsFrameSink {
    inner: SplitSink<WsConnection, Message>,
}

impl FrameSink for WsFrameSink {
    fn send_frame<'a>(&'a mut self, frame: String) -> BoxFuture<'a, Result<(), LoadTestError>> {
        Box::pin(async move {
            self.inner
                .send(Message::Text(frame))
                .await
                .map_err(|e| LoadTestError::SendError(e.to_string()))
        })
    }

    fn close<'a>(&'a mut self) -> BoxFuture<'a, Result<(), LoadTestError>> {
        Box::pin(async move {
            match self.inner.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(LoadTestError::SendError(e.to_string())),
            }
        })
    }
}

struct WsFrameStream {
    inner: SplitStream<WsConnection>,
}

impl FrameStream for WsFrameStream {
    fn next_frame<'a>(&'a mut self) -> BoxFuture<'a, Result<Option<String>, LoadTestError>> {
        Box::pin(async move {
            loop {
                match self.inner.next().await {
                    None => return Ok(None),
                    Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                    Some(Ok(Message::Binary(bytes))) => {
                        return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                    }
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // ping/pong are answered by tungstenite itself
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                        return Ok(None)
                    }
                    Some(Err(e)) => return Err(LoadTestError::ReceiveError(e.to_string())),
                }
            }
        })
    }
}
