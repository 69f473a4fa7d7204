//! Transport Layer
//!
//! Single responsibility: open a duplex text channel, push frames out, report
//! what happens to it. No knowledge of frames, authentication or state.
//!
//! A transport is opened with an [`EventSink`] and reports, in order:
//! `Open` once the socket is usable, any number of `Message`/`Error`, and
//! exactly one `Closed` at the end (also when the connect itself fails).

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
};
use tracing::debug;

use crate::error::ClientError;

/// Close code and reason reported by the peer, when it sent any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed(Option<CloseInfo>),
}

/// Event tagged with the connection epoch it came from.
pub(crate) type TaggedEvent = (u64, TransportEvent);

/// Where a transport reports its events.
///
/// Each `connect()` hands out a sink bound to a fresh epoch, so events from a
/// superseded transport can be told apart.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { epoch, tx }
    }

    /// Deliver an event. Returns `false` once the client has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Handle to one opened transport.
pub trait TransportHandle: Send + Sync {
    /// Queue a text frame for transmission.
    fn send(&self, frame: String) -> Result<(), ClientError>;

    /// Begin closing. The transport reports `Closed` when done.
    fn close(&self);
}

/// Factory for transports.
pub trait Transport: Send + Sync + 'static {
    /// Start opening `url`. An `Err` means the transport could not even be
    /// constructed; no events will follow.
    fn open(&self, url: &str, events: EventSink) -> Result<Box<dyn TransportHandle>, ClientError>;
}

/// How long a closing socket waits for the peer to answer the close frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsTransport {
    close_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

enum Outbound {
    Frame(String),
    Close,
}

struct WsHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle for WsHandle {
    fn send(&self, frame: String) -> Result<(), ClientError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ClientError::Transport("Socket task has exited".into()))
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Transport for WsTransport {
    fn open(&self, url: &str, events: EventSink) -> Result<Box<dyn TransportHandle>, ClientError> {
        let request = build_request(url)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(socket_task(
            url.to_string(),
            request,
            outbound_rx,
            events,
            self.close_timeout,
        ));

        Ok(Box::new(WsHandle {
            outbound: outbound_tx,
        }))
    }
}

fn build_request(url: &str) -> Result<Request<()>, ClientError> {
    Request::builder()
        .uri(url)
        .header("Host", extract_host(url))
        .header("Origin", "http://localhost")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|e| ClientError::Transport(format!("Failed to build request: {}", e)))
}

/// Runs one socket from connect to close.
async fn socket_task(
    url: String,
    request: Request<()>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventSink,
    close_timeout: Duration,
) {
    debug!(url = %url, epoch = events.epoch(), "Connecting to WebSocket");

    let ws = match connect_async_with_config(request, None, false).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            events.emit(TransportEvent::Error(format!("WebSocket connect failed: {}", e)));
            events.emit(TransportEvent::Closed(None));
            return;
        }
    };

    debug!(url = %url, "WebSocket connected");
    events.emit(TransportEvent::Open);

    let (mut sink, mut stream) = ws.split();
    let mut close_deadline: Option<Instant> = None;
    let mut close_info = None;

    loop {
        tokio::select! {
            cmd = outbound.recv(), if close_deadline.is_none() => match cmd {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        events.emit(TransportEvent::Error(format!("Failed to send: {}", e)));
                        break;
                    }
                }
                // Handle dropped counts as a close request
                Some(Outbound::Close) | None => {
                    close_deadline = Some(Instant::now() + close_timeout);
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(error = %e, "Close handshake could not be sent");
                        break;
                    }
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    events.emit(TransportEvent::Message(text));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        events.emit(TransportEvent::Message(text));
                    }
                    Err(_) => debug!("Skipping non UTF-8 binary message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    close_info = frame.map(|f| CloseInfo {
                        code: u16::from(f.code),
                        reason: f.reason.into_owned(),
                    });
                    // tungstenite answers the close; the stream ends next
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    events.emit(TransportEvent::Error(format!("WebSocket error: {}", e)));
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(close_deadline.unwrap_or_else(Instant::now)),
                if close_deadline.is_some() =>
            {
                debug!(url = %url, "Peer did not finish the close handshake");
                break;
            }
        }
    }

    debug!(url = %url, "WebSocket task ended");
    events.emit(TransportEvent::Closed(close_info));
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
