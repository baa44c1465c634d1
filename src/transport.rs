use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::Request;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

/// How often the socket worker wakes up to check whether it was closed.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Notifications a connection reports back to its owner, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open and the session payload has been sent.
    Opened,
    Message(String),
    Closed,
    /// The socket could not be opened.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid websocket url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to start connection worker")]
    Spawn(#[from] std::io::Error),
}

/// Opens connections to the simulation server.
pub trait Transport {
    /// Begin opening a connection. `payload` is the first message to send once
    /// the socket is up. Opening completes asynchronously and is reported as
    /// [`TransportEvent::Opened`] or [`TransportEvent::Failed`].
    ///
    /// # Errors
    ///
    /// Returns an error when the connection cannot even be attempted.
    fn open(&mut self, payload: String) -> Result<Connection, TransportError>;
}

/// The receiving end of one connection.
///
/// Dropping or closing it tells the producer to stop; anything still queued
/// is discarded with it.
#[derive(Debug)]
pub struct Connection {
    events: Receiver<TransportEvent>,
    shutdown: Arc<AtomicBool>,
}

/// The producing end of a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    events: Sender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
}

impl Connection {
    #[must_use]
    pub fn channel() -> (Connection, ConnectionHandle) {
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        (
            Connection {
                events: rx,
                shutdown: Arc::clone(&shutdown),
            },
            ConnectionHandle {
                events: tx,
                shutdown,
            },
        )
    }

    /// Next queued notification without blocking. A producer that went away
    /// without saying so reads as [`TransportEvent::Closed`].
    #[must_use]
    pub fn try_next(&self) -> Option<TransportEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(TransportEvent::Closed),
        }
    }

    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<TransportEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(TransportEvent::Closed),
        }
    }

    pub fn close(self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl ConnectionHandle {
    /// Queue a notification. Returns `false` once the connection is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        !self.is_closed() && self.events.send(event).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Websocket transport backed by `tungstenite`, one worker thread per
/// connection.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, payload: String) -> Result<Connection, TransportError> {
        let request =
            self.url
                .as_str()
                .into_client_request()
                .map_err(|err| TransportError::InvalidUrl {
                    url: self.url.clone(),
                    reason: err.to_string(),
                })?;
        let (connection, handle) = Connection::channel();
        let url = self.url.clone();
        thread::Builder::new()
            .name("odeon-ws".to_string())
            .spawn(move || run_socket(&url, request, payload, &handle))?;
        Ok(connection)
    }
}

fn run_socket(url: &str, request: Request, payload: String, handle: &ConnectionHandle) {
    let mut socket = match tungstenite::connect(request) {
        Ok((socket, _response)) => socket,
        Err(err) => {
            warn!(url, error = %err, "websocket connect failed");
            handle.send(TransportEvent::Failed(err.to_string()));
            return;
        }
    };

    if let Err(err) = socket.send(Message::Text(payload)) {
        warn!(url, error = %err, "failed to send session configuration");
        handle.send(TransportEvent::Failed(err.to_string()));
        return;
    }
    info!(url, "websocket session opened");
    if !handle.send(TransportEvent::Opened) {
        shutdown(&mut socket);
        return;
    }
    set_poll_timeout(&mut socket);

    loop {
        if handle.is_closed() {
            debug!(url, "closing websocket on request");
            shutdown(&mut socket);
            return;
        }

        let forwarded = match socket.read() {
            Ok(Message::Text(text)) => handle.send(TransportEvent::Message(text)),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => handle.send(TransportEvent::Message(text)),
                Err(_) => {
                    debug!(url, "dropping non-utf8 binary frame");
                    true
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(url, ?frame, "server closed websocket");
                handle.send(TransportEvent::Closed);
                return;
            }
            Ok(_) => true,
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                true
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                handle.send(TransportEvent::Closed);
                return;
            }
            Err(err) => {
                warn!(url, error = %err, "websocket read failed");
                handle.send(TransportEvent::Closed);
                return;
            }
        };

        if !forwarded {
            shutdown(&mut socket);
            return;
        }
    }
}

fn set_poll_timeout(socket: &mut WebSocket<MaybeTlsStream<std::net::TcpStream>>) {
    if let MaybeTlsStream::Plain(stream) = socket.get_mut()
        && let Err(err) = stream.set_read_timeout(Some(POLL_INTERVAL))
    {
        warn!(error = %err, "failed to set websocket read timeout");
    }
}

fn shutdown(socket: &mut WebSocket<MaybeTlsStream<std::net::TcpStream>>) {
    if let Err(err) = socket.close(None) {
        debug!(error = %err, "websocket close frame not sent");
    }
    // Flush the close frame; the server's reply is not awaited.
    let _ = socket.flush();
}
