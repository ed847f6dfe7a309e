//! WebSocket upgrade and connection handles using `tokio-tungstenite`.
//!
//! The upgrade runs inside a `hyper` HTTP/1 connection: [`Handshake::accept`]
//! validates the request and produces the `101` response, and once hyper
//! has written it, [`Handshake::finish`] takes over the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::Instrument;

use crate::{Connection, ConnectionId, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = WebSocketStream<TokioIo<Upgraded>>;

/// A data frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Whether `req` asks to switch to the WebSocket protocol.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}

/// An accepted upgrade request waiting for its `101` response to be sent.
pub struct Handshake {
    remote_addr: SocketAddr,
    subprotocol: &'static str,
    accept_key: HeaderValue,
    on_upgrade: OnUpgrade,
}

impl Handshake {
    /// Validates an upgrade request.
    ///
    /// The client must send a `GET` with `Sec-WebSocket-Version: 13`, a
    /// `Sec-WebSocket-Key`, and offer `subprotocol` in
    /// `Sec-WebSocket-Protocol`.
    ///
    /// # Errors
    /// Returns [`TransportError::HandshakeRejected`] naming the first
    /// requirement that was not met. The caller answers with a `400`.
    pub fn accept<B>(
        req: &mut Request<B>,
        remote_addr: SocketAddr,
        subprotocol: &'static str,
    ) -> Result<Self, TransportError> {
        let reject = |reason: &str| TransportError::HandshakeRejected(reason.into());

        if req.method() != Method::GET {
            return Err(reject("upgrade must be a GET request"));
        }
        let headers = req.headers();
        let version = headers.get(SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes);
        if version != Some(&b"13"[..]) {
            return Err(reject("unsupported WebSocket version"));
        }
        let key = headers
            .get(SEC_WEBSOCKET_KEY)
            .ok_or_else(|| reject("missing Sec-WebSocket-Key"))?;
        if !offers_subprotocol(headers, subprotocol) {
            return Err(TransportError::HandshakeRejected(format!(
                "subprotocol `{subprotocol}` required"
            )));
        }
        let accept_key = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
            .map_err(|_| reject("unusable Sec-WebSocket-Key"))?;

        Ok(Self {
            remote_addr,
            subprotocol,
            accept_key,
            on_upgrade: hyper::upgrade::on(req),
        })
    }

    /// The `101 Switching Protocols` response to hand back to hyper.
    pub fn response(&self) -> Response<Full<Bytes>> {
        let mut resp = Response::new(Full::default());
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = resp.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, self.accept_key.clone());
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(self.subprotocol),
        );
        resp
    }

    /// Waits for hyper to release the socket and wraps it as a WebSocket.
    ///
    /// Returns the shared sending half and the receiving half. A writer
    /// task is spawned that drains the connection's outbound queue.
    ///
    /// # Errors
    /// Returns [`TransportError::UpgradeFailed`] if the HTTP connection
    /// ended before the `101` response went out.
    pub async fn finish(
        self,
    ) -> Result<(Arc<WebSocketConnection>, WebSocketReader), TransportError> {
        let upgraded = self
            .on_upgrade
            .await
            .map_err(|e| TransportError::UpgradeFailed(e.to_string()))?;
        let ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                .await;

        let id =
            ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let remote_addr = self.remote_addr;
        tracing::debug!(%id, %remote_addr, "upgraded WebSocket connection");

        let (sink, stream) = ws.split();
        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(id, sink, rx).in_current_span());

        let conn = Arc::new(WebSocketConnection {
            id,
            remote_addr,
            outbound,
            open: AtomicBool::new(true),
            close_signal: Notify::new(),
        });
        Ok((conn, WebSocketReader { id, stream }))
    }
}

fn offers_subprotocol(headers: &HeaderMap, subprotocol: &str) -> bool {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offered| offered.trim() == subprotocol)
}

/// Forwards queued frames to the socket until the queue closes or a close
/// frame has been written.
async fn run_writer(
    id: ConnectionId,
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            tracing::debug!(%id, error = %e, "write failed, stopping writer");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// The sending half of an upgraded WebSocket connection.
///
/// Shared via `Arc` between the registry, event handlers, and the task
/// reading from the peer.
#[derive(Debug)]
pub struct WebSocketConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
    close_signal: Notify,
}

impl WebSocketConnection {
    /// The peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Resolves once [`close`](Connection::close) has been called.
    pub async fn closed(&self) {
        if !self.is_open() {
            return;
        }
        self.close_signal.notified().await;
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed(self.id.to_string()));
        }
        self.outbound
            .send(Message::text(text.to_owned()))
            .map_err(|_| TransportError::ConnectionClosed(self.id.to_string()))
    }

    fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        // The writer may already be gone if the peer hung up first.
        let _ = self.outbound.send(Message::Close(None));
        self.close_signal.notify_one();
        true
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// The receiving half of an upgraded WebSocket connection.
pub struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WsStream>,
}

impl WebSocketReader {
    /// The id of the connection this reader belongs to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Receives the next data frame from the peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed. Control
    /// frames are answered by the library and skipped here.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Frame::Binary(data.to_vec())));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/raw frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            e,
                        ),
                    ));
                }
            }
        }
    }
}
