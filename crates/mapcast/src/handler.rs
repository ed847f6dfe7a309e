//! Accept loop and per-connection handling.
//!
//! Every accepted socket is served by hyper as a single HTTP/1 exchange in
//! its own task:
//!   1. Upgrade request → subprotocol handshake → `101` → register → read
//!      frames until close → unregister
//!   2. Anything else → static router → one response → close
//!
//! Socket tasks live in a `JoinSet` owned by the accept loop, so stopping
//! the loop also cancels requests and handshakes still in flight.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use mapcast_http::{response, HttpResponse};
use mapcast_protocol::SUBPROTOCOL;
use mapcast_transport::{
    is_upgrade_request, Connection, Frame, Handshake, WebSocketConnection,
    WebSocketReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::server::Shared;
use crate::{ConnectionHandle, ServerEvent};

/// How long a client may take to send its request head.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The upgrade accepted by the request handler, picked up once hyper has
/// sent the `101` and released the socket.
type HandshakeSlot = Arc<Mutex<Option<Handshake>>>;

/// Accepts sockets until shutdown signals the loop, then cancels every
/// socket task that has not finished.
pub(crate) async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut sockets = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shared.stop_signal.notified() => break,
            Some(_) = sockets.join_next(), if !sockets.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let shared = Arc::clone(&shared);
                    sockets.spawn(handle_socket(stream, addr, shared).in_current_span());
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            },
        }
    }

    drop(listener);
    let pending = sockets.len();
    sockets.shutdown().await;
    tracing::debug!(pending, "listener closed");
}

async fn handle_socket(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
    let slot = HandshakeSlot::default();
    let service = {
        let shared = Arc::clone(&shared);
        let slot = Arc::clone(&slot);
        service_fn(move |req: Request<Incoming>| {
            let shared = Arc::clone(&shared);
            let slot = Arc::clone(&slot);
            async move { Ok::<_, Infallible>(respond(req, addr, &shared, &slot).await) }
        })
    };

    let served = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await;
    if let Err(e) = served {
        tracing::debug!(%addr, error = %e, "connection ended with error");
    }

    let handshake = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    let Some(handshake) = handshake else {
        return;
    };
    let (conn, reader) = match handshake.finish().await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "upgrade did not complete");
            return;
        }
    };

    // Nothing below awaits, so cancelling this task cannot leave a
    // registered connection without its own task.
    if shared.is_stopped() {
        tracing::debug!(conn_id = %conn.id(), %addr, "shutting down, dropping upgraded peer");
        conn.close();
        return;
    }
    shared.connection_opened();
    shared.registry.add(conn.id(), Arc::clone(&conn));
    tokio::spawn(run_connection(conn, reader, addr, shared).in_current_span());
}

/// Answers one request: either the `101` for an accepted upgrade or a
/// static response.
async fn respond(
    mut req: Request<Incoming>,
    addr: SocketAddr,
    shared: &Shared,
    slot: &HandshakeSlot,
) -> HttpResponse {
    if is_upgrade_request(&req) {
        if !shared.accepts_upgrades() {
            tracing::debug!(%addr, "upgrade requested before WebSocket is online");
            return response::bad_request("WebSocket not available");
        }
        return match Handshake::accept(&mut req, addr, SUBPROTOCOL) {
            Ok(handshake) => {
                let resp = handshake.response();
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(handshake);
                resp
            }
            Err(e) => {
                tracing::warn!(%addr, error = %e, "rejected connection");
                response::bad_request(&e.to_string())
            }
        };
    }

    let path = req.uri().path();
    let resp = shared.router.handle(path).await;
    tracing::debug!(
        %addr,
        method = %req.method(),
        path,
        status = resp.status().as_u16(),
        "served request"
    );
    resp
}

async fn run_connection(
    conn: Arc<WebSocketConnection>,
    mut reader: WebSocketReader,
    addr: SocketAddr,
    shared: Arc<Shared>,
) {
    let id = conn.id();
    let handle = ConnectionHandle::new(Arc::clone(&conn));

    if shared.is_stopped() {
        conn.close();
        shared.registry.remove(id);
        shared.connection_finished();
        return;
    }
    tracing::info!(conn_id = %id, %addr, "connection accepted");
    shared.emit(&ServerEvent::Connected(handle.clone()));

    loop {
        let frame = tokio::select! {
            _ = conn.closed() => break,
            frame = reader.recv() => frame,
        };
        match frame {
            Ok(Some(Frame::Text(text))) => dispatch_text(&shared, &handle, text),
            Ok(Some(Frame::Binary(data))) => {
                tracing::debug!(conn_id = %id, len = data.len(), "ignoring binary frame");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(conn_id = %id, error = %e, "receive failed");
                break;
            }
        }
    }

    conn.close();
    if shared.registry.remove(id).is_some() {
        tracing::info!(conn_id = %id, %addr, "peer disconnected");
        shared.emit(&ServerEvent::Disconnected(handle));
    }
    shared.connection_finished();
}

/// Routes a text frame to the typed or the untyped event.
fn dispatch_text(shared: &Shared, conn: &ConnectionHandle, text: String) {
    match mapcast_protocol::decode_detailed(&text) {
        Ok(message) => {
            tracing::debug!(conn_id = %conn.id(), kind = message.kind(), "typed message");
            shared.emit(&ServerEvent::TypedMessageReceived {
                conn: conn.clone(),
                message,
            });
        }
        Err(e) => {
            tracing::debug!(conn_id = %conn.id(), reason = %e, "untyped message");
            shared.emit(&ServerEvent::MessageReceived {
                conn: conn.clone(),
                text,
            });
        }
    }
}
