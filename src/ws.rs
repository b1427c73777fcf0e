//! WebSocket clients of the event hub
//!
//! [`accept`] validates and answers the upgrade request, then hands the upgraded
//! connection to a [`ClientConnection`]. The connection runs two pumps:
//!
//! - write pump: hub queue → text frames, plus keepalive pings
//! - read pump: watches for close frames, errors, EOF and silence
//!
//! Whichever pump stops first ends the connection and unregisters the client.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::hub::{EventHub, Subscription};
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Interval between keepalive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(54);

/// A connection that sends nothing (not even a pong) for this long is considered dead
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum size of a message accepted from a browser
const MAX_MESSAGE_SIZE: usize = 512;

/// Check if a request is a WebSocket upgrade request
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let is_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && is_websocket
}

/// Allow requests without an Origin header and requests whose Origin authority
/// matches the Host header. Everything else is cross-origin.
pub fn origin_allowed(headers: &HeaderMap) -> bool {
    let origin = match headers.get(hyper::header::ORIGIN) {
        None => return true,
        Some(origin) => origin,
    };

    let host = match headers.get(hyper::header::HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => host,
        None => return false,
    };

    origin
        .to_str()
        .ok()
        .and_then(|o| o.parse::<Uri>().ok())
        .and_then(|uri| uri.authority().map(|a| a.as_str().to_string()))
        .map(|authority| authority.eq_ignore_ascii_case(host))
        .unwrap_or(false)
}

/// Answer a WebSocket upgrade and attach the connection to `hub`.
///
/// Returns the `101` response immediately; the client is registered once the
/// upgrade completes.
pub fn accept(req: Request<Incoming>, hub: EventHub) -> Response<BoxBody<Bytes, hyper::Error>> {
    if !is_websocket_upgrade(&req) {
        return json_error_response(ProxyErrorCode::BadRequest, "Expected a WebSocket upgrade");
    }

    if !origin_allowed(req.headers()) {
        warn!(
            origin = ?req.headers().get(hyper::header::ORIGIN),
            host = ?req.headers().get(hyper::header::HOST),
            "Rejected cross-origin WebSocket connection"
        );
        return json_error_response(ProxyErrorCode::ForbiddenOrigin, "Cross-origin connections are not allowed");
    }

    let key = match req.headers().get(hyper::header::SEC_WEBSOCKET_KEY) {
        Some(key) => key.as_bytes().to_vec(),
        None => {
            return json_error_response(ProxyErrorCode::BadRequest, "Missing Sec-WebSocket-Key header");
        }
    };

    let accept_key = derive_accept_key(&key);

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(error = %e, "WebSocket upgrade failed");
                return;
            }
        };

        let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        match hub.register().await {
            Ok(subscription) => ClientConnection::new(socket, subscription, hub).run().await,
            Err(e) => debug!(error = %e, "Dropping WebSocket connection"),
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "websocket");

    if let Ok(value) = HeaderValue::from_str(&accept_key) {
        response = response.header(hyper::header::SEC_WEBSOCKET_ACCEPT, value);
    }

    response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Pumps hub frames to one WebSocket connection
pub struct ClientConnection<S> {
    socket: WebSocketStream<S>,
    subscription: Subscription,
    hub: EventHub,
    ping_interval: Duration,
    read_timeout: Duration,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: WebSocketStream<S>, subscription: Subscription, hub: EventHub) -> Self {
        Self {
            socket,
            subscription,
            hub,
            ping_interval: PING_INTERVAL,
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Override keepalive timing
    pub fn with_keepalive(mut self, ping_interval: Duration, read_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.read_timeout = read_timeout;
        self
    }

    /// Run until the client goes away or the hub closes the queue
    pub async fn run(self) {
        let Self {
            socket,
            subscription,
            hub,
            ping_interval,
            read_timeout,
        } = self;
        let Subscription { id, mut receiver } = subscription;
        let (mut sink, mut stream) = socket.split();

        let write_pump = async {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + ping_interval,
                ping_interval,
            );
            loop {
                tokio::select! {
                    frame = receiver.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                debug!(client_id = id, error = %e, "WebSocket write failed");
                                return;
                            }
                        }
                        None => {
                            debug!(client_id = id, "Hub closed client queue");
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                            debug!(client_id = id, error = %e, "WebSocket ping failed");
                            return;
                        }
                    }
                }
            }
        };

        let read_pump = async {
            loop {
                match tokio::time::timeout(read_timeout, stream.next()).await {
                    Ok(Some(Ok(Message::Close(_)))) => {
                        debug!(client_id = id, "Client closed connection");
                        return;
                    }
                    Ok(Some(Ok(message))) => {
                        if message.len() > MAX_MESSAGE_SIZE {
                            debug!(client_id = id, size = message.len(), "Client message too large");
                            return;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        debug!(client_id = id, error = %e, "WebSocket read failed");
                        return;
                    }
                    Ok(None) => {
                        debug!(client_id = id, "Client connection dropped");
                        return;
                    }
                    Err(_) => {
                        debug!(client_id = id, "Client read deadline expired");
                        return;
                    }
                }
            }
        };

        tokio::select! {
            _ = write_pump => {}
            _ = read_pump => {}
        }

        if let Err(e) = hub.unregister(id).await {
            debug!(client_id = id, error = %e, "Could not unregister client");
        }
    }
}
