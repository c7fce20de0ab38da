//! WebSocket WAMP transport.
//!
//! Accepts a classified connection handed over by the uni-socket listener,
//! runs the WebSocket upgrade on it (the buffered request bytes are
//! replayed by [`PrefixedStream`]), negotiates a `wamp.2.*` subprotocol
//! against the serializer registry, and wires the connection to a fresh
//! application session.
//!
//! When a cookie store is attached, the upgrade request is checked for a
//! live tracking cookie; connections without one get a fresh cookie on the
//! upgrade response. Each live connection is bound to its cookie for the
//! duration of the connection, and a cached cookie authentication is handed
//! to the session factory as transport-level auth.

use crate::cookie::{ConnectionId, CookieStore};
use crate::unisocket::{PrefixedStream, StreamHandler};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::header::{SEC_WEBSOCKET_PROTOCOL, SET_COOKIE};
use http::{HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use wampd_core::{
    parse_subprotocol, Serializer, SerializerRegistry, SessionFactory, TransportDetails,
    TransportHandle, TransportType, WampError, WampMessage, WampResult, WAMP_VERSION,
};

pub struct WampWebSocketServer {
    factory: Arc<dyn SessionFactory>,
    serializers: SerializerRegistry,
    cookie_store: Option<Arc<dyn CookieStore>>,
    /// Reject upgrades that do not offer a `Sec-WebSocket-Protocol`.
    require_subprotocol: bool,
    /// Hand cached cookie authentications to the session factory.
    cookie_auth: bool,
    next_connection_id: AtomicU64,
}

impl WampWebSocketServer {
    pub fn new(factory: Arc<dyn SessionFactory>, serializers: SerializerRegistry) -> Self {
        Self {
            factory,
            serializers,
            cookie_store: None,
            require_subprotocol: false,
            cookie_auth: false,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn with_cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    pub fn require_subprotocol(mut self, required: bool) -> Self {
        self.require_subprotocol = required;
        self
    }

    /// Enable recovering a cached authentication from the tracking cookie.
    /// Off by default; tracking alone never implies trusting the cookie.
    pub fn with_cookie_auth(mut self, enabled: bool) -> Self {
        self.cookie_auth = enabled;
        self
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Subprotocols offered by the client, in offer order.
fn offered_subprotocols(request: &Request) -> Vec<String> {
    let mut offers = Vec::new();
    for value in request.headers().get_all(SEC_WEBSOCKET_PROTOCOL) {
        if let Ok(raw) = value.to_str() {
            offers.extend(raw.split(',').map(|s| s.trim().to_string()));
        }
    }
    offers
}

/// Outbound half handed to the session handler.
struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Message>,
    serializer: Arc<dyn Serializer>,
    open: Arc<AtomicBool>,
}

impl TransportHandle for WebSocketTransport {
    fn send(&self, msg: WampMessage) -> WampResult<()> {
        if !self.is_open() {
            return Err(WampError::TransportLost);
        }
        let payload = self.serializer.serialize(&msg)?;
        let message = if self.serializer.is_binary() {
            Message::Binary(payload.into())
        } else {
            Message::Text(
                String::from_utf8(payload)
                    .map_err(|e| {
                        WampError::Serialization(format!("serialized payload is not UTF-8: {e}"))
                    })?
                    .into(),
            )
        };
        self.tx.send(message).map_err(|_| WampError::TransportLost)
    }

    fn close(&self) -> WampResult<()> {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Message::Close(None));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamHandler for WampWebSocketServer {
    async fn handle(&self, stream: PrefixedStream, peer: SocketAddr) -> WampResult<()> {
        let mut negotiated: Option<String> = None;
        let mut serializer_id = "json".to_string();
        let mut cbtid: Option<String> = None;
        let mut headers_received = Default::default();
        let mut headers_sent = Default::default();

        let callback = |request: &Request, mut response: Response| {
            headers_received = super::http_headers_to_map(request.headers());

            let offers = offered_subprotocols(request);
            let chosen = offers.iter().find_map(|offer| {
                let (version, sid) = parse_subprotocol(offer)?;
                (version == WAMP_VERSION && self.serializers.contains(sid))
                    .then(|| (offer.clone(), sid.to_string()))
            });
            match chosen {
                Some((subprotocol, sid)) => {
                    let value = HeaderValue::from_str(&subprotocol).map_err(|_| {
                        reject(StatusCode::BAD_REQUEST, "invalid subprotocol header")
                    })?;
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                    negotiated = Some(subprotocol);
                    serializer_id = sid;
                }
                None => {
                    if !offers.is_empty() {
                        return Err(reject(
                            StatusCode::BAD_REQUEST,
                            "none of the offered WebSocket subprotocols is supported",
                        ));
                    }
                    if self.require_subprotocol {
                        return Err(reject(
                            StatusCode::BAD_REQUEST,
                            "a wamp.2.* WebSocket subprotocol is required",
                        ));
                    }
                    // bare upgrade, assume plain JSON
                }
            }

            if let Some(store) = &self.cookie_store {
                match store.parse(request.headers()) {
                    Some(id) => cbtid = Some(id),
                    None => {
                        let (id, set_cookie) = store.create().map_err(|e| {
                            reject(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                &format!("could not create tracking cookie: {e}"),
                            )
                        })?;
                        let value = HeaderValue::from_str(&set_cookie).map_err(|_| {
                            reject(StatusCode::INTERNAL_SERVER_ERROR, "invalid cookie header")
                        })?;
                        response.headers_mut().append(SET_COOKIE, value);
                        cbtid = Some(id);
                    }
                }
            }

            headers_sent = super::http_headers_to_map(response.headers());
            Ok(response)
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = %peer, error = %e, "WebSocket upgrade failed");
                return Ok(());
            }
        };

        let serializer = self
            .serializers
            .get(&serializer_id)
            .ok_or_else(|| WampError::ProtocolNegotiation(format!("no {serializer_id} serializer")))?;

        let connection_id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst));

        let mut details = TransportDetails::new(TransportType::WebSocket);
        details.protocol = negotiated
            .clone()
            .or_else(|| Some(format!("wamp.{WAMP_VERSION}.json")));
        details.peer = Some(peer.to_string());
        details.http_headers_received = headers_received;
        details.http_headers_sent = headers_sent;
        details.cbtid = cbtid.clone();

        if let (Some(store), Some(cbtid)) = (&self.cookie_store, &cbtid) {
            let bound = store.add_connection(cbtid, connection_id);
            debug!(cbtid = %cbtid, connections = bound, "connection bound to cookie");

            if self.cookie_auth {
                let auth = store.get_auth(cbtid);
                if auth.is_authenticated() {
                    info!(
                        cbtid = %cbtid,
                        authid = auth.authid.as_deref().unwrap_or(""),
                        "authentication recovered from cookie"
                    );
                    details.auth = Some(auth);
                    details.auth_provider = Some("cookie".to_string());
                }
            }
        }

        info!(
            peer = %peer,
            protocol = details.protocol.as_deref().unwrap_or(""),
            "WebSocket transport opened"
        );

        let mut handler = self.factory.create_session(&details);
        let open = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WebSocketTransport {
            tx: tx.clone(),
            serializer: Arc::clone(&serializer),
            open: Arc::clone(&open),
        });
        handler.on_open(transport);

        let (mut sink, mut source) = ws.split();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let was_clean = 'read: loop {
            let Some(message) = source.next().await else {
                break 'read false;
            };
            let payload = match message {
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Text(text)) => text.into(),
                Ok(Message::Close(_)) => break 'read true,
                // pings are answered by the protocol layer
                Ok(_) => continue,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "WebSocket connection lost");
                    break 'read false;
                }
            };
            let messages = match serializer.unserialize(payload.as_slice()) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping connection on bad payload");
                    break 'read false;
                }
            };
            for msg in messages {
                if let Err(e) = handler.on_message(msg) {
                    warn!(peer = %peer, error = %e, "session rejected message");
                    break 'read false;
                }
            }
        };

        open.store(false, Ordering::SeqCst);
        handler.on_close(was_clean);
        let _ = tx.send(Message::Close(None));
        drop(tx);
        let _ = writer.await;

        // unbinding is unconditional, whatever way the connection ended
        if let (Some(store), Some(cbtid)) = (&self.cookie_store, &cbtid) {
            let remaining = store.drop_connection(cbtid, connection_id);
            debug!(cbtid = %cbtid, connections = remaining, "connection unbound from cookie");
        }

        info!(peer = %peer, was_clean, "WebSocket transport closed");
        Ok(())
    }
}
