//! HTTP long-poll WAMP transport.
//!
//! Emulates a bidirectional WAMP transport over plain HTTP for clients
//! without WebSocket. A client opens a transport (`POST /open`), then pumps
//! messages through `POST /<transport>/send` and fetches them with
//! `POST /<transport>/receive`. A receive with nothing queued parks until a
//! message arrives; at most one receive may be parked per transport. An
//! inactivity reaper closes transports whose client stopped polling.
//!
//! Every state transition happens under a transport-local lock with no
//! await point inside, so concurrent send/receive/close requests always
//! observe a consistent queue.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wampd_core::{
    newid, parse_subprotocol, Serializer, SerializerRegistry, SessionFactory, SessionHandler,
    TransportDetails, TransportHandle, TransportType, WampError, WampResult, WAMP_VERSION,
};

const TRANSPORT_ID_LENGTH: usize = 24;
/// Open request bodies are tiny; anything bigger is not a WAMP client.
const MAX_OPEN_BODY: usize = 64 * 1024;

/// Long-poll transport options.
#[derive(Debug, Clone)]
pub struct LongPollOptions {
    /// Close a transport after this long without any client request.
    /// Zero disables the reaper.
    pub kill_after: Duration,
    /// Close a transport once its outbound queue exceeds this many bytes.
    pub queue_limit_bytes: usize,
    /// Close a transport once its outbound queue exceeds this many messages.
    pub queue_limit_messages: usize,
    /// Fixed transport id issued on every open, instead of a random one.
    /// Debug aid only; never set this in production.
    pub debug_transport_id: Option<String>,
}

impl Default for LongPollOptions {
    fn default() -> Self {
        Self {
            kill_after: Duration::from_secs(30),
            queue_limit_bytes: 128 * 1024,
            queue_limit_messages: 100,
            debug_transport_id: None,
        }
    }
}

/// Outcome of asking a transport for the next receive payload.
enum ReceivePoll {
    /// Queued data was available.
    Ready(Vec<u8>),
    /// Nothing queued; the caller must await delivery (the guard unparks
    /// the transport if the caller goes away first).
    Parked(oneshot::Receiver<Vec<u8>>, ParkGuard),
    /// Another receive request is already parked.
    Rejected,
}

struct ParkedReceive {
    seq: u64,
    tx: oneshot::Sender<Vec<u8>>,
}

struct ReceiveState {
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    parked: Option<ParkedReceive>,
    park_seq: u64,
}

/// Clears the parked slot when a waiting receive request is dropped
/// mid-await (client disconnect). The sequence number guards against
/// clearing a newer park after normal delivery.
struct ParkGuard {
    session: Arc<LongPollSession>,
    seq: u64,
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        let mut state = self.session.state.lock();
        if state.parked.as_ref().map(|p| p.seq) == Some(self.seq) {
            state.parked = None;
        }
    }
}

struct LongPollSession {
    transport_id: String,
    serializer: Arc<dyn Serializer>,
    peer: String,
    /// Flipped true by every client request, swapped false by the reaper.
    is_alive: AtomicBool,
    closed: AtomicBool,
    state: Mutex<ReceiveState>,
    handler: Mutex<Option<Box<dyn SessionHandler>>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
    resource: Weak<LongPollInner>,
}

impl LongPollSession {
    fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue one serialized payload, or hand it straight to a parked
    /// receive. Queue overflow closes the transport.
    fn enqueue(&self, payload: Vec<u8>) -> WampResult<()> {
        if self.is_closed() {
            return Err(WampError::TransportLost);
        }
        let mut state = self.state.lock();

        if let Some(parked) = state.parked.take() {
            match parked.tx.send(payload) {
                Ok(()) => return Ok(()),
                // receiver went away between parking and delivery
                Err(payload) => {
                    state.queue.push_back(payload);
                }
            }
        } else {
            state.queue.push_back(payload);
        }

        state.queued_bytes = state.queue.iter().map(Vec::len).sum();
        let over_limit = state.queue.len() > self.resource_opts_messages()
            || state.queued_bytes > self.resource_opts_bytes();
        drop(state);

        if over_limit {
            warn!(
                transport_id = %self.transport_id,
                "long-poll queue limit exceeded, closing transport"
            );
            // closing re-enters the handler lock, which the sender may hold
            if let Some(inner) = self.resource.upgrade() {
                let transport_id = self.transport_id.clone();
                tokio::spawn(async move {
                    inner.close_transport(&transport_id, false);
                });
            }
        }
        Ok(())
    }

    fn resource_opts_messages(&self) -> usize {
        self.resource
            .upgrade()
            .map(|r| r.opts.queue_limit_messages)
            .unwrap_or(usize::MAX)
    }

    fn resource_opts_bytes(&self) -> usize {
        self.resource
            .upgrade()
            .map(|r| r.opts.queue_limit_bytes)
            .unwrap_or(usize::MAX)
    }

    /// Next receive payload: queued data, a parked waiter, or a rejection
    /// if a receive is already parked.
    fn poll_receive(session: &Arc<Self>) -> ReceivePoll {
        let mut state = session.state.lock();

        if !state.queue.is_empty() {
            let payload = if session.serializer.is_batched() {
                // batched serializers allow concatenation, drain everything
                let mut combined = Vec::with_capacity(state.queued_bytes);
                while let Some(chunk) = state.queue.pop_front() {
                    combined.extend(chunk);
                }
                combined
            } else {
                state.queue.pop_front().unwrap_or_default()
            };
            state.queued_bytes = state.queue.iter().map(Vec::len).sum();
            return ReceivePoll::Ready(payload);
        }

        if state.parked.is_some() {
            return ReceivePoll::Rejected;
        }

        state.park_seq += 1;
        let seq = state.park_seq;
        let (tx, rx) = oneshot::channel();
        state.parked = Some(ParkedReceive { seq, tx });
        drop(state);

        ReceivePoll::Parked(
            rx,
            ParkGuard {
                session: Arc::clone(session),
                seq,
            },
        )
    }

    /// Tear down: wake any parked receive, notify the session handler,
    /// stop the reaper.
    fn shutdown(&self, was_clean: bool) {
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            state.parked = None;
        }
        if let Some(mut handler) = self.handler.lock().take() {
            handler.on_close(was_clean);
        }
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        info!(
            transport_id = %self.transport_id,
            peer = %self.peer,
            was_clean,
            "long-poll transport closed"
        );
    }
}

/// [`TransportHandle`] handed to the session handler; sending queues
/// outbound payloads for the next receive request.
struct LongPollTransport {
    session: Weak<LongPollSession>,
}

impl TransportHandle for LongPollTransport {
    fn send(&self, msg: wampd_core::WampMessage) -> WampResult<()> {
        let Some(session) = self.session.upgrade() else {
            return Err(WampError::TransportLost);
        };
        let payload = session.serializer.serialize(&msg)?;
        session.enqueue(payload)
    }

    fn close(&self) -> WampResult<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        // the caller may be inside on_message, under the handler lock
        if let Some(inner) = session.resource.upgrade() {
            let transport_id = session.transport_id.clone();
            tokio::spawn(async move {
                inner.close_transport(&transport_id, true);
            });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session
            .upgrade()
            .map(|s| !s.is_closed())
            .unwrap_or(false)
    }
}

struct LongPollInner {
    factory: Arc<dyn SessionFactory>,
    serializers: SerializerRegistry,
    opts: LongPollOptions,
    transports: Mutex<HashMap<String, Arc<LongPollSession>>>,
}

impl LongPollInner {
    fn close_transport(&self, transport_id: &str, was_clean: bool) -> bool {
        let Some(session) = self.transports.lock().remove(transport_id) else {
            return false;
        };
        session.shutdown(was_clean);
        true
    }
}

/// The long-poll HTTP resource; mount [`LongPollResource::router`] under
/// the path prefix the transport is served from (e.g. `/lp`).
#[derive(Clone)]
pub struct LongPollResource {
    inner: Arc<LongPollInner>,
}

impl LongPollResource {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        serializers: SerializerRegistry,
        opts: LongPollOptions,
    ) -> Self {
        Self {
            inner: Arc::new(LongPollInner {
                factory,
                serializers,
                opts,
                transports: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(notice_page))
            .route("/open", post(open_transport))
            .route("/{transport}", get(transport_info))
            .route("/{transport}/{op}", post(transport_op))
            .with_state(self.clone())
    }

    /// Number of currently open transports.
    pub fn transport_count(&self) -> usize {
        self.inner.transports.lock().len()
    }

    fn open(
        &self,
        request_headers: &HeaderMap,
        connect_info: Option<SocketAddr>,
        body: &[u8],
    ) -> Result<Response, String> {
        #[derive(Deserialize)]
        struct OpenRequest {
            protocols: Vec<String>,
        }

        let open: OpenRequest = serde_json::from_slice(body)
            .map_err(|e| format!("invalid open request body: {e}"))?;

        // first mutually supported candidate wins, in offer order
        let negotiated = open.protocols.iter().find_map(|offer| {
            let (version, serializer_id) = parse_subprotocol(offer)?;
            if version != WAMP_VERSION {
                return None;
            }
            self.inner
                .serializers
                .get(serializer_id)
                .map(|serializer| (offer.clone(), serializer))
        });
        let Some((protocol, serializer)) = negotiated else {
            return Err(format!(
                "no common protocol (I speak: {})",
                self.inner.serializers.subprotocols().join(", ")
            ));
        };

        let transport_id = match &self.inner.opts.debug_transport_id {
            Some(id) => id.clone(),
            None => newid(TRANSPORT_ID_LENGTH),
        };
        // a debug id may collide with a live transport; retire the old one
        self.inner.close_transport(&transport_id, false);

        let peer = peer_address(connect_info, request_headers);
        let mut details = TransportDetails::new(TransportType::LongPoll);
        details.protocol = Some(protocol.clone());
        details.peer = Some(peer.clone());
        details.http_headers_received = crate::transport::http_headers_to_map(request_headers);

        let session = Arc::new(LongPollSession {
            transport_id: transport_id.clone(),
            serializer,
            peer: peer.clone(),
            is_alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            state: Mutex::new(ReceiveState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                parked: None,
                park_seq: 0,
            }),
            handler: Mutex::new(None),
            gc_task: Mutex::new(None),
            resource: Arc::downgrade(&self.inner),
        });

        let mut handler = self.inner.factory.create_session(&details);
        let transport = Arc::new(LongPollTransport {
            session: Arc::downgrade(&session),
        });
        handler.on_open(transport);
        *session.handler.lock() = Some(handler);

        if !self.inner.opts.kill_after.is_zero() {
            let kill_after = self.inner.opts.kill_after;
            let weak_session = Arc::downgrade(&session);
            let weak_inner = Arc::downgrade(&self.inner);
            let id = transport_id.clone();
            let task = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(kill_after).await;
                    let Some(session) = weak_session.upgrade() else {
                        break;
                    };
                    if !session.is_alive.swap(false, Ordering::SeqCst) {
                        if let Some(inner) = weak_inner.upgrade() {
                            debug!(transport_id = %id, "long-poll transport timed out");
                            inner.close_transport(&id, false);
                        }
                        break;
                    }
                }
            });
            *session.gc_task.lock() = Some(task);
        }

        self.inner
            .transports
            .lock()
            .insert(transport_id.clone(), session);

        info!(
            transport_id = %transport_id,
            protocol = %protocol,
            peer = %peer,
            "long-poll transport opened"
        );

        let body = json!({
            "transport": transport_id,
            "protocol": protocol,
        });
        Ok(respond(
            StatusCode::OK,
            request_headers,
            "application/json; charset=utf-8",
            serde_json::to_vec(&body).unwrap_or_default(),
        ))
    }
}

/// CORS and caching headers attached to every long-poll response.
fn standard_headers(request_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let origin = request_headers
        .get(header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers
}

fn respond(
    status: StatusCode,
    request_headers: &HeaderMap,
    content_type: &str,
    body: Vec<u8>,
) -> Response {
    let mut headers = standard_headers(request_headers);
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    (status, headers, body).into_response()
}

fn fail(status: StatusCode, request_headers: &HeaderMap, reason: &str) -> Response {
    respond(status, request_headers, "text/plain; charset=utf-8", reason.into())
}

fn no_content(request_headers: &HeaderMap) -> Response {
    (StatusCode::NO_CONTENT, standard_headers(request_headers)).into_response()
}

/// Client address for transport details: a forwarding proxy header wins,
/// then the socket peer address when the server was wired with connect
/// info.
fn peer_address(connect_info: Option<SocketAddr>, headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or(forwarded).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    match connect_info {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}

const NOTICE_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>WAMP Long-Poll \
Transport</title></head>\n<body>\n<h1>WAMP Long-Poll Transport</h1>\n<p>This is a \
WAMP long-poll transport endpoint. It is addressed by WAMP clients, not \
browsers.</p>\n</body>\n</html>\n";

async fn notice_page(headers: HeaderMap) -> Response {
    respond(
        StatusCode::OK,
        &headers,
        "text/html; charset=utf-8",
        NOTICE_HTML.into(),
    )
}

async fn transport_info(
    State(resource): State<LongPollResource>,
    Path(transport_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let session = resource.inner.transports.lock().get(&transport_id).cloned();
    let Some(session) = session else {
        return respond(
            StatusCode::NOT_FOUND,
            &headers,
            "text/html; charset=utf-8",
            NOTICE_HTML.into(),
        );
    };
    // null until the WAMP session is established
    let wamp_session = session
        .handler
        .lock()
        .as_ref()
        .and_then(|handler| handler.wamp_session_id());
    let body = json!({
        "transport": session.transport_id,
        "session": wamp_session,
    });
    respond(
        StatusCode::OK,
        &headers,
        "application/json; charset=utf-8",
        serde_json::to_vec(&body).unwrap_or_default(),
    )
}

async fn open_transport(
    State(resource): State<LongPollResource>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let headers = parts.headers;
    let connect_info = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let body = match axum::body::to_bytes(body, MAX_OPEN_BODY).await {
        Ok(body) => body,
        Err(_) => return fail(StatusCode::BAD_REQUEST, &headers, "unreadable request body"),
    };
    match resource.open(&headers, connect_info, &body) {
        Ok(response) => response,
        Err(reason) => {
            warn!(reason = %reason, "long-poll open failed");
            fail(StatusCode::BAD_REQUEST, &headers, &reason)
        }
    }
}

async fn transport_op(
    State(resource): State<LongPollResource>,
    Path((transport_id, op)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session = resource.inner.transports.lock().get(&transport_id).cloned();
    let Some(session) = session else {
        return fail(
            StatusCode::NOT_FOUND,
            &headers,
            &format!("no transport with id {transport_id}"),
        );
    };
    session.mark_alive();

    match op.as_str() {
        "send" => handle_send(&headers, &session, &body),
        "receive" => handle_receive(&headers, &session).await,
        "close" => {
            resource.inner.close_transport(&transport_id, true);
            no_content(&headers)
        }
        other => fail(
            StatusCode::NOT_FOUND,
            &headers,
            &format!("no such operation {other}"),
        ),
    }
}

fn handle_send(headers: &HeaderMap, session: &Arc<LongPollSession>, body: &[u8]) -> Response {
    let messages = match session.serializer.unserialize(body) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(
                transport_id = %session.transport_id,
                error = %e,
                "could not unserialize long-poll send payload"
            );
            return fail(
                StatusCode::BAD_REQUEST,
                headers,
                &format!("could not unserialize payload: {e}"),
            );
        }
    };

    let mut handler = session.handler.lock();
    let Some(handler) = handler.as_mut() else {
        return fail(StatusCode::NOT_FOUND, headers, "transport already closed");
    };
    for msg in messages {
        if let Err(e) = handler.on_message(msg) {
            return fail(
                StatusCode::BAD_REQUEST,
                headers,
                &format!("message rejected: {e}"),
            );
        }
    }
    no_content(headers)
}

async fn handle_receive(headers: &HeaderMap, session: &Arc<LongPollSession>) -> Response {
    match LongPollSession::poll_receive(session) {
        ReceivePoll::Ready(payload) => {
            respond(StatusCode::OK, headers, session.serializer.mime_type(), payload)
        }
        ReceivePoll::Rejected => fail(
            StatusCode::BAD_REQUEST,
            headers,
            "a receive request is already pending on this transport",
        ),
        ReceivePoll::Parked(rx, _guard) => match rx.await {
            Ok(payload) => {
                respond(StatusCode::OK, headers, session.serializer.mime_type(), payload)
            }
            // transport closed while parked
            Err(_) => no_content(headers),
        },
    }
}
