//! Interfaces to the external WAMP session/router layer.
//!
//! The application-level router (broker/dealer) is an external collaborator:
//! the transport layer hands it fully negotiated sessions through
//! [`SessionFactory`] and never looks inside WAMP messages. The boundary is
//! a plain trait object supplied by the caller, not a runtime import.

use crate::error::WampResult;
use crate::serializer::WampMessage;
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of transport a session was established over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    WebSocket,
    RawSocket,
    LongPoll,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::WebSocket => "websocket",
            TransportType::RawSocket => "rawsocket",
            TransportType::LongPoll => "longpoll",
        }
    }
}

/// Authentication state attached to a transport before the WAMP handshake,
/// e.g. recovered from an authenticated cookie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportAuth {
    pub authid: Option<String>,
    pub authrole: Option<String>,
    pub authmethod: Option<String>,
    pub authrealm: Option<String>,
    pub authextra: Option<serde_json::Value>,
}

impl TransportAuth {
    /// Whether any authentication decision is recorded.
    pub fn is_authenticated(&self) -> bool {
        self.authid.is_some()
    }
}

/// Transport-level metadata handed to the session factory on connect and
/// forwarded by the router in session-join lifecycle events.
#[derive(Debug, Clone)]
pub struct TransportDetails {
    pub transport_type: TransportType,
    /// Negotiated subprotocol, e.g. `wamp.2.json`.
    pub protocol: Option<String>,
    /// Remote peer, e.g. `192.0.2.1:40812`.
    pub peer: Option<String>,
    pub http_headers_received: HashMap<String, Vec<String>>,
    pub http_headers_sent: HashMap<String, Vec<String>>,
    /// Cookie tracking id bound to this connection, if cookie tracking is on.
    pub cbtid: Option<String>,
    /// Authentication recovered at the transport level.
    pub auth: Option<TransportAuth>,
    /// Who supplied `auth` (e.g. `cookie`).
    pub auth_provider: Option<String>,
}

impl TransportDetails {
    pub fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            protocol: None,
            peer: None,
            http_headers_received: HashMap::new(),
            http_headers_sent: HashMap::new(),
            cbtid: None,
            auth: None,
            auth_provider: None,
        }
    }
}

/// Outbound half of a transport, handed to the session on open.
pub trait TransportHandle: Send + Sync {
    /// Send a message to the peer. Fails with `TransportLost` once closed.
    fn send(&self, msg: WampMessage) -> WampResult<()>;

    /// Close the transport.
    fn close(&self) -> WampResult<()>;

    fn is_open(&self) -> bool;
}

/// One application session, created by the external router layer.
pub trait SessionHandler: Send {
    /// The transport is up; `transport` can be used to send messages.
    fn on_open(&mut self, transport: Arc<dyn TransportHandle>);

    /// One inbound message, already unserialized.
    fn on_message(&mut self, msg: WampMessage) -> WampResult<()>;

    /// The transport went away. `was_clean` distinguishes orderly close
    /// from abort/inactivity kill.
    fn on_close(&mut self, was_clean: bool);

    /// WAMP session id once established, for info surfaces.
    fn wamp_session_id(&self) -> Option<u64> {
        None
    }
}

/// Produces a new application session for each accepted transport.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, details: &TransportDetails) -> Box<dyn SessionHandler>;
}

/// Session that echoes every inbound message back out.
///
/// Development and testing aid; the real router layer is supplied by the
/// embedding application.
pub struct LoopbackSession {
    transport: Option<Arc<dyn TransportHandle>>,
}

impl SessionHandler for LoopbackSession {
    fn on_open(&mut self, transport: Arc<dyn TransportHandle>) {
        self.transport = Some(transport);
    }

    fn on_message(&mut self, msg: WampMessage) -> WampResult<()> {
        if let Some(transport) = &self.transport {
            transport.send(msg)?;
        }
        Ok(())
    }

    fn on_close(&mut self, _was_clean: bool) {
        self.transport = None;
    }
}

/// Factory for [`LoopbackSession`].
pub struct LoopbackSessionFactory;

impl SessionFactory for LoopbackSessionFactory {
    fn create_session(&self, _details: &TransportDetails) -> Box<dyn SessionHandler> {
        Box::new(LoopbackSession { transport: None })
    }
}
