//! wampd-router: transport layer of the wampd WAMP router.
//!
//! Gives WAMP clients transport-independent identity and connection
//! continuity: a uni-socket listener demultiplexes RawSocket, MQTT and HTTP
//! traffic off one port, a cookie store correlates connections (and cached
//! authentication) across reconnects, and a long-poll resource emulates a
//! bidirectional WAMP transport over plain HTTP for clients without
//! WebSocket. The application-level router is an external collaborator
//! plugged in via `wampd_core::SessionFactory`.

pub mod config;
pub mod cookie;
pub mod longpoll;
pub mod transport;
pub mod unisocket;

pub use cookie::{
    ConnectionId, CookieConfig, CookieStore, DatabaseCookieStore, FileCookieStore,
    MemoryCookieStore,
};
pub use longpoll::{LongPollOptions, LongPollResource};
pub use transport::{WampRawSocketServer, WampWebSocketServer};
pub use unisocket::{PrefixedStream, StreamHandler, UniSocketServer};
