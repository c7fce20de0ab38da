//! WAMP transport adapters for classified connections.

pub mod rawsocket;
pub mod websocket;

pub use rawsocket::WampRawSocketServer;
pub use websocket::WampWebSocketServer;

use http::HeaderMap;
use std::collections::HashMap;

/// Flatten HTTP headers into the multi-valued map carried in
/// `TransportDetails`. Non-UTF-8 header values are skipped.
pub(crate) fn http_headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}
