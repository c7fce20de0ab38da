//! WAMP serializers and subprotocol negotiation.
//!
//! WAMP message *semantics* (URI matching, call/invoke rules) live in the
//! application router behind [`crate::session::SessionFactory`]; the
//! transport layer treats a message as an opaque JSON-compatible value and
//! only cares about bytes on the wire and batching.

use crate::error::{WampError, WampResult};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// A WAMP message as handled by the transport layer: an opaque value.
pub type WampMessage = Value;

/// Separator octet between messages in a batched JSON payload.
pub const JSON_BATCH_SEPARATOR: u8 = 0x18;

/// WAMP protocol version negotiated via `wamp.<version>.<serializer>` ids.
pub const WAMP_VERSION: u32 = 2;

/// A WAMP wire serializer.
///
/// Identified by a short string id as it appears in subprotocol identifiers
/// (`wamp.2.json`, `wamp.2.json.batched`, `wamp.2.cbor`, ...).
pub trait Serializer: Send + Sync {
    /// Short serializer id, e.g. `"json"` or `"json.batched"`.
    fn serializer_id(&self) -> &'static str;

    /// Whether serialized payloads are binary (vs. UTF-8 text).
    fn is_binary(&self) -> bool;

    /// Whether multiple messages may be packed into one payload.
    fn is_batched(&self) -> bool;

    /// MIME type for HTTP responses carrying serialized payloads.
    fn mime_type(&self) -> &'static str;

    /// Serialize a single message into a wire payload.
    fn serialize(&self, msg: &WampMessage) -> WampResult<Vec<u8>>;

    /// Unserialize a wire payload into the messages it contains.
    ///
    /// For unbatched serializers the payload holds exactly one message; for
    /// batched serializers it may hold several.
    fn unserialize(&self, payload: &[u8]) -> WampResult<Vec<WampMessage>>;
}

/// JSON serializer, plain or batched.
///
/// In batched mode each serialized message is followed by a single `0x18`
/// separator octet, so payloads can be concatenated freely.
pub struct JsonSerializer {
    batched: bool,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self { batched: false }
    }

    pub fn batched() -> Self {
        Self { batched: true }
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for JsonSerializer {
    fn serializer_id(&self) -> &'static str {
        if self.batched {
            "json.batched"
        } else {
            "json"
        }
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn is_batched(&self) -> bool {
        self.batched
    }

    fn mime_type(&self) -> &'static str {
        "application/json; charset=utf-8"
    }

    fn serialize(&self, msg: &WampMessage) -> WampResult<Vec<u8>> {
        let mut payload = serde_json::to_vec(msg)?;
        if self.batched {
            payload.push(JSON_BATCH_SEPARATOR);
        }
        Ok(payload)
    }

    fn unserialize(&self, payload: &[u8]) -> WampResult<Vec<WampMessage>> {
        if self.batched {
            let mut messages = Vec::new();
            for chunk in payload.split(|b| *b == JSON_BATCH_SEPARATOR) {
                if chunk.is_empty() {
                    continue;
                }
                messages.push(serde_json::from_slice(chunk)?);
            }
            Ok(messages)
        } else {
            Ok(vec![serde_json::from_slice(payload)?])
        }
    }
}

/// CBOR serializer (unbatched), backed by ciborium.
pub struct CborSerializer;

impl CborSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CborSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for CborSerializer {
    fn serializer_id(&self) -> &'static str {
        "cbor"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn is_batched(&self) -> bool {
        false
    }

    fn mime_type(&self) -> &'static str {
        "application/cbor"
    }

    fn serialize(&self, msg: &WampMessage) -> WampResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(msg, &mut payload)?;
        Ok(payload)
    }

    fn unserialize(&self, payload: &[u8]) -> WampResult<Vec<WampMessage>> {
        let cursor = Cursor::new(payload);
        let msg: WampMessage = ciborium::from_reader(cursor)
            .map_err(|e: ciborium::de::Error<std::io::Error>| WampError::from(e))?;
        Ok(vec![msg])
    }
}

/// Parse a WAMP subprotocol identifier of the form `wamp.<version>.<serializer>`.
///
/// Returns the version and serializer id, e.g. `"wamp.2.json.batched"`
/// yields `(2, "json.batched")`.
pub fn parse_subprotocol(subprotocol: &str) -> Option<(u32, &str)> {
    let rest = subprotocol.strip_prefix("wamp.")?;
    let (version, serializer_id) = rest.split_once('.')?;
    let version: u32 = version.parse().ok()?;
    if serializer_id.is_empty() {
        return None;
    }
    Some((version, serializer_id))
}

/// Registry of available serializers, keyed by serializer id.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            serializers: HashMap::new(),
        }
    }

    /// Registry with the built-in serializers: JSON (plain + batched) and CBOR.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonSerializer::new()));
        registry.register(Arc::new(JsonSerializer::batched()));
        registry.register(Arc::new(CborSerializer::new()));
        registry
    }

    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers
            .insert(serializer.serializer_id().to_string(), serializer);
    }

    pub fn get(&self, serializer_id: &str) -> Option<Arc<dyn Serializer>> {
        self.serializers.get(serializer_id).cloned()
    }

    pub fn contains(&self, serializer_id: &str) -> bool {
        self.serializers.contains_key(serializer_id)
    }

    /// Serializer ids, sorted (for stable error messages).
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.serializers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Subprotocol identifiers this registry can speak, sorted.
    pub fn subprotocols(&self) -> Vec<String> {
        self.ids()
            .into_iter()
            .map(|id| format!("wamp.{WAMP_VERSION}.{id}"))
            .collect()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let ser = JsonSerializer::new();
        let msg = json!([48, 1234, {}, "com.example.add", [2, 3]]);
        let payload = ser.serialize(&msg).unwrap();
        let messages = ser.unserialize(&payload).unwrap();
        assert_eq!(messages, vec![msg]);
    }

    #[test]
    fn json_batched_round_trip_preserves_order() {
        let ser = JsonSerializer::batched();
        let msgs = vec![json!([1, "a"]), json!([2, "b"]), json!([3, "c"])];

        let mut payload = Vec::new();
        for m in &msgs {
            payload.extend(ser.serialize(m).unwrap());
        }

        let decoded = ser.unserialize(&payload).unwrap();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn json_batched_payload_ends_with_separator() {
        let ser = JsonSerializer::batched();
        let payload = ser.serialize(&json!([1])).unwrap();
        assert_eq!(*payload.last().unwrap(), JSON_BATCH_SEPARATOR);
    }

    #[test]
    fn json_unserialize_garbage_fails() {
        let ser = JsonSerializer::new();
        assert!(ser.unserialize(b"not json").is_err());
    }

    #[test]
    fn cbor_round_trip() {
        let ser = CborSerializer::new();
        let msg = json!([16, 42, {"acknowledge": true}, "com.example.topic"]);
        let payload = ser.serialize(&msg).unwrap();
        let messages = ser.unserialize(&payload).unwrap();
        assert_eq!(messages, vec![msg]);
    }

    #[test]
    fn parse_subprotocol_variants() {
        assert_eq!(parse_subprotocol("wamp.2.json"), Some((2, "json")));
        assert_eq!(
            parse_subprotocol("wamp.2.json.batched"),
            Some((2, "json.batched"))
        );
        assert_eq!(parse_subprotocol("wamp.2.cbor"), Some((2, "cbor")));
        assert_eq!(parse_subprotocol("wamp.1.json"), Some((1, "json")));
        assert_eq!(parse_subprotocol("wamp.2"), None);
        assert_eq!(parse_subprotocol("wamp.x.json"), None);
        assert_eq!(parse_subprotocol("mqtt"), None);
        assert_eq!(parse_subprotocol("wamp.2."), None);
    }

    #[test]
    fn registry_defaults() {
        let registry = SerializerRegistry::with_defaults();
        assert!(registry.contains("json"));
        assert!(registry.contains("json.batched"));
        assert!(registry.contains("cbor"));
        assert!(!registry.contains("msgpack"));
        assert_eq!(
            registry.subprotocols(),
            vec!["wamp.2.cbor", "wamp.2.json", "wamp.2.json.batched"]
        );
    }
}
