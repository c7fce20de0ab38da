//! wampd-core: Shared protocol library for the wampd WAMP router.
//!
//! Provides the error type, WAMP serializers and subprotocol negotiation,
//! the interfaces to the external WAMP session/router layer, and id and
//! timestamp utilities.

pub mod error;
pub mod serializer;
pub mod session;
pub mod util;

// Re-export commonly used items at crate root.
pub use error::{WampError, WampResult};
pub use serializer::{
    parse_subprotocol, CborSerializer, JsonSerializer, Serializer, SerializerRegistry, WampMessage,
    JSON_BATCH_SEPARATOR, WAMP_VERSION,
};
pub use session::{
    LoopbackSession, LoopbackSessionFactory, SessionFactory, SessionHandler, TransportAuth,
    TransportDetails, TransportHandle, TransportType,
};
pub use util::{newid, utcnow, utcstr};
