use thiserror::Error;

/// Errors produced by the WAMP transport layer.
#[derive(Debug, Error)]
pub enum WampError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport lost")]
    TransportLost,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no common protocol: {0}")]
    ProtocolNegotiation(String),

    #[error("cookie store error: {0}")]
    CookieStore(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for WampError {
    fn from(e: serde_json::Error) -> Self {
        WampError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for WampError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        WampError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for WampError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        WampError::Serialization(e.to_string())
    }
}

pub type WampResult<T> = Result<T, WampError>;
