use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("invalid hub link '{link}': {reason}")]
    InvalidLink { link: String, reason: String },
    #[error("invalid client identity: {0}")]
    InvalidIdentity(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed normally")]
    NormalClosure,
    #[error("connection closed abnormally: {0}")]
    AbnormalClosure(String),
    #[error("transport already closed")]
    Closed,
}

impl TransportError {
    pub fn is_abnormal(&self) -> bool {
        matches!(self, TransportError::AbnormalClosure(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("envelope exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("envelope is missing a type")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{kind} registration is missing '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}
