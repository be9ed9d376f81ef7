use thiserror::Error;
use topo_core::{DialError, ProtocolError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("client is not connected")]
    NotConnected,
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("client is shut down")]
    Shutdown,
}
