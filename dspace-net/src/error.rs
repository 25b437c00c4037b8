use num_enum::TryFromPrimitiveError;
use thiserror::Error;

use crate::msg::MessageType;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out")]
    TimedOut,
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("handshake failed, got: {0}")]
    HandshakeFailed(String),
    #[error("peer {0} disconnected")]
    PeerDisconnected(usize),
    #[error("unexpected message: {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("remote error: {0}")]
    Remote(String),

    #[error("other: {0}")]
    Other(String),

    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("connection lost")]
    Disconnect(#[from] std::io::Error),

    #[error("bincode error")]
    BincodeError(#[from] bincode::Error),

    #[error("unknown message code: {0}")]
    UnknownMsgCode(#[from] TryFromPrimitiveError<MessageType>),

    #[error("core error: {0}")]
    CoreError(#[from] dspace_core::Error),
}

impl From<Error> for dspace_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::CoreError(e) => e,
            Error::BincodeError(e) => dspace_core::Error::SerializationError(e.to_string()),
            Error::Remote(msg) => dspace_core::Error::Other(msg),
            e => dspace_core::Error::CommError(e.to_string()),
        }
    }
}
