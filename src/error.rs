use std::io::ErrorKind;

use thiserror::Error;

/// Errors raised by the inbound (broker) and outbound (device) links.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No session is open on the link.
    #[error("link not connected")]
    NotConnected,

    /// The underlying connection dropped (reset, broken pipe, EOF).
    #[error("transport reset: {0}")]
    TransportReset(String),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The device session opened but never reported its own identity.
    #[error("device handshake failed: {0}")]
    Handshake(String),

    /// A destination string could not be turned into a node number.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Broker client rejected a request.
    #[error("broker error: {0}")]
    Broker(String),

    /// A link was asked to do something its configuration does not allow.
    #[error("not configured: {0}")]
    NotConfigured(&'static str),

    /// Encoded ToRadio exceeds what the stream header can describe.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    /// IO failures that are not connection resets.
    #[error("io error: {0}")]
    Io(std::io::Error),

    /// The session was closed locally.
    #[error("session closed")]
    Closed,
}

impl LinkError {
    /// True for errors after which a fresh session may succeed where the old one failed.
    pub fn is_transport_reset(&self) -> bool {
        matches!(self, LinkError::TransportReset(_) | LinkError::Closed)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => LinkError::TransportReset(e.to_string()),
            _ => LinkError::Io(e),
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
