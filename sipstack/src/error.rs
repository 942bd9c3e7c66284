use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error on parsing
#[derive(Debug, PartialEq, Eq, Error, Clone)]
pub struct SipParserError {
    /// Message in error
    pub message: String,
}

impl fmt::Display for SipParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[allow(missing_docs)]
impl SipParserError {
    pub fn new<T>(s: T) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            message: s.as_ref().to_string(),
        }
    }
}

impl std::convert::From<&str> for SipParserError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::convert::From<String> for SipParserError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<std::fmt::Error> for Error {
    fn from(value: std::fmt::Error) -> Self {
        Self::FmtError(value)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Bytes that could not be recognized as a SIP message at all.
    #[error("Broken packet: {0}")]
    Broken(SipParserError),

    /// Syntax-valid message missing a mandatory header.
    #[error("Missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error(transparent)]
    ParseError(#[from] SipParserError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    /// The transport layer refused the call because shutdown has begun.
    #[error("Transport layer is shut down")]
    TransportClosed,

    /// An outbound message failed validation before rendering.
    #[error("Invalid outgoing message: {0}")]
    InvalidMessage(&'static str),

    /// The rendered message exceeds the limit for the selected transport.
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Rendered size.
        size: usize,
        /// Limit that was exceeded.
        limit: usize,
    },

    /// A valid message carrying a feature this stack does not recognize.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// No transaction matched the message key.
    #[error("No transaction matched")]
    TransactionNotMatched,

    /// The method is not allowed for the attempted operation.
    #[error("Method '{0}' not allowed here")]
    MethodNotAllowed(String),

    /// The transaction timed out waiting for a remote peer.
    #[error("Transaction timed out")]
    TxTimeout,

    /// The transaction failed at the transport level.
    #[error("Transaction transport failure: {0}")]
    TxTransport(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("The Sec-WebSocket-Key has missing")]
    MissingSecWebSocketKey,

    #[error("Invalid Web Socket Version")]
    InvalidWebSocketVersion,

    #[error("Fmt Error")]
    FmtError(std::fmt::Error),

    #[error("The Sec-WebSocket-Protocol is invalid")]
    InvalidSecWebSocketProtocol,
}
