use std::fmt;
use thiserror::Error;

/// The I/O operation an [`OpError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Close,
    Connect,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Read => "read",
            Op::Write => "write",
            Op::Close => "close",
            Op::Connect => "connect",
        };
        f.write_str(name)
    }
}

/// Why a connection was closed. Stored once and returned by every later operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// Closed through a plain `close()`.
    #[error("operation on closed connection")]
    Closed,

    /// Closed with a caller-supplied reason.
    #[error("{0}")]
    Other(String),
}

/// A failed operation on a closed session or packet connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub op: Op,
    /// Local address of the endpoint, if it has one.
    pub addr: Option<String>,
    pub reason: CloseReason,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Some(addr) => write!(f, "{} {}: {}", self.op, addr, self.reason),
            None => write!(f, "{}: {}", self.op, self.reason),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

/// Protocol invariant violations. Never recovered from in place; they are handed to
/// whoever owns the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    /// The remote peer opened a data channel; this side is the only initiator.
    #[error("unexpected remote-initiated data channel")]
    UnexpectedDataChannel,

    /// A data-channel message could not be written completely into the read stream.
    #[error("short write into read stream")]
    ShortWrite,

    /// A second data channel opened while one is already active.
    #[error("data channel already open")]
    ChannelAlreadyOpen,
}

/// Errors that can occur in session and packet-connection operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a closed endpoint
    #[error(transparent)]
    Op(#[from] OpError),

    /// Offer or answer creation/application failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The broker could not produce an answer
    #[error("Broker error: {0}")]
    Broker(String),

    /// Peer-connection capability failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or wrong-typed session description
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// No peer connection has been prepared
    #[error("No peer connection")]
    NoPeerConnection,

    /// Unsupported operation (deadlines)
    #[error("{0} not implemented")]
    NotImplemented(&'static str),

    /// Non-recoverable protocol invariant violation
    #[error("Fatal: {0}")]
    Fatal(#[from] Violation),
}

impl Error {
    /// Whether this error reports an operation on a closed endpoint.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Op(_))
    }

    /// The operation of a closed-endpoint error.
    pub fn op(&self) -> Option<Op> {
        match self {
            Error::Op(e) => Some(e.op),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidDescription(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
