//! Error types for the stream parser, the session and file transfers.

use thiserror::Error;

/// Errors raised while decoding the inbound XML stream.
///
/// Every variant is session-fatal: the stream cannot be resynchronised once
/// the parser has rejected input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XmlError {
    /// The underlying scanner rejected the markup
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: usize, message: String },

    /// A closing tag did not match the open element
    #[error("mismatched closing tag: expected </{expected}>, found </{found}>")]
    MismatchedEnd { expected: String, found: String },

    /// A closing tag arrived with no element open
    #[error("unexpected closing tag </{0}>")]
    UnexpectedEnd(String),

    /// A second root element was opened after the stream root was closed
    #[error("content after the stream root was closed")]
    TrailingContent,

    /// Nesting deeper than the parser accepts
    #[error("element nesting exceeds {limit} levels")]
    TooDeep { limit: usize },

    /// Unconsumed bytes grew past the buffer guard
    #[error("incomplete markup exceeds {limit} bytes")]
    BufferOverflow { limit: usize },
}

impl XmlError {
    pub fn malformed(position: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            position,
            message: message.into(),
        }
    }
}

/// Errors that end a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket level failure (connect, read, write)
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Server resolution failure
    #[error("DNS error: {message}")]
    Dns { message: String },

    /// Markup the parser could not accept
    #[error("XML stream error: {0}")]
    Xml(#[from] XmlError),

    /// The remote reported or caused a fatal protocol condition
    #[error("{message}")]
    Fatal { message: String, retryable: bool },

    /// Invalid local configuration
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Connect attempt did not complete in time
    #[error("connect to {host}:{port} timed out after {secs}s")]
    ConnectTimeout { host: String, port: u16, secs: u64 },

    /// Operation needs an established session
    #[error("session is not ready")]
    NotReady,

    /// The session task is gone
    #[error("session closed")]
    Closed,

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl SessionError {
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    pub fn dns(message: impl Into<String>) -> Self {
        Self::Dns {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>, retryable: bool) -> Self {
        Self::Fatal {
            message: message.into(),
            retryable,
        }
    }

    /// Whether a collaborator may reconnect after this error.
    ///
    /// Only authentication and resource conflicts are final; configuration
    /// mistakes are not retried either since they cannot heal on their own.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Fatal { retryable, .. } => *retryable,
            Self::Config { .. } => false,
            _ => true,
        }
    }
}

/// Errors scoped to one file transfer.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The SOCKS5 peer answered with something we can't accept
    #[error("SOCKS5 handshake failed: {0}")]
    Handshake(String),

    #[error("{phase} timed out after {secs}s")]
    Timeout { phase: &'static str, secs: u64 },

    #[error("peer closed the connection during {0}")]
    Hangup(&'static str),

    /// Every candidate streamhost failed
    #[error("{0}")]
    Exhausted(String),

    /// Stream ended before the advertised size was reached
    #[error("transfer ended after {transferred} of {total} bytes")]
    Truncated { transferred: u64, total: u64 },

    #[error("no transfer with id {0}")]
    NotFound(u32),

    /// The transfer is past the step the caller asked for
    #[error("transfer {id} cannot be {action} in its current state")]
    InvalidState { id: u32, action: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;
pub type TransferResult<T> = Result<T, TransferError>;
