//! Error types for the IRC test framework

use std::fmt;

use thiserror::Error;

/// A malformed script, reported before any connection is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number, or `None` for whole-script problems
    pub line: Option<usize>,
    pub message: String,
}

impl ParseError {
    pub fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    pub fn script(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Main error type for framework operations
#[derive(Error, Debug)]
pub enum FrameworkError {
    /// Script could not be parsed
    #[error("Script error: {0}")]
    Parse(#[from] ParseError),

    /// Could not establish or use a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// The socket was closed, locally or by the server
    #[error("Socket is disconnected")]
    Disconnected,

    /// A line from the server was not a valid IRC message
    #[error("Malformed line [{line}]: {reason}")]
    Framing { line: String, reason: String },

    /// Settings file is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// A bounded read expired
    #[error("Timed out waiting for a line from {client}")]
    ReadTimeout { client: String },

    /// The run was cancelled while waiting on a read
    #[error("Run cancelled while waiting for {client}")]
    Cancelled { client: String },

    /// TLS handshake or server name rejected
    #[error("TLS error: {0}")]
    Tls(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A script action failed; wraps the underlying error
    #[error("Action {index} ({client}) failed: {source}")]
    Action {
        index: usize,
        client: String,
        #[source]
        source: Box<FrameworkError>,
    },
}

impl FrameworkError {
    pub(crate) fn framing(line: impl Into<String>, reason: impl Into<String>) -> Self {
        FrameworkError::Framing {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// The innermost error, looking through action context.
    pub fn root(&self) -> &FrameworkError {
        match self {
            FrameworkError::Action { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias using FrameworkError
pub type FrameworkResult<T> = Result<T, FrameworkError>;
