//! Error types shared by every layer of the engine.
//!
//! All fallible library calls return [`Result`]. Each variant belongs to one
//! [`ErrorKind`], which is what drivers and the executor branch on: validation
//! errors abort the run, timeouts and checksum failures may be retried by a
//! protocol driver, connectivity errors are never retried.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Timeout,
    Protocol,
    Connectivity,
    Expression,
    Script,
    Stopped,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Expression => "expression",
            ErrorKind::Script => "script",
            ErrorKind::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Validation
    #[error("action '{action}': missing required argument '{arg}'")]
    MissingArgument { action: String, arg: String },

    #[error("action '{action}': unknown argument(s): {args}")]
    UnknownArgument { action: String, args: String },

    #[error("action '{action}': argument '{arg}' has type {found}, expected {expected}")]
    TypeMismatch {
        action: String,
        arg: String,
        expected: String,
        found: &'static str,
    },

    #[error("argument '{arg}': {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    // Timeout
    #[error("timed out after {}ms waiting for {what}", .after.as_millis())]
    Timeout { what: String, after: Duration },

    // Protocol
    #[error("unknown frame: {0}")]
    UnknownFrame(String),

    #[error("frame '{frame}': header mismatch")]
    HeaderMismatch { frame: String },

    #[error("frame '{frame}': tail mismatch")]
    TailMismatch { frame: String },

    #[error("frame '{frame}': {len} bytes is too short, need {need}")]
    FrameTooShort { frame: String, len: usize, need: usize },

    #[error("{frame}: CRC mismatch (expected {expected}, got {actual})")]
    CrcMismatch {
        frame: String,
        expected: String,
        actual: String,
    },

    #[error("frame '{frame}': field '{field}' is {actual}, expected constant {expected}")]
    ConstMismatch {
        frame: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("frame '{frame}': field '{field}': {message}")]
    FieldValue {
        frame: String,
        field: String,
        message: String,
    },

    #[error("frame '{0}' has no tail and no fixed length, cannot match it on receive")]
    UnmatchableFrame(String),

    #[error("{protocol}: {message}")]
    Protocol {
        protocol: &'static str,
        message: String,
    },

    // Connectivity
    #[error("cannot open {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {target}: {source}")]
    ChannelIo {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("channel {0} is closed")]
    ChannelClosed(String),

    // Expression
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("unsupported expression '{expr}': {reason}")]
    UnsupportedExpression { expr: String, reason: String },

    #[error("cannot evaluate '{expr}': {reason}")]
    Evaluation { expr: String, reason: String },

    // Script
    #[error("invalid script: {0}")]
    Script(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("cannot access {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // Executor
    #[error("state '{state}', action '{action}': {source}")]
    Action {
        state: String,
        action: String,
        #[source]
        source: Box<Error>,
    },

    #[error("state '{state}', when: {source}")]
    Guard {
        state: String,
        #[source]
        source: Box<Error>,
    },

    #[error("run stopped")]
    Stopped,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingArgument { .. }
            | Error::UnknownArgument { .. }
            | Error::TypeMismatch { .. }
            | Error::InvalidArgument { .. }
            | Error::UnknownAction(_)
            | Error::UnknownChannel(_) => ErrorKind::Validation,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::UnknownFrame(_)
            | Error::HeaderMismatch { .. }
            | Error::TailMismatch { .. }
            | Error::FrameTooShort { .. }
            | Error::CrcMismatch { .. }
            | Error::ConstMismatch { .. }
            | Error::FieldValue { .. }
            | Error::UnmatchableFrame(_)
            | Error::Protocol { .. } => ErrorKind::Protocol,
            Error::Connect { .. } | Error::ChannelIo { .. } | Error::ChannelClosed(_) => {
                ErrorKind::Connectivity
            }
            Error::UnknownVariable(_)
            | Error::UnsupportedExpression { .. }
            | Error::Evaluation { .. } => ErrorKind::Expression,
            Error::Script(_) | Error::Yaml(_) | Error::File { .. } => ErrorKind::Script,
            Error::Action { source, .. } | Error::Guard { source, .. } => source.kind(),
            Error::Stopped => ErrorKind::Stopped,
        }
    }

    /// Whether a driver with a retry budget may re-send the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::CrcMismatch { .. })
    }

    /// The innermost error, looking through [`Error::Action`] wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Action { source, .. } | Error::Guard { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            after,
        }
    }

    pub(crate) fn invalid(arg: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            arg: arg.into(),
            message: message.into(),
        }
    }
}
