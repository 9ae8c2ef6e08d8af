use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::resp::types::{render_args, Arg};

// ── Error hierarchy ────────────────────────────────────────────────
//
//  Error
//  ├── Connection   socket could not be established / transport I/O failed
//  ├── Auth         server rejected the credential
//  ├── Redis        server answered with an error frame
//  ├── Protocol     malformed frame, stream position lost
//  ├── Decode       frame intact, payload unparsable
//  ├── Encoding     argument shape cannot be written
//  ├── Type         reply shape does not fit the typed wrapper
//  ├── Closed       client or connection is shutting down
//  ├── Timeout
//  └── Config

/// Structured Redis error kinds for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// NOAUTH Authentication required
    NoAuth,
    /// WRONGPASS invalid username-password pair
    WrongPass,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// NOSCRIPT No matching script
    NoScript,
    /// BUSY Redis is busy running a script
    Busy,
    /// Any other Redis error prefix
    Other(String),
}

impl RedisErrorKind {
    /// Classify a Redis error message by its leading word.
    pub fn from_error_msg(msg: &str) -> Self {
        let prefix = msg.split_whitespace().next().unwrap_or("");
        match prefix {
            "ERR" => Self::Err,
            "WRONGTYPE" => Self::WrongType,
            "NOAUTH" => Self::NoAuth,
            "WRONGPASS" => Self::WrongPass,
            "LOADING" => Self::Loading,
            "READONLY" => Self::ReadOnly,
            "NOSCRIPT" => Self::NoScript,
            "BUSY" => Self::Busy,
            "" => Self::Other("UNKNOWN".to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// All error variants for pipedis.
///
/// `Clone` so that one cause can be delivered to every pending result
/// slot of a failing connection.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// TCP / IO level errors
    #[error("connection error: {0}")]
    Connection(Arc<io::Error>),
    /// The server rejected the AUTH credential
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Redis returned an error frame
    #[error("redis error: {message}{}", command_suffix(.command))]
    Redis {
        kind: RedisErrorKind,
        message: String,
        /// Arguments of the command that failed, rendered for diagnostics.
        command: Option<String>,
    },
    /// Framing error: the stream position can no longer be trusted
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A complete frame whose payload could not be interpreted
    #[error("decode error: {0}")]
    Decode(String),
    /// The parser needs more data. Internal control flow, never returned to callers.
    #[error("incomplete RESP message")]
    Incomplete,
    /// The argument cannot be represented on the wire
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Type conversion errors (e.g. expected int, got string)
    #[error("type error: {0}")]
    Type(String),
    /// The client or connection is shutting down
    #[error("closed: {0}")]
    Closed(String),
    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),
    /// Invalid URL or configuration value
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a Redis error from a raw error message, auto-parsing the kind.
    pub fn redis(msg: impl Into<String>) -> Self {
        let message = msg.into();
        Self::Redis {
            kind: RedisErrorKind::from_error_msg(&message),
            message,
            command: None,
        }
    }

    /// Attach the originating command to a server error.
    ///
    /// Other variants pass through untouched.
    pub fn with_command(self, args: &[Arg]) -> Self {
        match self {
            Self::Redis { kind, message, .. } => Self::Redis {
                kind,
                message,
                command: Some(render_args(args)),
            },
            other => other,
        }
    }

    /// Whether this error leaves the connection's byte stream unusable.
    ///
    /// Fatal errors tear the connection down and fail every pending slot.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Protocol(_))
    }

    /// The structured kind, if this is a server error.
    pub fn redis_kind(&self) -> Option<&RedisErrorKind> {
        match self {
            Self::Redis { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

fn command_suffix(command: &Option<String>) -> String {
    command.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Connection(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Tests ──────────────────────────────────────────────────────────
