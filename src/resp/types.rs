use std::fmt;

use bytes::Bytes;

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// *2\r\n…
    Array(Vec<RespValue>),
    /// $-1\r\n  or  *-1\r\n
    Null,
}

// ── Convenience accessors ──────────────────────────────────────────

impl RespValue {
    /// Try to interpret this value as a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to interpret this value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::BulkString(b) => Some(b),
            Self::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to interpret this value as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to interpret this value as an array (consumes self).
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns true when this value represents null / nil.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true when this is a Redis error.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns the error message if this is an error value.
    pub fn as_error_msg(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns the type name as a static string (useful for error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple_string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk_string",
            Self::Array(_) => "array",
            Self::Null => "null",
        }
    }
}

// ── Request arguments ──────────────────────────────────────────────

/// A dynamically typed value that can be written as a RESP frame.
///
/// Commands are sequences of `Arg`s. How each variant is framed depends
/// on the encoding mode, see [`crate::resp::writer`].
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Text, encoded through the configured charset.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Floating point. Only representable as bulk text.
    Float(f64),
    /// Raw bytes, always written as a bulk string.
    Bytes(Bytes),
    /// Nested sequence, written as an array frame.
    Array(Vec<Arg>),
    /// Absent value.
    Null,
    /// Error message, written as an error frame.
    Error(String),
    /// Text that the server-side encoder writes as a simple string.
    Simple(String),
}

impl Arg {
    /// Build a nested array argument from anything convertible.
    pub fn array<I, A>(items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        Self::Array(items.into_iter().map(Into::into).collect())
    }

    /// Wrap text so the server-side encoder emits `+text\r\n`.
    pub fn simple(s: impl Into<String>) -> Self {
        Self::Simple(s.into())
    }

    /// An error frame argument.
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) | Self::Simple(s) | Self::Error(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Self::Array(items) => write!(f, "[{}]", render_args(items)),
            Self::Null => f.write_str("null"),
        }
    }
}

/// Render a command's arguments for diagnostics: `SET, key, value`.
pub fn render_args(args: &[Arg]) -> String {
    args.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Arg {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<u32> for Arg {
    fn from(i: u32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<u16> for Arg {
    fn from(i: u16) -> Self {
        Self::Int(i as i64)
    }
}

impl From<f64> for Arg {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(b: &[u8; N]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(items: Vec<Arg>) -> Self {
        Self::Array(items)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
