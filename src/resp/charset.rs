//! Text charsets used on the wire.
//!
//! Bulk frames are length-prefixed by the *encoded* byte length, so the
//! charset decides both the payload bytes and the prefix.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Charset used to turn text arguments into bytes and reply lines back
/// into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    /// ISO-8859-1: one byte per char, code points above U+00FF are rejected.
    Latin1,
}

impl Charset {
    /// Encode `s` into wire bytes. Borrows when no transcoding is needed.
    pub fn encode<'a>(&self, s: &'a str) -> Result<Cow<'a, [u8]>> {
        match self {
            Self::Utf8 => Ok(Cow::Borrowed(s.as_bytes())),
            Self::Latin1 if s.is_ascii() => Ok(Cow::Borrowed(s.as_bytes())),
            Self::Latin1 => {
                let mut out = Vec::with_capacity(s.len());
                for c in s.chars() {
                    let code = c as u32;
                    if code > 0xFF {
                        return Err(Error::Encoding(format!(
                            "character {c:?} is not representable in ISO-8859-1"
                        )));
                    }
                    out.push(code as u8);
                }
                Ok(Cow::Owned(out))
            }
        }
    }

    /// Decode one reply line.
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| Error::Decode(format!("invalid UTF-8: {e}"))),
            Self::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Latin1 => "ISO-8859-1",
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Charset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Self::Latin1),
            other => Err(Error::Config(format!("unsupported charset: {other}"))),
        }
    }
}
