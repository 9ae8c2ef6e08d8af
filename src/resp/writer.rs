//! RESP serializer.
//!
//! Two entry points share one framing core:
//!
//! - [`encode`] is the client encoder. With `force_bulk` (the default for
//!   commands) every scalar becomes a bulk string; without it values get
//!   their natural frame (`+text`, `:int`, `$-1`).
//! - [`encode_server`] is what a server (or a test double) writes: plain
//!   strings are bulk, [`Arg::Simple`] forces `+text`, integers are `:int`.
//!
//! Encoding is all-or-nothing: on error the output buffer is left exactly
//! as it was, so nothing half-written can reach a socket.

use bytes::{BufMut, BytesMut};
use itoa::Buffer;

use crate::error::{Error, Result};
use crate::resp::charset::Charset;
use crate::resp::types::Arg;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy)]
enum Mode {
    Client { force_bulk: bool },
    Server,
}

/// Encode one value with the client encoder.
pub fn encode(value: &Arg, force_bulk: bool, charset: Charset, buf: &mut BytesMut) -> Result<()> {
    atomically(buf, |buf| {
        write_value(value, Mode::Client { force_bulk }, charset, buf)
    })
}

/// Encode one value the way a server replies.
pub fn encode_server(value: &Arg, charset: Charset, buf: &mut BytesMut) -> Result<()> {
    atomically(buf, |buf| write_value(value, Mode::Server, charset, buf))
}

/// Encode a command (list of arguments) as an array of bulk strings.
///
/// # Example
/// ```ignore
/// encode_command(&args!["SET", "key", 4711], Charset::Utf8, &mut buf)?;
/// // → *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$4\r\n4711\r\n
/// ```
pub fn encode_command(args: &[Arg], charset: Charset, buf: &mut BytesMut) -> Result<()> {
    atomically(buf, |buf| {
        write_header(b'*', args.len(), buf);
        for arg in args {
            write_value(arg, Mode::Client { force_bulk: true }, charset, buf)?;
        }
        Ok(())
    })
}

/// Convenience: client-encode a single value into a fresh `Vec<u8>`.
pub fn encode_to_vec(value: &Arg, force_bulk: bool, charset: Charset) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    encode(value, force_bulk, charset, &mut buf)?;
    Ok(buf.to_vec())
}

fn atomically<F>(buf: &mut BytesMut, f: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let start = buf.len();
    let result = f(buf);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

fn write_value(value: &Arg, mode: Mode, charset: Charset, buf: &mut BytesMut) -> Result<()> {
    match value {
        Arg::Array(items) => {
            write_header(b'*', items.len(), buf);
            for item in items {
                write_value(item, mode, charset, buf)?;
            }
            Ok(())
        }
        Arg::Bytes(data) => {
            write_bulk(data, buf);
            Ok(())
        }
        Arg::Error(msg) => write_error(msg, charset, buf),
        _ => match mode {
            Mode::Client { force_bulk: true } => match value {
                Arg::Str(s) | Arg::Simple(s) => write_text_bulk(s, charset, buf),
                Arg::Int(i) => {
                    write_bulk(Buffer::new().format(*i).as_bytes(), buf);
                    Ok(())
                }
                Arg::Float(x) => write_text_bulk(&x.to_string(), charset, buf),
                Arg::Null => write_text_bulk("null", charset, buf),
                other => Err(unsupported(other)),
            },
            Mode::Client { force_bulk: false } => match value {
                Arg::Str(s) | Arg::Simple(s) => write_string(s, charset, buf),
                Arg::Int(i) => {
                    write_integer(*i, buf);
                    Ok(())
                }
                Arg::Null => {
                    write_null(buf);
                    Ok(())
                }
                other => Err(unsupported(other)),
            },
            Mode::Server => match value {
                Arg::Str(s) => write_text_bulk(s, charset, buf),
                Arg::Simple(s) => write_string(s, charset, buf),
                Arg::Int(i) => {
                    write_integer(*i, buf);
                    Ok(())
                }
                Arg::Null => {
                    write_null(buf);
                    Ok(())
                }
                other => Err(unsupported(other)),
            },
        },
    }
}

fn unsupported(value: &Arg) -> Error {
    Error::Encoding(format!("unsupported value for RESP framing: {value:?}"))
}

/// `<type><n>\r\n`
fn write_header(type_byte: u8, n: usize, buf: &mut BytesMut) {
    buf.put_u8(type_byte);
    buf.extend_from_slice(Buffer::new().format(n).as_bytes());
    buf.extend_from_slice(CRLF);
}

/// `$<len>\r\n<data>\r\n`
fn write_bulk(data: &[u8], buf: &mut BytesMut) {
    buf.reserve(1 + 20 + 2 + data.len() + 2);
    write_header(b'$', data.len(), buf);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

/// Bulk string framed by the byte length of the *encoded* text.
fn write_text_bulk(text: &str, charset: Charset, buf: &mut BytesMut) -> Result<()> {
    let encoded = charset.encode(text)?;
    write_bulk(&encoded, buf);
    Ok(())
}

/// `+text\r\n`, falling back to bulk when the text spans lines.
fn write_string(text: &str, charset: Charset, buf: &mut BytesMut) -> Result<()> {
    if text.contains(['\r', '\n']) {
        return write_text_bulk(text, charset, buf);
    }
    let encoded = charset.encode(text)?;
    buf.put_u8(b'+');
    buf.extend_from_slice(&encoded);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// `:<value>\r\n`
fn write_integer(value: i64, buf: &mut BytesMut) {
    buf.put_u8(b':');
    buf.extend_from_slice(Buffer::new().format(value).as_bytes());
    buf.extend_from_slice(CRLF);
}

/// `$-1\r\n`
fn write_null(buf: &mut BytesMut) {
    buf.extend_from_slice(b"$-1\r\n");
}

/// `-<message>\r\n` with line breaks removed.
fn write_error(msg: &str, charset: Charset, buf: &mut BytesMut) -> Result<()> {
    let line: String = msg.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let line = if line.is_empty() { "Error".to_string() } else { line };
    let encoded = charset.encode(&line)?;
    buf.put_u8(b'-');
    buf.extend_from_slice(&encoded);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// Helper macro for building argument lists ergonomically.
///
/// Usage:
/// ```ignore
/// let args = args!["SET", "mykey", 4711];
/// let args = args!["GET", key_var];
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {{
        ::std::vec![$($crate::resp::types::Arg::from($arg)),*]
    }};
}

// ── Tests ──────────────────────────────────────────────────────────
