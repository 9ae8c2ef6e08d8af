//! Streaming RESP2 parser.
//!
//! [`parse`] takes a byte buffer and returns `Ok((RespValue, bytes_consumed))`
//! or `Err(Incomplete)` when more data is needed.
//!
//! Two failure classes are kept apart:
//!
//! - `Protocol` means the framing itself is broken (unknown type byte,
//!   unparsable length, missing terminator). The stream position is lost.
//! - `Decode` means the frame boundaries are intact but the payload is not
//!   what its type promises (`:12a\r\n`, undecodable text). The next frame
//!   can still be read.
//!
//! Arrays nested more than 512 levels deep are a `Protocol` error.
//!
//! Bulk payloads are extracted zero-copy via `Bytes::slice`.

use bytes::Bytes;
use memchr::memchr;

use crate::error::{Error, Result};
use crate::resp::charset::Charset;
use crate::resp::types::RespValue;

/// Parse one RESP value from the front of `buf`, decoding text lines
/// with `charset`.
///
/// Returns `(value, bytes_consumed)` on success.
/// Returns `Err(Incomplete)` when the buffer is too short;
/// callers should read more data and retry.
pub fn parse(buf: &Bytes, charset: Charset) -> Result<(RespValue, usize)> {
    parse_nested(buf, charset, 0)
}

fn parse_nested(buf: &Bytes, charset: Charset, depth: usize) -> Result<(RespValue, usize)> {
    if buf.is_empty() {
        return Err(Error::Incomplete);
    }

    match buf[0] {
        b'+' => parse_simple_string(buf, charset),
        b'-' => parse_error(buf, charset),
        b':' => parse_integer(buf),
        b'$' => parse_bulk_string(buf),
        b'*' => parse_array(buf, charset, depth),
        other => Err(unknown_type(other)),
    }
}

/// Convenience wrapper: parse UTF-8 replies from a byte slice (copies
/// into `Bytes` first).
pub fn parse_slice(buf: &[u8]) -> Result<(RespValue, usize)> {
    parse(&Bytes::copy_from_slice(buf), Charset::Utf8)
}

/// Compute the byte length of one complete RESP frame at the front of `buf`
/// **without allocating** or building a `RespValue` tree.
///
/// Returns `Ok(bytes_consumed)`, `Err(Incomplete)`, or `Err(Protocol)` if
/// the framing is already known to be broken.
pub fn resp_frame_len(buf: &[u8]) -> Result<usize> {
    frame_len_nested(buf, 0)
}

fn frame_len_nested(buf: &[u8], depth: usize) -> Result<usize> {
    if buf.is_empty() {
        return Err(Error::Incomplete);
    }
    match buf[0] {
        b'+' | b'-' | b':' => {
            let (_, next) = read_line(buf, 1)?;
            Ok(next)
        }
        b'$' => {
            let (line, next) = read_line(buf, 1)?;
            let len = parse_int_from_bytes(line, Error::Protocol)?;
            if len < 0 {
                return Ok(next); // $-1\r\n  null bulk
            }
            let data_end = bulk_end(next, len)?;
            if buf.len() < data_end + 2 {
                return Err(Error::Incomplete);
            }
            expect_crlf(buf, data_end)?;
            Ok(data_end + 2)
        }
        b'*' => {
            check_depth(depth)?;
            let (line, mut next) = read_line(buf, 1)?;
            let count = parse_int_from_bytes(line, Error::Protocol)?;
            if count < 0 {
                return Ok(next); // *-1\r\n  null array
            }
            for _ in 0..count {
                next += frame_len_nested(&buf[next..], depth + 1)?;
            }
            Ok(next)
        }
        other => Err(unknown_type(other)),
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Deepest array nesting accepted from a server.
const MAX_DEPTH: usize = 512;

fn check_depth(depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(Error::Protocol(format!(
            "nesting too deep (more than {MAX_DEPTH} levels)"
        )));
    }
    Ok(())
}

fn unknown_type(byte: u8) -> Error {
    Error::Protocol(format!("unknown RESP type byte: 0x{byte:02x}"))
}

/// Find the next `\r\n` in `buf` starting at `offset`.
/// Returns the index of `\r`.
#[inline]
fn find_crlf(buf: &[u8], offset: usize) -> Result<usize> {
    let search = &buf[offset..];
    match memchr(b'\r', search) {
        Some(pos) => {
            let abs = offset + pos;
            if abs + 1 >= buf.len() {
                Err(Error::Incomplete)
            } else if buf[abs + 1] == b'\n' {
                Ok(abs)
            } else {
                Err(Error::Protocol("expected \\n after \\r".into()))
            }
        }
        None => Err(Error::Incomplete),
    }
}

/// Read the line starting at `buf[offset]` up to `\r\n`.
/// Returns `(line_bytes, index_after_crlf)`.
#[inline]
fn read_line(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let cr = find_crlf(buf, offset)?;
    Ok((&buf[offset..cr], cr + 2))
}

#[inline]
fn expect_crlf(buf: &[u8], at: usize) -> Result<()> {
    if buf[at] != b'\r' || buf[at + 1] != b'\n' {
        return Err(Error::Protocol(
            "bulk string not terminated by \\r\\n".into(),
        ));
    }
    Ok(())
}

/// Largest bulk payload a server will send (`proto-max-bulk-len`).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// End offset of a bulk payload starting at `start`.
fn bulk_end(start: usize, len: i64) -> Result<usize> {
    if len > MAX_BULK_LEN {
        return Err(Error::Protocol(format!("bulk length out of range: {len}")));
    }
    Ok(start + len as usize)
}

/// Parse an integer from a byte slice (no allocations).
///
/// `fail` picks the error class: lengths are framing, `:` payloads are not.
fn parse_int_from_bytes(bytes: &[u8], fail: fn(String) -> Error) -> Result<i64> {
    if bytes.is_empty() {
        return Err(fail("empty integer".into()));
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        b'+' => (false, &bytes[1..]),
        _ => (false, bytes),
    };

    if digits.is_empty() {
        return Err(fail("integer has no digits".into()));
    }

    // Accumulate as negative to handle i64::MIN correctly:
    // |i64::MIN| overflows positive i64, but -|digit| never overflows negative i64.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(fail(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(bytes)
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| fail("integer overflow".into()))?;
    }

    if negative {
        Ok(n)
    } else {
        n.checked_neg().ok_or_else(|| fail("integer overflow".into()))
    }
}

// ── Type parsers ──────────────────────────────────────────────────

/// `+<string>\r\n`
fn parse_simple_string(buf: &Bytes, charset: Charset) -> Result<(RespValue, usize)> {
    let (line, next) = read_line(buf, 1)?;
    // Fast path for the most common replies
    let s = match line {
        b"OK" => "OK".to_string(),
        b"PONG" => "PONG".to_string(),
        _ => charset.decode(line)?,
    };
    Ok((RespValue::SimpleString(s), next))
}

/// `-<error message>\r\n`
fn parse_error(buf: &Bytes, charset: Charset) -> Result<(RespValue, usize)> {
    let (line, next) = read_line(buf, 1)?;
    Ok((RespValue::Error(charset.decode(line)?), next))
}

/// `:<integer>\r\n`
fn parse_integer(buf: &Bytes) -> Result<(RespValue, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let i = parse_int_from_bytes(line, Error::Decode)?;
    Ok((RespValue::Integer(i), next))
}

/// `$<length>\r\n<data>\r\n`  or  `$-1\r\n`
fn parse_bulk_string(buf: &Bytes) -> Result<(RespValue, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let len = parse_int_from_bytes(line, Error::Protocol)?;

    if len < 0 {
        return Ok((RespValue::Null, next));
    }

    let data_end = bulk_end(next, len)?;
    if buf.len() < data_end + 2 {
        return Err(Error::Incomplete);
    }
    expect_crlf(buf, data_end)?;

    let data = buf.slice(next..data_end);
    Ok((RespValue::BulkString(data), data_end + 2))
}

/// `*<count>\r\n<elements>`  or  `*-1\r\n`
fn parse_array(buf: &Bytes, charset: Charset, depth: usize) -> Result<(RespValue, usize)> {
    check_depth(depth)?;
    let (line, mut next) = read_line(buf, 1)?;
    let count = parse_int_from_bytes(line, Error::Protocol)?;

    if count < 0 {
        return Ok((RespValue::Null, next));
    }

    // Cap the preallocation: the count comes off the wire.
    let mut elements = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        let sub = buf.slice(next..);
        let (val, consumed) = parse_nested(&sub, charset, depth + 1)?;
        elements.push(val);
        next += consumed;
    }
    Ok((RespValue::Array(elements), next))
}

// ── Tests ──────────────────────────────────────────────────────────
