//! Typed command wrappers.
//!
//! Each wrapper builds an argument list, hands it to an [`Executor`] and
//! reshapes the untyped reply. They need nothing from the client besides
//! `execute`, so anything implementing [`Executor`] gets them for free.

use std::future::Future;

use bytes::Bytes;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::resp::types::{Arg, RespValue};

/// Something that can run one command.
pub trait Executor: Send + Sync {
    fn execute_args(&self, args: Vec<Arg>) -> impl Future<Output = Result<RespValue>> + Send;
}

impl Executor for Client {
    fn execute_args(&self, args: Vec<Arg>) -> impl Future<Output = Result<RespValue>> + Send {
        self.execute(args)
    }
}

/// Typed wrappers over [`Executor::execute_args`].
pub trait Commands: Executor {
    /// `PING` → `"PONG"`
    fn ping(&self) -> impl Future<Output = Result<String>> + Send {
        async move { into_string(self.execute_args(vec![Arg::from("PING")]).await?) }
    }

    fn echo(&self, message: impl Into<Arg>) -> impl Future<Output = Result<Bytes>> + Send {
        let args = vec![Arg::from("ECHO"), message.into()];
        async move {
            into_bytes(self.execute_args(args).await?)?
                .ok_or_else(|| Error::Type("ECHO returned null".into()))
        }
    }

    /// `GET key` → `None` when the key does not exist.
    fn get(&self, key: impl Into<Arg>) -> impl Future<Output = Result<Option<Bytes>>> + Send {
        let args = vec![Arg::from("GET"), key.into()];
        async move { into_bytes(self.execute_args(args).await?) }
    }

    fn set(
        &self,
        key: impl Into<Arg>,
        value: impl Into<Arg>,
    ) -> impl Future<Output = Result<()>> + Send {
        let args = vec![Arg::from("SET"), key.into(), value.into()];
        async move { into_ok(self.execute_args(args).await?) }
    }

    /// `DEL key [key …]` → number of keys removed.
    fn del<I, K>(&self, keys: I) -> impl Future<Output = Result<i64>> + Send
    where
        I: IntoIterator<Item = K>,
        K: Into<Arg>,
    {
        let args = with_keys("DEL", keys);
        async move { into_int(self.execute_args(args).await?) }
    }

    /// `EXISTS key [key …]` → number of the given keys that exist.
    fn exists<I, K>(&self, keys: I) -> impl Future<Output = Result<i64>> + Send
    where
        I: IntoIterator<Item = K>,
        K: Into<Arg>,
    {
        let args = with_keys("EXISTS", keys);
        async move { into_int(self.execute_args(args).await?) }
    }

    fn incr(&self, key: impl Into<Arg>) -> impl Future<Output = Result<i64>> + Send {
        let args = vec![Arg::from("INCR"), key.into()];
        async move { into_int(self.execute_args(args).await?) }
    }

    fn incrby(&self, key: impl Into<Arg>, by: i64) -> impl Future<Output = Result<i64>> + Send {
        let args = vec![Arg::from("INCRBY"), key.into(), Arg::from(by)];
        async move { into_int(self.execute_args(args).await?) }
    }

    /// `APPEND key value` → length after the append.
    fn append(
        &self,
        key: impl Into<Arg>,
        value: impl Into<Arg>,
    ) -> impl Future<Output = Result<i64>> + Send {
        let args = vec![Arg::from("APPEND"), key.into(), value.into()];
        async move { into_int(self.execute_args(args).await?) }
    }

    fn strlen(&self, key: impl Into<Arg>) -> impl Future<Output = Result<i64>> + Send {
        let args = vec![Arg::from("STRLEN"), key.into()];
        async move { into_int(self.execute_args(args).await?) }
    }

    /// `EXPIRE key seconds` → whether a timeout was set.
    fn expire(
        &self,
        key: impl Into<Arg>,
        seconds: i64,
    ) -> impl Future<Output = Result<bool>> + Send {
        let args = vec![Arg::from("EXPIRE"), key.into(), Arg::from(seconds)];
        async move { Ok(into_int(self.execute_args(args).await?)? == 1) }
    }

    /// `TTL key` → seconds left, `-1` without expiry, `-2` when missing.
    fn ttl(&self, key: impl Into<Arg>) -> impl Future<Output = Result<i64>> + Send {
        let args = vec![Arg::from("TTL"), key.into()];
        async move { into_int(self.execute_args(args).await?) }
    }

    fn mget<I, K>(&self, keys: I) -> impl Future<Output = Result<Vec<Option<Bytes>>>> + Send
    where
        I: IntoIterator<Item = K>,
        K: Into<Arg>,
    {
        let args = with_keys("MGET", keys);
        async move {
            match self.execute_args(args).await? {
                RespValue::Array(items) => items.into_iter().map(into_bytes).collect(),
                other => Err(unexpected("array", &other)),
            }
        }
    }

    /// `HSET key field value` → number of fields added.
    fn hset(
        &self,
        key: impl Into<Arg>,
        field: impl Into<Arg>,
        value: impl Into<Arg>,
    ) -> impl Future<Output = Result<i64>> + Send {
        let args = vec![Arg::from("HSET"), key.into(), field.into(), value.into()];
        async move { into_int(self.execute_args(args).await?) }
    }

    fn hget(
        &self,
        key: impl Into<Arg>,
        field: impl Into<Arg>,
    ) -> impl Future<Output = Result<Option<Bytes>>> + Send {
        let args = vec![Arg::from("HGET"), key.into(), field.into()];
        async move { into_bytes(self.execute_args(args).await?) }
    }
}

impl<T: Executor + ?Sized> Commands for T {}

// ── Reply conversion ───────────────────────────────────────────────

fn with_keys<I, K>(command: &str, keys: I) -> Vec<Arg>
where
    I: IntoIterator<Item = K>,
    K: Into<Arg>,
{
    let mut args = vec![Arg::from(command)];
    args.extend(keys.into_iter().map(Into::into));
    args
}

fn unexpected(expected: &str, got: &RespValue) -> Error {
    Error::Type(format!("expected {expected} reply, got {}", got.type_name()))
}

fn into_ok(value: RespValue) -> Result<()> {
    match value {
        RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
        other => Err(unexpected("OK", &other)),
    }
}

fn into_int(value: RespValue) -> Result<i64> {
    value.as_int().ok_or_else(|| unexpected("integer", &value))
}

fn into_string(value: RespValue) -> Result<String> {
    match value {
        RespValue::SimpleString(s) => Ok(s),
        RespValue::BulkString(b) => String::from_utf8(b.to_vec())
            .map_err(|e| Error::Type(format!("reply is not valid UTF-8: {e}"))),
        other => Err(unexpected("string", &other)),
    }
}

fn into_bytes(value: RespValue) -> Result<Option<Bytes>> {
    match value {
        RespValue::BulkString(b) => Ok(Some(b)),
        RespValue::SimpleString(s) => Ok(Some(Bytes::from(s))),
        RespValue::Null => Ok(None),
        other => Err(unexpected("bulk string", &other)),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
