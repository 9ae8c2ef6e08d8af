//! An async Redis client speaking RESP2 over TCP.
//!
//! Commands are pipelined: a connection keeps writing while earlier
//! replies are still on their way, up to a fixed depth. A [`Client`]
//! spreads requests over a small set of such connections.
//!
//! ```ignore
//! use pipedis::{Client, Commands};
//!
//! let client = Client::from_url("redis://127.0.0.1:6379")?;
//! client.set("greeting", "hello").await?;
//! assert_eq!(client.get("greeting").await?.as_deref(), Some(&b"hello"[..]));
//! client.shutdown().await;
//! ```

pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod resp;

pub use client::{Client, ClientState};
pub use commands::{Commands, Executor};
pub use config::ClientConfig;
pub use error::{Error, RedisErrorKind, Result};
pub use resp::{Arg, Charset, RespValue};
