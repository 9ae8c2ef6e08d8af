//! Client configuration and URL parsing.
//!
//! Supported URL form:
//! - `redis://[:password@]host[:port]`
//!
//! IPv6 hosts go in brackets (`redis://[::1]:6380`). TLS (`rediss://`) and
//! ACL user names are not supported and are rejected.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::resp::charset::Charset;
use crate::resp::reader::DEFAULT_MAX_BUF_SIZE;

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;
/// Default number of physical connections per client.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
/// Default number of in-flight requests per connection.
pub const DEFAULT_PIPELINE_DEPTH: usize = 10;

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Optional password, sent with `AUTH` on every new connection.
    pub password: Option<String>,
    /// Soft cap on physical connections. Once reached, requests are
    /// spread across the existing ones.
    pub max_connections: usize,
    /// Requests written but not yet answered, per connection.
    pub pipeline_depth: usize,
    /// Capacity of the dispatcher's request queue.
    pub dispatch_capacity: usize,
    /// Connect timeout in milliseconds (0 = no timeout).
    pub connect_timeout_ms: u64,
    /// Maximum read buffer size per connection in bytes.
    pub max_buffer_size: usize,
    /// Charset for text arguments and reply lines.
    pub charset: Charset,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            dispatch_capacity: 128,
            connect_timeout_ms: 5000,
            max_buffer_size: DEFAULT_MAX_BUF_SIZE,
            charset: Charset::Utf8,
        }
    }
}

impl ClientConfig {
    /// Config for `host:port` with every other field defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a Redis URL into a ClientConfig.
    pub fn from_url(url: &str) -> Result<Self> {
        let mut config = Self::default();

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("invalid URL, missing ://: {url}")))?;

        match scheme {
            "redis" => {}
            "rediss" => {
                return Err(Error::Config(
                    "TLS connections (rediss://) are not supported".into(),
                ));
            }
            _ => return Err(Error::Config(format!("unknown URL scheme: {scheme}"))),
        }

        let host_part = match rest.split_once('/') {
            Some((before, "")) => before,
            Some((_, path)) => {
                return Err(Error::Config(format!(
                    "database selection is not supported: /{path}"
                )));
            }
            None => rest,
        };

        let host_port = match host_part.rsplit_once('@') {
            Some((userinfo, hp)) => {
                parse_userinfo(&mut config, userinfo)?;
                hp
            }
            None => host_part,
        };

        parse_host_port(host_port, &mut config.host, &mut config.port)?;
        Ok(config)
    }

    /// Return the server address as "host:port".
    pub fn primary_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `None` when connect timeouts are disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.pipeline_depth == 0 {
            return Err(Error::Config("pipeline_depth must be at least 1".into()));
        }
        if self.dispatch_capacity == 0 {
            return Err(Error::Config("dispatch_capacity must be at least 1".into()));
        }
        if self.max_buffer_size < 1024 {
            return Err(Error::Config(format!(
                "max_buffer_size too small: {}",
                self.max_buffer_size
            )));
        }
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        Ok(())
    }
}

// ── URL parsing helpers ────────────────────────────────────────────

/// Parse `:pass` or a bare `pass`. AUTH here is password-only.
fn parse_userinfo(config: &mut ClientConfig, userinfo: &str) -> Result<()> {
    let pass = match userinfo.split_once(':') {
        Some(("", pass)) => pass,
        Some((user, _)) => {
            return Err(Error::Config(format!(
                "user names are not supported (got {user:?}), use redis://:password@host"
            )));
        }
        None => userinfo,
    };
    if !pass.is_empty() {
        config.password = Some(pass.to_string());
    }
    Ok(())
}

/// Parse `host[:port]` or `[ipv6]:port` into host/port variables.
fn parse_host_port(s: &str, host: &mut String, port: &mut u16) -> Result<()> {
    if s.starts_with('[') {
        let close = s
            .find(']')
            .ok_or_else(|| Error::Config(format!("unclosed IPv6 bracket: {s}")))?;
        *host = s[1..close].to_string();
        if let Some(port_str) = s[close + 1..].strip_prefix(':') {
            *port = parse_port(port_str)?;
        }
    } else if let Some((h, p)) = s.rsplit_once(':') {
        if h.contains(':') {
            // bare IPv6 without a port
            *host = s.to_string();
        } else {
            *host = h.to_string();
            *port = parse_port(p)?;
        }
    } else {
        *host = s.to_string();
    }

    if host.is_empty() {
        *host = "127.0.0.1".to_string();
    }
    Ok(())
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| Error::Config(format!("invalid port: {s}")))
}

// ── Tests ──────────────────────────────────────────────────────────
