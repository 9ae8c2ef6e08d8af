//! Shared helpers for integration tests.
//!
//! Most tests run against [`MockServer`], a scripted RESP server on a
//! loopback port, so they need nothing installed. Tests against a real
//! server use [`live_client`] and are skipped unless `REDIS_URL` is set.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use pipedis::resp::writer::encode_server;
use pipedis::{Arg, Charset, Client, ClientConfig, RespValue};

/// Global counter for generating unique key prefixes per test.
static TEST_ID: AtomicUsize = AtomicUsize::new(0);

/// Return a unique prefix for test keys to avoid collisions between tests.
pub fn test_prefix() -> String {
    let id = TEST_ID.fetch_add(1, Ordering::Relaxed);
    format!("pipedis_test_{}_{}", std::process::id(), id)
}

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Mock server ────────────────────────────────────────────────────

/// What the mock server does with one request.
pub enum Reply {
    /// Encode and write back.
    Value(Arg),
    /// Write these bytes verbatim.
    Raw(Vec<u8>),
    /// Wait, then encode and write back. Later requests on the same
    /// connection wait too.
    Delayed(Duration, Arg),
    /// Write back, then hang up.
    Last(Arg),
    /// Say nothing.
    Nothing,
    /// Hang up without answering.
    Close,
}

pub fn ok() -> Reply {
    Reply::Value(Arg::simple("OK"))
}

pub fn text(b: &Bytes) -> String {
    String::from_utf8_lossy(b).into_owned()
}

type Handler = dyn Fn(&[Bytes]) -> Reply + Send + Sync;

/// A scripted RESP server on `127.0.0.1`.
///
/// Every accepted connection is served in its own task; each request
/// frame is logged and passed to the handler.
pub struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&[Bytes]) -> Reply + Send + Sync + 'static,
    {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let task = {
            let accepted = accepted.clone();
            let disconnected = disconnected.clone();
            let log = log.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let handler = handler.clone();
                    let log = log.clone();
                    let disconnected = disconnected.clone();
                    tokio::spawn(async move {
                        serve_connection(socket, handler, log).await;
                        disconnected.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            addr,
            accepted,
            disconnected,
            log,
            task,
        }
    }

    /// A small in-memory key/value server understanding the commands
    /// the typed wrappers use. `AUTH` is checked against `password`.
    pub async fn kv(password: Option<&str>) -> Self {
        let store = Mutex::new(HashMap::<Bytes, Bytes>::new());
        let hashes = Mutex::new(HashMap::<(Bytes, Bytes), Bytes>::new());
        let password = password.map(|p| Bytes::copy_from_slice(p.as_bytes()));
        Self::start(move |args| {
            let cmd = text(&args[0]).to_ascii_uppercase();
            match (cmd.as_str(), &args[1..]) {
                ("AUTH", [given]) => match &password {
                    Some(p) if p == given => ok(),
                    Some(_) => Reply::Value(Arg::error("WRONGPASS invalid username-password pair")),
                    None => Reply::Value(Arg::error(
                        "ERR AUTH <password> called without any password configured",
                    )),
                },
                ("QUIT", _) => Reply::Last(Arg::simple("OK")),
                ("PING", []) => Reply::Value(Arg::simple("PONG")),
                ("ECHO", [msg]) => Reply::Value(Arg::Bytes(msg.clone())),
                ("SET", [k, v]) => {
                    store.lock().insert(k.clone(), v.clone());
                    ok()
                }
                ("GET", [k]) => Reply::Value(store.lock().get(k).cloned().into()),
                ("DEL", keys) => {
                    let mut store = store.lock();
                    let n = keys.iter().filter(|k| store.remove(*k).is_some()).count();
                    Reply::Value(Arg::Int(n as i64))
                }
                ("EXISTS", keys) => {
                    let store = store.lock();
                    let n = keys.iter().filter(|k| store.contains_key(*k)).count();
                    Reply::Value(Arg::Int(n as i64))
                }
                ("INCR", [k]) => incr_by(&store, k, 1),
                ("INCRBY", [k, by]) => match text(by).parse() {
                    Ok(by) => incr_by(&store, k, by),
                    Err(_) => not_an_integer(),
                },
                ("APPEND", [k, v]) => {
                    let mut store = store.lock();
                    let mut joined = store.get(k).map(|b| b.to_vec()).unwrap_or_default();
                    joined.extend_from_slice(v);
                    let len = joined.len();
                    store.insert(k.clone(), joined.into());
                    Reply::Value(Arg::Int(len as i64))
                }
                ("STRLEN", [k]) => {
                    let len = store.lock().get(k).map_or(0, |b| b.len());
                    Reply::Value(Arg::Int(len as i64))
                }
                ("EXPIRE", [k, _]) => {
                    let exists = store.lock().contains_key(k);
                    Reply::Value(Arg::Int(exists as i64))
                }
                ("TTL", [k]) => {
                    let ttl = if store.lock().contains_key(k) { -1 } else { -2 };
                    Reply::Value(Arg::Int(ttl))
                }
                ("MGET", keys) => {
                    let store = store.lock();
                    Reply::Value(Arg::array(keys.iter().map(|k| store.get(k).cloned())))
                }
                ("HSET", [k, f, v]) => {
                    let added = hashes.lock().insert((k.clone(), f.clone()), v.clone()).is_none();
                    Reply::Value(Arg::Int(added as i64))
                }
                ("HGET", [k, f]) => {
                    let v = hashes.lock().get(&(k.clone(), f.clone())).cloned();
                    Reply::Value(v.into())
                }
                _ => Reply::Value(Arg::error(format!("ERR unknown command '{cmd}'"))),
            }
        })
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.addr.port())
    }

    pub fn client(&self) -> Client {
        Client::new(self.config()).unwrap()
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Number of connections that have ended, from either side.
    pub fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Every request received, across all connections, in arrival order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().clone()
    }

    /// Names of the requests received, e.g. `["AUTH", "PING", "QUIT"]`.
    pub fn command_names(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|c| c.first().cloned())
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn not_an_integer() -> Reply {
    Reply::Value(Arg::error("ERR value is not an integer or out of range"))
}

fn incr_by(store: &Mutex<HashMap<Bytes, Bytes>>, key: &Bytes, by: i64) -> Reply {
    let mut store = store.lock();
    let current = match store.get(key) {
        Some(v) => match text(v).parse::<i64>() {
            Ok(n) => n,
            Err(_) => return not_an_integer(),
        },
        None => 0,
    };
    let next = current + by;
    store.insert(key.clone(), Bytes::from(next.to_string()));
    Reply::Value(Arg::Int(next))
}

async fn serve_connection(
    socket: tokio::net::TcpStream,
    handler: Arc<Handler>,
    log: Arc<Mutex<Vec<Vec<String>>>>,
) {
    let (read, mut write) = socket.into_split();
    let mut reader = pipedis::resp::ResponseReader::new(read, Charset::Utf8);
    loop {
        let args: Vec<Bytes> = match reader.read_value().await {
            Ok(RespValue::Array(items)) => items
                .into_iter()
                .filter_map(|v| match v {
                    RespValue::BulkString(b) => Some(b),
                    _ => None,
                })
                .collect(),
            _ => return,
        };
        if args.is_empty() {
            return;
        }
        log.lock().push(args.iter().map(text).collect());

        let (bytes, hang_up) = match handler(&args) {
            Reply::Value(v) => (encode(&v), false),
            Reply::Raw(b) => (b, false),
            Reply::Delayed(wait, v) => {
                tokio::time::sleep(wait).await;
                (encode(&v), false)
            }
            Reply::Last(v) => (encode(&v), true),
            Reply::Nothing => continue,
            Reply::Close => return,
        };
        if write.write_all(&bytes).await.is_err() || hang_up {
            return;
        }
    }
}

fn encode(value: &Arg) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_server(value, Charset::Utf8, &mut buf).unwrap();
    buf.to_vec()
}

// ── Live server ────────────────────────────────────────────────────

/// A client for the server at `REDIS_URL`, or `None` when it is not set.
pub async fn live_client() -> Option<Client> {
    let url = std::env::var("REDIS_URL").ok()?;
    init_tracing();
    let client = Client::from_url(&url).expect("invalid REDIS_URL");
    require_redis(&client).await;
    Some(client)
}

/// Panic unless the server answers PING.
pub async fn require_redis(client: &Client) {
    match client.execute(["PING"]).await {
        Ok(RespValue::SimpleString(ref s)) if s == "PONG" => {}
        other => panic!("Redis server not available at REDIS_URL: {other:?}"),
    }
}

/// Execute a command on the client (convenience wrapper).
pub async fn exec(client: &Client, args: &[&str]) -> RespValue {
    client.execute(args.iter().copied()).await.expect("command failed")
}

/// Execute a command and expect an OK response.
pub async fn exec_ok(client: &Client, args: &[&str]) {
    match exec(client, args).await {
        RespValue::SimpleString(ref s) if s == "OK" => {}
        other => panic!("expected OK, got {:?}", other),
    }
}

/// Execute a command and expect an integer response.
pub async fn exec_int(client: &Client, args: &[&str]) -> i64 {
    match exec(client, args).await {
        RespValue::Integer(n) => n,
        other => panic!("expected Integer, got {:?}", other),
    }
}

/// Execute a command and expect a bulk string response (returns bytes).
pub async fn exec_bulk(client: &Client, args: &[&str]) -> Bytes {
    match exec(client, args).await {
        RespValue::BulkString(data) => data,
        other => panic!("expected BulkString, got {:?}", other),
    }
}

/// Execute a command and expect a null/nil response.
pub async fn exec_null(client: &Client, args: &[&str]) {
    match exec(client, args).await {
        RespValue::Null => {}
        other => panic!("expected Null, got {:?}", other),
    }
}

/// Poll `cond` until it holds. Panics after five seconds.
pub async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
