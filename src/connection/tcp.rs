//! One physical connection to a Redis server.
//!
//! A [`Connection`] is a handle to a spawned task that owns the socket.
//! The task connects, authenticates if a password is configured, and
//! then runs two loops side by side:
//!
//! ```text
//!   send()  ──► request queue ──► send loop ──► socket
//!                (unbounded)          │
//!                                     ▼
//!                              slot queue (bounded, pipeline depth)
//!                                     │
//!              socket ──► receive loop ◄┘ ──► result slot
//! ```
//!
//! The send loop forwards each result slot to the receive loop *before*
//! writing its frame, so the receive loop only ever waits on slots in
//! write order and can never read a reply nobody is waiting for. A full
//! slot queue stalls the send loop, so at most `pipeline_depth + 1`
//! requests are written and unanswered on one socket: the queued slots
//! plus the one the receive loop is reading a reply for.
//!
//! Whatever ends the connection (connect failure, rejected AUTH, broken
//! framing, EOF, [`Connection::close`]), every request still queued or in
//! flight is failed with the same cause.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::connection::slot::{Request, ResultSlot};
use crate::error::{Error, Result};
use crate::resp::charset::Charset;
use crate::resp::pool::write_buffers;
use crate::resp::reader::ResponseReader;
use crate::resp::types::Arg;
use crate::resp::writer::encode_command;

/// Lifecycle of a connection.
///
/// `Connecting → Authenticating → Ready ⇄ Busy → Closed`; any state may
/// go straight to `Closed`, and `Closed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Only entered when a password is configured.
    Authenticating,
    Ready,
    /// Ready with at least one request outstanding.
    Busy,
    Closed,
}

/// State shared between the handle and the connection task.
struct Shared {
    id: u64,
    /// Set while connecting and while a reply is being decoded.
    in_use: AtomicBool,
    /// Requests accepted by `send` and not yet answered.
    pending: AtomicUsize,
    lifecycle: watch::Sender<ConnectionState>,
    /// Why the connection closed. First cause wins.
    cause: Mutex<Option<Error>>,
}

impl Shared {
    fn transition(&self, next: ConnectionState) {
        self.lifecycle.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn shutdown(&self, cause: Error) {
        {
            let mut slot = self.cause.lock();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.transition(ConnectionState::Closed);
    }

    fn cause(&self) -> Error {
        self.cause
            .lock()
            .clone()
            .unwrap_or_else(|| Error::Closed("connection closed".into()))
    }

    fn state(&self) -> ConnectionState {
        *self.lifecycle.borrow()
    }

    fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolves once the connection is `Closed`.
    async fn closed(&self) {
        let mut rx = self.lifecycle.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn finish_one(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to a connection task.
///
/// Dropping the handle lets the task finish the requests it already
/// has and then exit.
pub struct Connection {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Spawn a connection task for `config`'s server.
    ///
    /// Requests can be sent right away; they are held until the connection
    /// is ready. When the task ends, `id` is sent on `on_close`.
    pub fn open(
        id: u64,
        config: Arc<ClientConfig>,
        on_close: Option<mpsc::UnboundedSender<u64>>,
    ) -> Self {
        let (lifecycle, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            id,
            in_use: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
            lifecycle,
            cause: Mutex::new(None),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(shared.clone(), config, rx, on_close));
        Self {
            shared,
            requests: tx,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Advisory: true while connecting or while requests are outstanding.
    pub fn in_use(&self) -> bool {
        self.shared.in_use.load(Ordering::Acquire)
            || self.shared.pending.load(Ordering::Acquire) > 0
    }

    pub fn state(&self) -> ConnectionState {
        match self.shared.state() {
            ConnectionState::Ready if self.in_use() => ConnectionState::Busy,
            state => state,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The error that closed the connection, once it is closed.
    pub fn close_cause(&self) -> Option<Error> {
        self.shared.cause.lock().clone()
    }

    /// Queue a request. Hands the request back if the connection no
    /// longer accepts work.
    pub fn send(&self, request: Request) -> std::result::Result<(), Request> {
        if self.shared.is_closed() {
            return Err(request);
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.requests.send(request).map_err(|e| {
            self.shared.finish_one();
            e.0
        })
    }

    /// Close immediately. Idempotent.
    pub fn close(&self) {
        self.close_with(Error::Closed("connection closed".into()));
    }

    /// Close, failing outstanding requests with `cause`.
    pub fn close_with(&self, cause: Error) {
        self.shared.shutdown(cause);
    }

    /// Stop accepting requests and let the queued ones finish.
    pub fn finish(self) -> ClosingConnection {
        ClosingConnection {
            shared: self.shared,
            task: self.task,
        }
    }

    /// Wait for the connection task to end.
    pub async fn join(self) {
        drop(self.requests);
        let _ = self.task.await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// A connection draining its last requests. See [`Connection::finish`].
pub struct ClosingConnection {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl ClosingConnection {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Give up on the drain, failing what is left with `cause`.
    pub fn abort(&self, cause: Error) {
        self.shared.shutdown(cause);
    }

    /// Wait for the connection task to end.
    pub async fn wait(&mut self) {
        let _ = (&mut self.task).await;
    }
}

// ── Connection task ────────────────────────────────────────────────

async fn run(
    shared: Arc<Shared>,
    config: Arc<ClientConfig>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    on_close: Option<mpsc::UnboundedSender<u64>>,
) {
    let established = tokio::select! {
        biased;
        _ = shared.closed() => None,
        res = establish(&shared, &config) => match res {
            Ok(io) => Some(io),
            Err(e) => {
                warn!(
                    conn = shared.id,
                    addr = %config.primary_addr(),
                    error = %e,
                    "connection setup failed"
                );
                shared.shutdown(e);
                None
            }
        },
    };

    if let Some((reader, writer)) = established {
        serve(&shared, config.charset, config.pipeline_depth, reader, writer, &mut requests).await;
    }

    shared.shutdown(Error::Closed("connection closed".into()));
    requests.close();
    let cause = shared.cause();
    let mut failed = 0usize;
    while let Ok(request) = requests.try_recv() {
        request.fail(cause.clone());
        failed += 1;
    }
    debug!(conn = shared.id, failed, cause = %cause, "connection closed");

    if let Some(tx) = on_close {
        let _ = tx.send(shared.id);
    }
}

type Io = (ResponseReader<OwnedReadHalf>, OwnedWriteHalf);

async fn establish(shared: &Shared, config: &ClientConfig) -> Result<Io> {
    let addr = config.primary_addr();
    debug!(conn = shared.id, %addr, "connecting");

    let connect = TcpStream::connect(addr.as_str());
    let stream = match config.connect_timeout() {
        Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
            Error::Timeout(format!("connection to {addr} timed out after {timeout:?}"))
        })??,
        None => connect.await?,
    };
    stream.set_nodelay(true).ok(); // Disable Nagle for low latency

    let (read, mut write) = stream.into_split();
    let mut reader = ResponseReader::with_max_buf(read, config.charset, config.max_buffer_size);

    if let Some(password) = &config.password {
        shared.transition(ConnectionState::Authenticating);
        authenticate(&mut reader, &mut write, password, config.charset).await?;
        debug!(conn = shared.id, "authenticated");
    }

    shared.in_use.store(false, Ordering::Release);
    shared.transition(ConnectionState::Ready);
    debug!(conn = shared.id, %addr, "connection ready");
    Ok((reader, write))
}

/// Send `AUTH <password>` and wait for the reply. Only an error reply
/// counts as a rejection.
async fn authenticate(
    reader: &mut ResponseReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    password: &str,
    charset: Charset,
) -> Result<()> {
    let mut buf = write_buffers().get();
    encode_command(&[Arg::from("AUTH"), Arg::from(password)], charset, &mut buf)?;
    writer.write_all(&buf).await?;
    match reader.read_message().await {
        Ok(_) => Ok(()),
        Err(Error::Redis { message, .. }) => Err(Error::Auth(message)),
        Err(e) => Err(e),
    }
}

async fn serve(
    shared: &Shared,
    charset: Charset,
    pipeline_depth: usize,
    reader: ResponseReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    requests: &mut mpsc::UnboundedReceiver<Request>,
) {
    let (slots_tx, slots_rx) = mpsc::channel(pipeline_depth);
    let (writer, ()) = tokio::join!(
        send_loop(shared, charset, writer, requests, slots_tx),
        receive_loop(shared, reader, slots_rx),
    );
    // Dropping the write half sends FIN; only do it once reading is done.
    drop(writer);
}

/// Encode queued requests in order and write them out.
///
/// Returns the write half so the caller decides when the socket closes.
async fn send_loop(
    shared: &Shared,
    charset: Charset,
    mut writer: OwnedWriteHalf,
    requests: &mut mpsc::UnboundedReceiver<Request>,
    slots: mpsc::Sender<Option<ResultSlot>>,
) -> OwnedWriteHalf {
    let mut scratch = write_buffers().get();
    loop {
        let request = tokio::select! {
            biased;
            _ = shared.closed() => break,
            next = requests.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        scratch.clear();
        if let Err(e) = encode_command(&request.args, charset, &mut scratch) {
            debug!(conn = shared.id, cmd = %request.name(), error = %e, "request not encodable");
            shared.finish_one();
            request.fail(e);
            continue;
        }

        // Hand the slot over before the frame hits the wire.
        let permit = tokio::select! {
            biased;
            _ = shared.closed() => {
                request.fail(shared.cause());
                break;
            }
            permit = slots.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    request.fail(shared.cause());
                    break;
                }
            },
        };
        trace!(conn = shared.id, cmd = %request.name(), bytes = scratch.len(), "write");
        permit.send(request.slot);

        let written = tokio::select! {
            biased;
            _ = shared.closed() => break,
            res = writer.write_all(&scratch) => res,
        };
        if let Err(e) = written {
            warn!(conn = shared.id, error = %e, "write failed, closing connection");
            shared.shutdown(e.into());
            break;
        }
    }
    writer
}

/// Read one reply per slot, in slot order.
async fn receive_loop(
    shared: &Shared,
    mut reader: ResponseReader<OwnedReadHalf>,
    mut slots: mpsc::Receiver<Option<ResultSlot>>,
) {
    loop {
        let slot = tokio::select! {
            biased;
            _ = shared.closed() => break,
            next = slots.recv() => match next {
                Some(slot) => slot,
                None => break,
            },
        };

        shared.in_use.store(true, Ordering::Release);
        let result = tokio::select! {
            biased;
            _ = shared.closed() => {
                if let Some(slot) = slot {
                    slot.fail(shared.cause());
                }
                break;
            }
            res = reader.read_message() => res,
        };
        shared.in_use.store(false, Ordering::Release);

        match result {
            Err(e) if e.is_fatal() => {
                warn!(conn = shared.id, error = %e, "read failed, closing connection");
                shared.shutdown(e.clone());
                if let Some(slot) = slot {
                    slot.fail(e);
                }
                break;
            }
            result => {
                trace!(conn = shared.id, ok = result.is_ok(), "read");
                shared.finish_one();
                match slot {
                    Some(slot) if slot.is_abandoned() => {
                        trace!(conn = shared.id, "caller gone, reply discarded");
                    }
                    Some(slot) => slot.resolve(result),
                    None => {}
                }
            }
        }
    }

    slots.close();
    let cause = shared.cause();
    while let Ok(slot) = slots.try_recv() {
        if let Some(slot) = slot {
            slot.fail(cause.clone());
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
