//! Pooled, pipelined Redis client.
//!
//! A [`Client`] is a cheap front end over one dispatcher task. Every call
//! becomes a [`Request`] with its own result slot and goes through the
//! dispatcher's queue, so connection selection happens in exactly one
//! place and needs no locking:
//!
//! 1. a pinned connection, if pipelining is on;
//! 2. else the first live connection that is not in use;
//! 3. else a new connection, while fewer than `max_connections` exist;
//! 4. else the live connections, round-robin.
//!
//! Connections report their own closure back to the dispatcher, which
//! drops them from the live set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::slot::{Request, SlotReceiver};
use crate::connection::tcp::{ClosingConnection, Connection};
use crate::error::{Error, Result};
use crate::resp::types::{Arg, RespValue};

/// Lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Open,
    /// `shutdown()` in progress: no new work, queued work finishes.
    Draining,
    Closed,
}

enum Dispatch {
    Execute(Request),
    /// Sent as a unit to a single connection.
    Batch(Vec<Request>),
    Pin(bool),
}

impl Dispatch {
    fn fail(self, cause: &Error) {
        match self {
            Self::Execute(request) => request.fail(cause.clone()),
            Self::Batch(requests) => {
                for request in requests {
                    request.fail(cause.clone());
                }
            }
            Self::Pin(_) => {}
        }
    }
}

fn client_closed() -> Error {
    Error::Closed("client closed".into())
}

/// An async Redis client backed by a small set of pipelined connections.
///
/// Share it between tasks behind an `Arc`. Dropping the client closes it.
///
/// ```ignore
/// let client = Client::from_url("redis://127.0.0.1:6379")?;
/// client.execute(["SET", "greeting", "hello"]).await?;
/// let value = client.execute(["GET", "greeting"]).await?;
/// ```
pub struct Client {
    config: Arc<ClientConfig>,
    dispatch: mpsc::Sender<Dispatch>,
    state: watch::Sender<ClientState>,
    finished: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
}

impl Client {
    /// Start a client. Must be called from within a tokio runtime.
    ///
    /// No connection is opened until the first request.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            Error::Config("Client::new must be called within a tokio runtime".into())
        })?;

        let config = Arc::new(config);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_capacity);
        let (state_tx, state_rx) = watch::channel(ClientState::Open);
        let (finished_tx, finished_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicUsize::new(0));

        let dispatcher = Dispatcher {
            config: config.clone(),
            connections: Vec::new(),
            pinned: None,
            pipelining: false,
            next_id: 1,
            cursor: 0,
            closed_tx,
            closed_rx,
            live: live.clone(),
        };
        runtime.spawn(dispatcher.run(dispatch_rx, state_rx, finished_tx));
        debug!(addr = %config.primary_addr(), "client started");

        Ok(Self {
            config,
            dispatch: dispatch_tx,
            state: state_tx,
            finished: finished_rx,
            live,
        })
    }

    /// Start a client from a `redis://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(ClientConfig::from_url(url)?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Number of live physical connections.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Execute one command and wait for its reply.
    ///
    /// Server error replies come back as [`Error::Redis`] tagged with the
    /// command's arguments.
    pub async fn execute<I, A>(&self, args: I) -> Result<RespValue>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let args = collect_args(args)?;
        let (request, rx) = Request::new(args.clone());
        self.submit(Dispatch::Execute(request)).await?;
        await_slot(rx, &args).await
    }

    /// [`execute`](Self::execute) with a deadline.
    ///
    /// On expiry the reply is still read off the connection and discarded,
    /// so later requests on that connection stay in order.
    pub async fn execute_timeout<I, A>(&self, args: I, timeout: Duration) -> Result<RespValue>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let args = collect_args(args)?;
        let name = args[0].to_string();
        let (request, rx) = Request::new(args.clone());
        let work = async {
            self.submit(Dispatch::Execute(request)).await?;
            await_slot(rx, &args).await
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| Error::Timeout(format!("{name} timed out after {timeout:?}")))?
    }

    /// Send a batch of commands to one connection back to back and collect
    /// every reply in order.
    ///
    /// The outer `Result` fails only if the batch could not be submitted;
    /// each command has its own result.
    pub async fn pipeline<C, I, A>(&self, commands: C) -> Result<Vec<Result<RespValue>>>
    where
        C: IntoIterator<Item = I>,
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let mut requests = Vec::new();
        let mut pending = Vec::new();
        for command in commands {
            let args = collect_args(command)?;
            let (request, rx) = Request::new(args.clone());
            requests.push(request);
            pending.push((rx, args));
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        self.submit(Dispatch::Batch(requests)).await?;
        let mut results = Vec::with_capacity(pending.len());
        for (rx, args) in pending {
            results.push(await_slot(rx, &args).await);
        }
        Ok(results)
    }

    /// Pin requests to a single connection.
    ///
    /// While on, the next connection chosen is kept for every later
    /// request until pipelining is turned off or that connection closes.
    pub async fn set_pipelining(&self, enabled: bool) -> Result<()> {
        self.submit(Dispatch::Pin(enabled)).await
    }

    /// Close immediately: queued and in-flight requests fail with
    /// [`Error::Closed`]. Idempotent; use [`closed`](Self::closed) to wait
    /// for the connections to be torn down.
    pub fn close(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ClientState::Closed {
                return false;
            }
            *state = ClientState::Closed;
            true
        });
        if changed {
            debug!(addr = %self.config.primary_addr(), "client closing");
        }
    }

    /// Close gracefully: stop accepting work, let every connection finish
    /// what it has, send `QUIT`, and wait until everything is down.
    ///
    /// A [`close`](Self::close) during the drain cuts it short.
    pub async fn shutdown(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state != ClientState::Open {
                return false;
            }
            *state = ClientState::Draining;
            true
        });
        if changed {
            debug!(addr = %self.config.primary_addr(), "client draining");
        }
        self.closed().await;
    }

    /// Wait until the client has fully shut down.
    pub async fn closed(&self) {
        let mut finished = self.finished.clone();
        loop {
            if *finished.borrow_and_update() {
                return;
            }
            if finished.changed().await.is_err() {
                return;
            }
        }
    }

    async fn submit(&self, dispatch: Dispatch) -> Result<()> {
        if self.state() != ClientState::Open {
            return Err(client_closed());
        }
        self.dispatch.send(dispatch).await.map_err(|_| client_closed())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.config.primary_addr())
            .field("state", &self.state())
            .field("connections", &self.live_connections())
            .finish()
    }
}

fn collect_args<I, A>(args: I) -> Result<Arc<[Arg]>>
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    let args: Arc<[Arg]> = args.into_iter().map(Into::into).collect();
    if args.is_empty() {
        return Err(Error::Encoding("empty command".into()));
    }
    Ok(args)
}

async fn await_slot(rx: SlotReceiver, args: &[Arg]) -> Result<RespValue> {
    match rx.await {
        Ok(result) => result.map_err(|e| e.with_command(args)),
        Err(_) => Err(client_closed()),
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────

/// Owns the live connections. Runs as a single task.
struct Dispatcher {
    config: Arc<ClientConfig>,
    /// Insertion order, oldest first.
    connections: Vec<Connection>,
    pinned: Option<u64>,
    pipelining: bool,
    next_id: u64,
    cursor: usize,
    closed_tx: mpsc::UnboundedSender<u64>,
    closed_rx: mpsc::UnboundedReceiver<u64>,
    live: Arc<AtomicUsize>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Dispatch>,
        mut state: watch::Receiver<ClientState>,
        finished: watch::Sender<bool>,
    ) {
        let mode = loop {
            let current = *state.borrow_and_update();
            if current != ClientState::Open {
                break current;
            }
            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() {
                        break ClientState::Closed;
                    }
                }
                Some(id) = self.closed_rx.recv() => self.remove(id),
                next = requests.recv() => match next {
                    Some(dispatch) => self.handle(dispatch),
                    None => break ClientState::Closed,
                },
            }
        };

        match mode {
            ClientState::Draining => self.drain(&mut requests, &mut state).await,
            _ => self.close_all(&mut requests).await,
        }

        self.live.store(0, Ordering::Relaxed);
        finished.send_replace(true);
        debug!(addr = %self.config.primary_addr(), "client closed");
    }

    fn handle(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Execute(request) => {
                let idx = self.select();
                if let Err(request) = self.connections[idx].send(request) {
                    let cause = self.discard(idx);
                    request.fail(cause);
                }
            }
            Dispatch::Batch(requests) => {
                let idx = self.select();
                let mut requests = requests.into_iter();
                while let Some(request) = requests.next() {
                    if let Err(request) = self.connections[idx].send(request) {
                        let cause = self.discard(idx);
                        request.fail(cause.clone());
                        for rest in requests.by_ref() {
                            rest.fail(cause.clone());
                        }
                        break;
                    }
                }
            }
            Dispatch::Pin(enabled) => {
                self.pipelining = enabled;
                if !enabled {
                    self.pinned = None;
                }
            }
        }
    }

    /// Index of the connection the next request goes to. Opens one if
    /// needed, so there is always an answer.
    fn select(&mut self) -> usize {
        self.prune();

        if let Some(id) = self.pinned {
            if let Some(idx) = self.connections.iter().position(|c| c.id() == id) {
                return idx;
            }
            self.pinned = None;
        }

        let idx = match self.connections.iter().position(|c| !c.in_use()) {
            Some(idx) => idx,
            None if self.connections.len() < self.config.max_connections => self.open(),
            None => {
                let idx = self.cursor % self.connections.len();
                self.cursor = self.cursor.wrapping_add(1);
                idx
            }
        };

        if self.pipelining {
            self.pinned = Some(self.connections[idx].id());
        }
        idx
    }

    fn open(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        let conn = Connection::open(id, self.config.clone(), Some(self.closed_tx.clone()));
        self.connections.push(conn);
        self.live.store(self.connections.len(), Ordering::Relaxed);
        debug!(conn = id, live = self.connections.len(), "connection opened");
        self.connections.len() - 1
    }

    /// Drop connections that closed on their own.
    fn prune(&mut self) {
        let before = self.connections.len();
        self.connections.retain(|c| !c.is_closed());
        if self.connections.len() != before {
            self.live.store(self.connections.len(), Ordering::Relaxed);
            debug!(removed = before - self.connections.len(), "pruned closed connections");
        }
    }

    fn remove(&mut self, id: u64) {
        if let Some(idx) = self.connections.iter().position(|c| c.id() == id) {
            self.connections.remove(idx);
            self.live.store(self.connections.len(), Ordering::Relaxed);
            debug!(conn = id, live = self.connections.len(), "connection removed");
        }
        if self.pinned == Some(id) {
            self.pinned = None;
        }
    }

    /// Remove a connection that refused a request; returns why.
    fn discard(&mut self, idx: usize) -> Error {
        let conn = self.connections.remove(idx);
        self.live.store(self.connections.len(), Ordering::Relaxed);
        if self.pinned == Some(conn.id()) {
            self.pinned = None;
        }
        debug!(conn = conn.id(), "connection refused request, removed");
        conn.close_cause()
            .unwrap_or_else(|| Error::Closed("connection closed".into()))
    }

    /// Immediate close: fail everything still queued, close every
    /// connection and wait for their tasks.
    async fn close_all(&mut self, requests: &mut mpsc::Receiver<Dispatch>) {
        let cause = client_closed();
        requests.close();
        while let Ok(dispatch) = requests.try_recv() {
            dispatch.fail(&cause);
        }
        for conn in &self.connections {
            conn.close_with(cause.clone());
        }
        for conn in self.connections.drain(..) {
            conn.join().await;
        }
    }

    /// Graceful close: dispatch what is queued, then let each connection
    /// finish its work behind a `QUIT`.
    async fn drain(
        &mut self,
        requests: &mut mpsc::Receiver<Dispatch>,
        state: &mut watch::Receiver<ClientState>,
    ) {
        requests.close();
        while let Ok(dispatch) = requests.try_recv() {
            self.handle(dispatch);
        }
        self.prune();

        let mut closing: Vec<ClosingConnection> = self
            .connections
            .drain(..)
            .map(|conn| {
                // fire-and-forget: the reply is read and dropped
                let _ = conn.send(Request::fire_and_forget(vec![Arg::from("QUIT")]));
                conn.finish()
            })
            .collect();
        debug!(connections = closing.len(), "draining connections");

        tokio::select! {
            _ = async {
                for conn in closing.iter_mut() {
                    conn.wait().await;
                }
            } => {}
            _ = wait_for_close(state) => {
                for conn in &closing {
                    conn.abort(client_closed());
                }
                for conn in closing.iter_mut() {
                    conn.wait().await;
                }
            }
        }
    }
}

async fn wait_for_close(state: &mut watch::Receiver<ClientState>) {
    loop {
        if *state.borrow_and_update() == ClientState::Closed {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
