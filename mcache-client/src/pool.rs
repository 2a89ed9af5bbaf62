//! # Connection Pool
//!
//! Purpose: Reuse TCP connections to one memcached endpoint across many
//! cooperatively scheduled tasks, bounded by `max_size`.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections,
//!    most recently released first so warm sockets are reused.
//! 2. **Minimal Locking**: The mutex guards counters and queues only; it is
//!    never held across an `.await`.
//! 3. **FIFO Hand-off**: A release goes straight to the oldest waiter, so a
//!    fresh acquirer can never steal a connection from a queued one.
//! 4. **Guards Restore Invariants**: Every reservation is owned by a guard
//!    whose `Drop` returns it, so cancellation at any await point is safe.
//!
//! ## Bookkeeping
//!
//! `total` counts idle connections, checked-out connections, and slots
//! reserved for a connect in progress. It never exceeds `max_size`. What a
//! waiter receives is a `Grant`: either a live connection or an already
//! reserved slot, which it fills by connecting.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, trace, warn};

use mcache_common::{McError, McResult};

use crate::codec::{read_reply, Reply, Request};

/// Pool configuration for one server endpoint.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Connections opened on first use. Capped by `max_size`.
    pub min_size: usize,
    /// Maximum total connections (idle + in-use).
    pub max_size: usize,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional deadline for one request/reply exchange.
    pub op_timeout: Option<Duration>,
}

enum Grant {
    Conn(Connection),
    Slot,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    prewarm_pending: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

enum Step {
    Idle(Connection),
    Reserved(SlotGuard),
    Wait(WaitGuard),
}

impl ConnectionPool {
    /// Creates an empty pool. No connection is opened until first use.
    ///
    /// `min_size > max_size` is tolerated; pre-warming stops at `max_size`.
    pub fn new(config: PoolConfig) -> McResult<Self> {
        if config.max_size == 0 {
            return Err(McError::validation("pool max_size must be at least 1"));
        }
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_size),
            total: 0,
            waiters: VecDeque::new(),
            next_waiter_id: 0,
            prewarm_pending: config.min_size > 0,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        })
    }

    /// Returns the configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a live connection, waiting in FIFO order when at capacity.
    ///
    /// Connect failures are returned to the caller and are not retried.
    pub async fn acquire(&self) -> McResult<PooledConnection> {
        if self.take_prewarm() {
            if let Err(err) = self.prewarm().await {
                warn!(error = %err, "failed to pre-warm connection pool");
                self.inner.state.lock().prewarm_pending = true;
                return Err(err);
            }
        }

        loop {
            match self.next_step() {
                Step::Idle(conn) => {
                    if conn.is_alive() {
                        return Ok(PooledConnection::new(self.clone(), conn));
                    }
                    debug!("evicting dead idle connection");
                    drop(conn);
                    self.release_slot();
                }
                Step::Reserved(slot) => return self.open(slot).await,
                Step::Wait(waiter) => match waiter.wait().await {
                    Some(Grant::Conn(conn)) => {
                        return Ok(PooledConnection::new(self.clone(), conn));
                    }
                    Some(Grant::Slot) => {
                        let slot = SlotGuard::new(self.clone());
                        return self.open(slot).await;
                    }
                    None => continue,
                },
            }
        }
    }

    /// Returns a connection to the pool. Same as dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Closes every idle connection.
    ///
    /// Checked-out connections are untouched and come back (or are discarded)
    /// on their own release.
    pub fn clear(&self) {
        let drained: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            state.prewarm_pending = self.inner.config.min_size > 0;
            drained
        };
        debug!(closed = drained.len(), "cleared idle connections");
    }

    /// Live connection count: idle, checked out, and connecting.
    pub fn size(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Number of acquirers queued for a connection.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    fn take_prewarm(&self) -> bool {
        let mut state = self.inner.state.lock();
        std::mem::replace(&mut state.prewarm_pending, false)
    }

    async fn prewarm(&self) -> McResult<()> {
        let target = self.inner.config.min_size.min(self.inner.config.max_size);
        loop {
            let slot = {
                let mut state = self.inner.state.lock();
                if state.total >= target {
                    return Ok(());
                }
                state.total += 1;
                SlotGuard::new(self.clone())
            };
            let conn = Connection::connect(&self.inner.config).await?;
            slot.disarm();
            self.return_connection(conn);
        }
    }

    fn next_step(&self) -> Step {
        let mut state = self.inner.state.lock();
        if let Some(conn) = state.idle.pop_front() {
            return Step::Idle(conn);
        }
        if state.total < self.inner.config.max_size {
            state.total += 1;
            return Step::Reserved(SlotGuard::new(self.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push_back(Waiter { id, tx });
        trace!(waiters = state.waiters.len(), "pool at capacity, queueing acquirer");
        Step::Wait(WaitGuard {
            pool: self.clone(),
            id,
            rx,
            pending: true,
        })
    }

    async fn open(&self, slot: SlotGuard) -> McResult<PooledConnection> {
        let conn = Connection::connect(&self.inner.config).await?;
        slot.disarm();
        Ok(PooledConnection::new(self.clone(), conn))
    }

    /// Gives a reserved slot to the oldest waiter, or frees it.
    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Grant::Slot).is_ok() {
                trace!(waiter = waiter.id, "handed free slot to waiter");
                return;
            }
        }
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, conn: Connection) {
        if !conn.is_alive() {
            debug!("discarding dead connection on release");
            drop(conn);
            self.release_slot();
            return;
        }

        let mut state = self.inner.state.lock();
        let mut grant = Grant::Conn(conn);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => {
                    trace!(waiter = waiter.id, "handed connection to waiter");
                    return;
                }
                Err(returned) => grant = returned,
            }
        }
        if let Grant::Conn(conn) = grant {
            state.idle.push_front(conn);
        }
    }

    fn restore(&self, grant: Grant) {
        match grant {
            Grant::Conn(conn) => self.return_connection(conn),
            Grant::Slot => self.release_slot(),
        }
    }
}

/// Owns one unit of pool capacity while a connect is in flight.
struct SlotGuard {
    pool: ConnectionPool,
    armed: bool,
}

impl SlotGuard {
    fn new(pool: ConnectionPool) -> Self {
        SlotGuard { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

/// A queued acquirer. Dropping it before it is served dequeues it and
/// returns anything already granted.
struct WaitGuard {
    pool: ConnectionPool,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    pending: bool,
}

impl WaitGuard {
    async fn wait(mut self) -> Option<Grant> {
        let grant = (&mut self.rx).await.ok();
        self.pending = false;
        grant
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        let id = self.id;
        self.pool.inner.state.lock().waiters.retain(|waiter| waiter.id != id);
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            trace!(waiter = id, "cancelled waiter returning its grant");
            self.pool.restore(grant);
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
///
/// The connection is marked invalid for the duration of every exchange and
/// only marked valid again once the reply decoded cleanly. Errors, timeouts,
/// and cancellation therefore all lead to the connection being discarded.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Writes `request` and reads its reply, bounded by the op timeout.
    pub async fn exec(&mut self, request: &Request<'_>) -> McResult<Reply> {
        let op_timeout = self.pool.inner.config.op_timeout;
        let Some(conn) = self.conn.as_mut() else {
            return Err(McError::Connection(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already released",
            )));
        };

        self.valid = false;
        let response = match op_timeout {
            Some(limit) => match time::timeout(limit, conn.exec(request)).await {
                Ok(response) => response,
                Err(_) => Err(McError::Timeout("waiting for reply")),
            },
            None => conn.exec(request).await,
        };
        self.valid = match &response {
            Ok(_) => true,
            Err(err) => !err.is_connection_fatal(),
        };
        response
    }

    /// Drops the connection without returning it to the idle set.
    pub fn discard(mut self) {
        self.valid = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.valid {
            self.pool.return_connection(conn);
        } else {
            debug!("discarding connection after failed or interrupted exchange");
            drop(conn);
            self.pool.release_slot();
        }
    }
}

/// Single TCP connection with reusable buffers.
///
/// The buffers are stored on the connection to avoid per-call allocations.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    async fn connect(config: &PoolConfig) -> McResult<Self> {
        let stream = connect_stream(config).await?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;
        debug!(host = %config.host, port = config.port, "opened connection");

        let (read_half, write_half) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        })
    }

    async fn exec(&mut self, request: &Request<'_>) -> McResult<Reply> {
        self.write_buf.clear();
        request.encode(&mut self.write_buf);

        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;

        read_reply(&mut self.reader, &mut self.line_buf, request).await
    }

    /// Non-blocking liveness probe for an idle connection.
    ///
    /// An idle connection must have nothing to read: end-of-stream, a socket
    /// error, or unsolicited bytes all mean it cannot be reused.
    fn is_alive(&self) -> bool {
        if !self.reader.buffer().is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        match self.reader.get_ref().try_read(&mut probe) {
            Ok(_) => false,
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

async fn connect_stream(config: &PoolConfig) -> McResult<TcpStream> {
    let addr = (config.host.as_str(), config.port);
    let stream = match config.connect_timeout {
        Some(limit) => time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| McError::Timeout("connecting"))??,
        None => TcpStream::connect(addr).await?,
    };
    Ok(stream)
}
