//! In-process servers for integration tests.
//!
//! `spawn_memcached` runs a small text-protocol memcached good enough for
//! the command set the client speaks. `spawn_scripted` answers each request
//! with the next canned action, for malformed or stalled replies.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use mcache_client::{ClientConfig, PoolConfig};

pub const MOCK_VERSION: &str = "1.6.21";

/// Handle to a running mock server.
pub struct MockServer {
    pub port: u16,
    accepts: Arc<AtomicUsize>,
    kill: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Client configuration pointing at this server.
    pub fn config(&self, min_size: usize, max_size: usize) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            min_size,
            max_size,
            connect_timeout: Some(Duration::from_secs(2)),
            op_timeout: None,
        }
    }

    /// Pool configuration pointing at this server.
    pub fn pool_config(&self, min_size: usize, max_size: usize) -> PoolConfig {
        PoolConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            min_size,
            max_size,
            connect_timeout: Some(Duration::from_secs(2)),
            op_timeout: None,
        }
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Closes every open connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.kill.send(());
    }
}

/// A port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").port()
}

// ---------------------------------------------------------------------------
// memcached-like server
// ---------------------------------------------------------------------------

struct Entry {
    data: Vec<u8>,
    flags: u32,
    cas: u64,
    expires: Option<Instant>,
}

#[derive(Default)]
struct Store {
    items: HashMap<Vec<u8>, Entry>,
    next_cas: u64,
}

impl Store {
    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let expired = match self.items.get(key) {
            Some(entry) => entry.expires.map_or(false, |at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            self.items.remove(key);
            return None;
        }
        self.items.get_mut(key)
    }

    fn put(&mut self, key: &[u8], data: Vec<u8>, flags: u32, exptime: u32) {
        self.next_cas += 1;
        let expires = match exptime {
            0 => None,
            secs => Some(Instant::now() + Duration::from_secs(secs as u64)),
        };
        self.items.insert(
            key.to_vec(),
            Entry {
                data,
                flags,
                cas: self.next_cas,
                expires,
            },
        );
    }
}

/// Starts a memcached-like server on an ephemeral port.
pub async fn spawn_memcached() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let (kill, _) = broadcast::channel(4);
    let store = Arc::new(Mutex::new(Store::default()));

    let task = {
        let accepts = accepts.clone();
        let kill = kill.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_memcached(stream, store.clone(), kill.subscribe()));
            }
        })
    };

    MockServer {
        port,
        accepts,
        kill,
        task,
    }
}

async fn serve_memcached(
    stream: TcpStream,
    store: Arc<Mutex<Store>>,
    mut kill: broadcast::Receiver<()>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = kill.recv() => return,
        };
        if !matches!(read, Ok(n) if n > 0) {
            return;
        }
        let reply = match handle_command(&mut reader, &line, &store).await {
            Some(reply) => reply,
            None => return,
        };
        if write_half.write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn handle_command(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &[u8],
    store: &Mutex<Store>,
) -> Option<Vec<u8>> {
    let text = String::from_utf8_lossy(line.strip_suffix(b"\r\n")?).into_owned();
    let parts: Vec<&str> = text.split(' ').collect();
    let reply = match parts.as_slice() {
        [cmd @ ("set" | "add" | "replace" | "append" | "prepend" | "cas"), key, flags, exptime, len, rest @ ..] => {
            let len: usize = len.parse().ok()?;
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data).await.ok()?;
            if !data.ends_with(b"\r\n") {
                return Some(b"CLIENT_ERROR bad data chunk\r\n".to_vec());
            }
            data.truncate(len);
            let flags: u32 = flags.parse().ok()?;
            let exptime: u32 = exptime.parse().ok()?;
            let token: Option<u64> = rest.first().and_then(|raw| raw.parse().ok());
            let mut store = store.lock();
            store_command(&mut store, cmd, key.as_bytes(), data, flags, exptime, token)
        }
        [cmd @ ("get" | "gets"), keys @ ..] if !keys.is_empty() => {
            let mut store = store.lock();
            let mut out = Vec::new();
            for key in keys {
                if let Some(entry) = store.live(key.as_bytes()) {
                    out.extend_from_slice(
                        format!("VALUE {} {} {}", key, entry.flags, entry.data.len()).as_bytes(),
                    );
                    if *cmd == "gets" {
                        out.extend_from_slice(format!(" {}", entry.cas).as_bytes());
                    }
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(&entry.data);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        ["delete", key] => {
            let mut store = store.lock();
            if store.live(key.as_bytes()).is_some() {
                store.items.remove(key.as_bytes());
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        [cmd @ ("incr" | "decr"), key, delta] => {
            let delta: u64 = delta.parse().ok()?;
            let mut store = store.lock();
            let next_cas = store.next_cas + 1;
            match store.live(key.as_bytes()) {
                None => b"NOT_FOUND\r\n".to_vec(),
                Some(entry) => match String::from_utf8_lossy(&entry.data).trim().parse::<u64>() {
                    Ok(current) => {
                        let value = if *cmd == "incr" {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        entry.data = value.to_string().into_bytes();
                        entry.cas = next_cas;
                        store.next_cas = next_cas;
                        format!("{}\r\n", value).into_bytes()
                    }
                    Err(_) => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
                        .to_vec(),
                },
            }
        }
        ["touch", key, exptime] => {
            let exptime: u64 = exptime.parse().ok()?;
            let mut store = store.lock();
            match store.live(key.as_bytes()) {
                Some(entry) => {
                    entry.expires = match exptime {
                        0 => None,
                        secs => Some(Instant::now() + Duration::from_secs(secs)),
                    };
                    b"TOUCHED\r\n".to_vec()
                }
                None => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        ["stats"] => {
            let items = store.lock().items.len();
            format!(
                "STAT pid {}\r\nSTAT version {}\r\nSTAT curr_items {}\r\nSTAT threads 4\r\nEND\r\n",
                std::process::id(),
                MOCK_VERSION,
                items
            )
            .into_bytes()
        }
        ["stats", "slabs"] => b"STAT active_slabs 0\r\nSTAT total_malloced 0\r\nEND\r\n".to_vec(),
        ["stats", ..] => b"END\r\n".to_vec(),
        ["version"] => format!("VERSION {}\r\n", MOCK_VERSION).into_bytes(),
        ["flush_all"] => {
            store.lock().items.clear();
            b"OK\r\n".to_vec()
        }
        _ => b"ERROR\r\n".to_vec(),
    };
    Some(reply)
}

fn store_command(
    store: &mut Store,
    cmd: &str,
    key: &[u8],
    data: Vec<u8>,
    flags: u32,
    exptime: u32,
    token: Option<u64>,
) -> Vec<u8> {
    let exists = store.live(key).is_some();
    let stored = match cmd {
        "set" => {
            store.put(key, data, flags, exptime);
            true
        }
        "add" if !exists => {
            store.put(key, data, flags, exptime);
            true
        }
        "replace" if exists => {
            store.put(key, data, flags, exptime);
            true
        }
        "append" | "prepend" if exists => {
            store.next_cas += 1;
            let next_cas = store.next_cas;
            if let Some(entry) = store.live(key) {
                if cmd == "append" {
                    entry.data.extend_from_slice(&data);
                } else {
                    let mut joined = data;
                    joined.extend_from_slice(&entry.data);
                    entry.data = joined;
                }
                entry.cas = next_cas;
            }
            true
        }
        "cas" => {
            let current = store.live(key).map(|entry| entry.cas);
            return match current {
                None => b"NOT_FOUND\r\n".to_vec(),
                Some(cas) if Some(cas) != token => b"EXISTS\r\n".to_vec(),
                Some(_) => {
                    store.put(key, data, flags, exptime);
                    b"STORED\r\n".to_vec()
                }
            };
        }
        _ => false,
    };
    if stored {
        b"STORED\r\n".to_vec()
    } else {
        b"NOT_STORED\r\n".to_vec()
    }
}

// ---------------------------------------------------------------------------
// scripted server
// ---------------------------------------------------------------------------

/// What the scripted server does with the next request.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write these bytes verbatim.
    Reply(&'static [u8]),
    /// Read the request and never answer.
    Hang,
    /// Close the connection without answering.
    Close,
}

/// Starts a server that answers requests with `actions`, in order, across
/// all connections. Once the script runs out, connections are closed.
pub async fn spawn_scripted(actions: Vec<Action>) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let (kill, _) = broadcast::channel(4);
    let script = Arc::new(Mutex::new(VecDeque::from(actions)));

    let task = {
        let accepts = accepts.clone();
        let kill = kill.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_scripted(stream, script.clone(), kill.subscribe()));
            }
        })
    };

    MockServer {
        port,
        accepts,
        kill,
        task,
    }
}

async fn serve_scripted(
    stream: TcpStream,
    script: Arc<Mutex<VecDeque<Action>>>,
    mut kill: broadcast::Receiver<()>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = kill.recv() => return,
        };
        if !matches!(read, Ok(n) if n > 0) {
            return;
        }
        if !skip_payload(&mut reader, &line).await {
            return;
        }

        let action = script.lock().pop_front();
        match action {
            Some(Action::Reply(bytes)) => {
                if write_half.write_all(bytes).await.is_err() {
                    return;
                }
            }
            Some(Action::Hang) => {
                let _ = kill.recv().await;
                return;
            }
            Some(Action::Close) | None => return,
        }
    }
}

async fn skip_payload(reader: &mut BufReader<OwnedReadHalf>, line: &[u8]) -> bool {
    let text = String::from_utf8_lossy(line);
    let parts: Vec<&str> = text.trim_end().split(' ').collect();
    let is_store = matches!(
        parts.first().copied(),
        Some("set" | "add" | "replace" | "append" | "prepend" | "cas")
    );
    if !is_store {
        return true;
    }
    let len: usize = match parts.get(4).and_then(|raw| raw.parse().ok()) {
        Some(len) => len,
        None => return false,
    };
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).await.is_ok()
}
