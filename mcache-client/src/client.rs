//! # Async Command Client
//!
//! Purpose: Expose typed memcached commands over a shared connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `McClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Validate Before I/O**: Bad keys are rejected before a connection is
//!    acquired, so they never cost a round trip or a pool slot.
//! 4. **Misses Are Values**: Cache misses, `NOT_STORED` and CAS conflicts come
//!    back as `None`/`false`; only violations are errors.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use mcache_common::{validate_stats_args, Item, Key, McError, McResult, StoreOptions};

use crate::codec::{ArithCommand, Reply, Request, RetrievalCommand, Status, StoreCommand};
use crate::config::ClientConfig;
use crate::pool::ConnectionPool;

/// Memcached client with connection pooling.
///
/// Each call validates its input, acquires a connection, executes one
/// request/reply exchange, and hands the connection back. The client is
/// cheap to share: clone the pool handle or wrap the client in an `Arc`.
pub struct McClient {
    pool: ConnectionPool,
}

impl McClient {
    /// Creates a client for `host:port` with default pool sizing.
    pub fn connect(host: impl Into<String>, port: u16) -> McResult<Self> {
        let mut config = ClientConfig::default();
        config.host = host.into();
        config.port = port;
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    ///
    /// No connection is opened until the first command.
    pub fn with_config(config: ClientConfig) -> McResult<Self> {
        let pool = ConnectionPool::new(config.pool_config())?;
        Ok(McClient { pool })
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Closes idle connections. In-flight commands finish normally.
    pub fn close(&self) {
        self.pool.clear();
    }

    /// Fetches one item. Returns `Ok(None)` on a miss.
    pub async fn get(&self, key: &[u8]) -> McResult<Option<Item>> {
        self.retrieve_one(RetrievalCommand::Get, key).await
    }

    /// Fetches one value, falling back to `default` on a miss.
    pub async fn get_or(&self, key: &[u8], default: impl Into<Bytes>) -> McResult<Bytes> {
        Ok(match self.get(key).await? {
            Some(item) => item.data,
            None => default.into(),
        })
    }

    /// Fetches one item together with its CAS token.
    pub async fn gets(&self, key: &[u8]) -> McResult<Option<Item>> {
        self.retrieve_one(RetrievalCommand::Gets, key).await
    }

    /// Fetches several items in one round trip.
    ///
    /// Missing keys are absent from the map. Duplicate keys are sent once.
    /// An empty key list returns immediately without touching the network.
    pub async fn get_many(&self, keys: &[&[u8]]) -> McResult<HashMap<Vec<u8>, Item>> {
        self.retrieve_many(RetrievalCommand::Get, keys).await
    }

    /// Like `get_many`, with CAS tokens on every item.
    pub async fn gets_many(&self, keys: &[&[u8]]) -> McResult<HashMap<Vec<u8>, Item>> {
        self.retrieve_many(RetrievalCommand::Gets, keys).await
    }

    /// Fetches several values, one slot per requested key, in input order.
    pub async fn multi_get(&self, keys: &[&[u8]]) -> McResult<Vec<Option<Bytes>>> {
        let items = self.get_many(keys).await?;
        Ok(keys
            .iter()
            .map(|key| items.get(*key).map(|item| item.data.clone()))
            .collect())
    }

    /// Stores a value unconditionally.
    pub async fn set(&self, key: &[u8], value: &[u8], options: StoreOptions) -> McResult<bool> {
        self.store(StoreCommand::Set, key, value, options).await
    }

    /// Stores a value only if the key does not exist.
    pub async fn add(&self, key: &[u8], value: &[u8], options: StoreOptions) -> McResult<bool> {
        self.store(StoreCommand::Add, key, value, options).await
    }

    /// Stores a value only if the key already exists.
    pub async fn replace(&self, key: &[u8], value: &[u8], options: StoreOptions) -> McResult<bool> {
        self.store(StoreCommand::Replace, key, value, options).await
    }

    /// Appends to an existing value. The server ignores flags and exptime.
    pub async fn append(&self, key: &[u8], value: &[u8], options: StoreOptions) -> McResult<bool> {
        self.store(StoreCommand::Append, key, value, options).await
    }

    /// Prepends to an existing value. The server ignores flags and exptime.
    pub async fn prepend(&self, key: &[u8], value: &[u8], options: StoreOptions) -> McResult<bool> {
        self.store(StoreCommand::Prepend, key, value, options).await
    }

    /// Stores a value only if its CAS token still matches `cas`.
    ///
    /// Returns false when the item changed (`EXISTS`) or vanished
    /// (`NOT_FOUND`).
    pub async fn cas(
        &self,
        key: &[u8],
        value: &[u8],
        cas: u64,
        options: StoreOptions,
    ) -> McResult<bool> {
        self.store(StoreCommand::Cas(cas), key, value, options).await
    }

    /// Increments a numeric value. Returns `Ok(None)` when the key is missing.
    pub async fn incr(&self, key: &[u8], delta: u64) -> McResult<Option<u64>> {
        self.arith(ArithCommand::Incr, key, delta).await
    }

    /// Decrements a numeric value, saturating at zero on the server.
    pub async fn decr(&self, key: &[u8], delta: u64) -> McResult<Option<u64>> {
        self.arith(ArithCommand::Decr, key, delta).await
    }

    /// `incr` by one.
    pub async fn incr_one(&self, key: &[u8]) -> McResult<Option<u64>> {
        self.incr(key, 1).await
    }

    /// `decr` by one.
    pub async fn decr_one(&self, key: &[u8]) -> McResult<Option<u64>> {
        self.decr(key, 1).await
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn delete(&self, key: &[u8]) -> McResult<bool> {
        let key = Key::new(key)?;
        self.execute(Request::Delete { key }, |reply| match reply {
            Reply::Status(status) => Ok(status == Status::Deleted),
            other => Err(other),
        })
        .await
    }

    /// Updates the expiry of a key. Returns false when the key is missing.
    pub async fn touch(&self, key: &[u8], exptime: u32) -> McResult<bool> {
        let key = Key::new(key)?;
        self.execute(Request::Touch { key, exptime }, |reply| match reply {
            Reply::Status(status) => Ok(status == Status::Touched),
            other => Err(other),
        })
        .await
    }

    /// Returns the general-purpose server statistics.
    pub async fn stats(&self) -> McResult<HashMap<Vec<u8>, Vec<u8>>> {
        self.stats_request(None).await
    }

    /// Returns a statistics group, e.g. `b"slabs"` or `b"items"`.
    pub async fn stats_with_args(&self, args: &[u8]) -> McResult<HashMap<Vec<u8>, Vec<u8>>> {
        validate_stats_args(args)?;
        self.stats_request(Some(args)).await
    }

    /// Returns the server version string.
    pub async fn version(&self) -> McResult<Vec<u8>> {
        self.execute(Request::Version, |reply| match reply {
            Reply::Version(version) => Ok(version),
            other => Err(other),
        })
        .await
    }

    /// Invalidates every item on the server.
    pub async fn flush_all(&self) -> McResult<()> {
        self.execute(Request::FlushAll, |reply| match reply {
            Reply::Status(Status::Ok) => Ok(()),
            other => Err(other),
        })
        .await
    }

    /// Runs one exchange and maps the reply. `map` hands back replies it
    /// cannot use, which become response errors naming `request`.
    async fn execute<T>(
        &self,
        request: Request<'_>,
        map: impl FnOnce(Reply) -> Result<T, Reply>,
    ) -> McResult<T> {
        let mut conn = self.pool.acquire().await?;
        let reply = conn.exec(&request).await?;
        map(reply).map_err(|other| unexpected(&request, other))
    }

    async fn retrieve_one(&self, command: RetrievalCommand, key: &[u8]) -> McResult<Option<Item>> {
        let key = Key::new(key)?;
        let request = Request::Retrieve {
            command,
            keys: vec![key],
        };
        self.execute(request, |reply| match reply {
            Reply::Values(mut items) => Ok(items.remove(key.as_bytes())),
            other => Err(other),
        })
        .await
    }

    async fn retrieve_many(
        &self,
        command: RetrievalCommand,
        keys: &[&[u8]],
    ) -> McResult<HashMap<Vec<u8>, Item>> {
        let keys = unique_keys(keys)?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.execute(Request::Retrieve { command, keys }, |reply| match reply {
            Reply::Values(items) => Ok(items),
            other => Err(other),
        })
        .await
    }

    async fn store(
        &self,
        command: StoreCommand,
        key: &[u8],
        value: &[u8],
        options: StoreOptions,
    ) -> McResult<bool> {
        let key = Key::new(key)?;
        let request = Request::Store {
            command,
            key,
            value,
            options,
        };
        self.execute(request, |reply| match reply {
            Reply::Status(status) => Ok(status == Status::Stored),
            other => Err(other),
        })
        .await
    }

    async fn arith(&self, command: ArithCommand, key: &[u8], delta: u64) -> McResult<Option<u64>> {
        let key = Key::new(key)?;
        self.execute(Request::Arith { command, key, delta }, |reply| match reply {
            Reply::Numeric(value) => Ok(value),
            other => Err(other),
        })
        .await
    }

    async fn stats_request(&self, args: Option<&[u8]>) -> McResult<HashMap<Vec<u8>, Vec<u8>>> {
        self.execute(Request::Stats { args }, |reply| match reply {
            Reply::Stats(stats) => Ok(stats),
            other => Err(other),
        })
        .await
    }
}

/// Validates every key and drops repeats, keeping first-seen order.
fn unique_keys<'a>(keys: &[&'a [u8]]) -> McResult<Vec<Key<'a>>> {
    let mut seen = HashSet::with_capacity(keys.len());
    let mut unique = Vec::with_capacity(keys.len());
    for raw in keys {
        let key = Key::new(raw)?;
        if seen.insert(key) {
            unique.push(key);
        }
    }
    Ok(unique)
}

// The codec picks the decoder from the request, so a family mismatch here
// means the two disagree.
fn unexpected(request: &Request<'_>, reply: Reply) -> McError {
    McError::response(request.command_line(), format!("{:?}", reply).into_bytes())
}
