//! # Async Memcached Client
//!
//! Purpose: Talk to a memcached server over the text protocol from many
//! concurrent tasks, sharing a bounded pool of TCP connections.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections; waiters are served in
//!    arrival order once the pool is at capacity.
//! 2. **Cancellation Safety**: A dropped future never leaks a pool slot or
//!    returns a half-read connection to the idle set.
//! 3. **Minimal Allocation**: Reuse line and write buffers per connection.
//! 4. **Protocol Clarity**: Encode and decode the text protocol explicitly and
//!    reject anything the issued command cannot produce.
//!
//! ```no_run
//! use mcache_client::{McClient, StoreOptions};
//!
//! # async fn demo() -> mcache_client::McResult<()> {
//! let client = McClient::connect("127.0.0.1", 11211)?;
//! client.set(b"greeting", b"hello", StoreOptions::default()).await?;
//! let item = client.get(b"greeting").await?;
//! assert_eq!(item.map(|item| item.data), Some("hello".into()));
//! # Ok(())
//! # }
//! ```

mod client;
mod codec;
mod config;
mod pool;

pub use client::McClient;
pub use codec::{
    read_reply, ArithCommand, Reply, Request, RetrievalCommand, Status, StoreCommand, MAX_LINE_LEN,
    MAX_PAYLOAD_LEN,
};
pub use config::ClientConfig;
pub use mcache_common::{Item, Key, McError, McResult, StoreOptions, MAX_KEY_LEN};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
