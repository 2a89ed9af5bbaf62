// mcache-common - Shared error and value types for the memcached client
//
// This crate holds what both the codec and the command facade agree on:
// the error taxonomy and validated request values.

pub mod error;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use types::*;
