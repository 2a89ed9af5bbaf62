//! # Error Taxonomy
//!
//! Every failure the client can report falls into one of four classes:
//!
//! - **Validation**: bad caller input, raised before any I/O.
//! - **Response**: the server answered with something the issued command
//!   cannot produce. The connection is out of sync and is never reused.
//! - **Timeout**: connect or exchange exceeded its deadline.
//! - **Connection**: transport failure (refused, reset, closed).
//!
//! Cache misses, CAS mismatches and "already exists" are not errors; they
//! are ordinary return values of the command methods.

use std::io;

/// Result alias used across the workspace.
pub type McResult<T> = Result<T, McError>;

/// Errors surfaced by the memcached client.
#[derive(Debug, thiserror::Error)]
pub enum McError {
    /// Caller input rejected before touching the network.
    #[error("validation error: {0}")]
    Validation(String),

    /// Reply did not match the framing expected for the issued command.
    #[error("memcached [{command}] response is not expected: {}", String::from_utf8_lossy(.response))]
    Response {
        /// Request line (without payload) that produced the reply.
        command: String,
        /// Raw offending bytes as read from the socket.
        response: Vec<u8>,
    },

    /// Connect or exchange deadline elapsed.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// Transport-level failure.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
}

impl McError {
    /// Builds a validation error from any displayable message.
    pub fn validation(message: impl Into<String>) -> Self {
        McError::Validation(message.into())
    }

    /// Builds a response error for `command` carrying the raw reply bytes.
    pub fn response(command: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
        McError::Response {
            command: command.into(),
            response: response.into(),
        }
    }

    /// Returns true for failures that leave the connection unusable.
    ///
    /// Validation errors happen before a connection is involved, so they are
    /// the only class that does not poison one.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, McError::Validation(_))
    }
}
