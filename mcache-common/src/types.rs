//! # Request/Response Value Types
//!
//! Small value objects that live for a single command: validated keys,
//! storage options, and retrieved items.
//!
//! ## Design Principles
//!
//! 1. **Validate Once**: A `Key` can only be built through `Key::new`, so any
//!    code holding one knows the bytes are safe to put on the wire.
//! 2. **Borrow, Don't Copy**: Keys borrow the caller's bytes; nothing is
//!    allocated until the request is encoded.
//! 3. **Binary-Safe Values**: Item payloads are raw bytes (`Bytes`), never text.

use std::fmt;

use bytes::Bytes;

use crate::error::{McError, McResult};

/// Maximum key length accepted by the text protocol.
pub const MAX_KEY_LEN: usize = 250;

/// Validated memcached key.
///
/// Keys are 1 to 250 bytes with no space and no ASCII control byte
/// (`0x00..=0x1f`, `0x7f`). Bytes from `0x80` up, so multi-byte UTF-8, are
/// accepted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key<'a>(&'a [u8]);

impl<'a> Key<'a> {
    /// Validates `data` and wraps it as a key.
    ///
    /// # Errors
    /// Returns `McError::Validation` for empty or oversized keys, and for keys
    /// carrying a space or control byte.
    ///
    /// # Examples
    /// ```rust
    /// use mcache_common::{Key, MAX_KEY_LEN};
    ///
    /// let key = Key::new(b"user:42").expect("valid key");
    /// assert_eq!(key.as_bytes(), b"user:42");
    ///
    /// assert!(Key::new(b"has space").is_err());
    /// assert!(Key::new(&vec![b'k'; MAX_KEY_LEN + 1]).is_err());
    /// ```
    pub fn new(data: &'a [u8]) -> McResult<Self> {
        validate_key(data)?;
        Ok(Key(data))
    }

    /// Returns the key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    /// Returns the key length.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(self.0))
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.0))
    }
}

/// Checks the key rules without wrapping.
pub fn validate_key(key: &[u8]) -> McResult<()> {
    if key.is_empty() {
        return Err(McError::validation("key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(McError::validation(format!(
            "key length {} exceeds {} bytes",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.iter().any(|&b| b == b' ' || is_control(b)) {
        return Err(McError::validation(format!(
            "key {:?} contains space or control character",
            String::from_utf8_lossy(key)
        )));
    }
    Ok(())
}

/// Checks the free-form argument of `stats <args>`.
///
/// Same byte rules as keys, except that spaces separate sub-arguments.
pub fn validate_stats_args(args: &[u8]) -> McResult<()> {
    if args.is_empty() {
        return Err(McError::validation("stats arguments must not be empty"));
    }
    if args.len() > MAX_KEY_LEN {
        return Err(McError::validation(format!(
            "stats arguments length {} exceeds {} bytes",
            args.len(),
            MAX_KEY_LEN
        )));
    }
    if args.iter().copied().any(is_control) {
        return Err(McError::validation("stats arguments contain control character"));
    }
    Ok(())
}

// ASCII C0 controls and DEL. Bytes >= 0x80 are left alone for UTF-8 keys.
#[inline]
fn is_control(b: u8) -> bool {
    b < 0x20 || b == 0x7f
}

/// Per-store options for `set`/`add`/`replace`/`append`/`prepend`/`cas`.
///
/// Both fields are unsigned, so negative values cannot reach the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Opaque 32-bit flags stored with the value.
    pub flags: u32,
    /// Relative expiry in seconds; 0 means no expiry.
    pub exptime: u32,
}

impl StoreOptions {
    /// Options with the given flags and no expiry.
    pub fn with_flags(flags: u32) -> Self {
        StoreOptions { flags, exptime: 0 }
    }

    /// Options with the given expiry and zero flags.
    pub fn with_exptime(exptime: u32) -> Self {
        StoreOptions { flags: 0, exptime }
    }
}

/// A value returned by a retrieval command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Stored payload.
    pub data: Bytes,
    /// Flags stored alongside the payload.
    pub flags: u32,
    /// CAS token, present only for `gets` replies.
    pub cas: Option<u64>,
}
