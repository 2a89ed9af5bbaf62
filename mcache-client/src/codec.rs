//! # Text Protocol Encoding and Parsing
//!
//! Purpose: Encode memcached text commands and parse the server's replies
//! with strict framing checks.
//!
//! ## Design Principles
//! 1. **One Decoder per Family**: The issued `Request` selects the decoder
//!    (status, numeric, values, stats, version); replies are never sniffed.
//! 2. **Buffer Reuse**: Caller provides the line buffer to avoid per-call allocations.
//! 3. **Binary-Safe**: Payloads are read by declared length, never by delimiter.
//! 4. **Fail Fast**: A framing violation is a `McError::Response` the moment it
//!    is seen; partially parsed replies are never returned.
//!
//! ## Absence vs. Violation
//!
//! `NOT_FOUND`, `NOT_STORED` and `EXISTS` are valid statuses and decode to
//! values. Unknown tokens, server error lines, duplicate or unrequested
//! `VALUE` blocks, and payload length mismatches are response errors.

use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use mcache_common::{Item, Key, McError, McResult, StoreOptions};

/// Longest reply line accepted, terminator included.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Largest payload a `VALUE` header may announce.
pub const MAX_PAYLOAD_LEN: usize = 128 * 1024 * 1024;

/// Storage-class command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    /// Conditional store guarded by the given CAS token.
    Cas(u64),
}

impl StoreCommand {
    fn verb(&self) -> &'static [u8] {
        match self {
            StoreCommand::Set => b"set",
            StoreCommand::Add => b"add",
            StoreCommand::Replace => b"replace",
            StoreCommand::Append => b"append",
            StoreCommand::Prepend => b"prepend",
            StoreCommand::Cas(_) => b"cas",
        }
    }

    /// Statuses the server may legitimately answer with.
    fn accepted(&self) -> &'static [Status] {
        match self {
            StoreCommand::Cas(_) => &[Status::Stored, Status::Exists, Status::NotFound],
            _ => &[Status::Stored, Status::NotStored],
        }
    }
}

/// Retrieval command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalCommand {
    Get,
    Gets,
}

/// Arithmetic command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithCommand {
    Incr,
    Decr,
}

/// A fully typed request. Keys are validated by construction.
#[derive(Debug, Clone)]
pub enum Request<'a> {
    Store {
        command: StoreCommand,
        key: Key<'a>,
        value: &'a [u8],
        options: StoreOptions,
    },
    Retrieve {
        command: RetrievalCommand,
        keys: Vec<Key<'a>>,
    },
    Delete {
        key: Key<'a>,
    },
    Arith {
        command: ArithCommand,
        key: Key<'a>,
        delta: u64,
    },
    Touch {
        key: Key<'a>,
        exptime: u32,
    },
    Stats {
        args: Option<&'a [u8]>,
    },
    Version,
    FlushAll,
}

impl Request<'_> {
    /// Encodes the full request (line, and payload for stores) into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.encode_line(out);
        out.extend_from_slice(b"\r\n");
        if let Request::Store { value, .. } = self {
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Request line without terminator or payload, for diagnostics.
    pub fn command_line(&self) -> String {
        let mut line = Vec::with_capacity(64);
        self.encode_line(&mut line);
        String::from_utf8_lossy(&line).into_owned()
    }

    fn encode_line(&self, out: &mut Vec<u8>) {
        match self {
            Request::Store {
                command,
                key,
                value,
                options,
            } => {
                out.extend_from_slice(command.verb());
                out.push(b' ');
                out.extend_from_slice(key.as_bytes());
                out.push(b' ');
                push_u64(out, options.flags as u64);
                out.push(b' ');
                push_u64(out, options.exptime as u64);
                out.push(b' ');
                push_u64(out, value.len() as u64);
                if let StoreCommand::Cas(token) = command {
                    out.push(b' ');
                    push_u64(out, *token);
                }
            }
            Request::Retrieve { command, keys } => {
                let verb: &[u8] = match command {
                    RetrievalCommand::Get => b"get",
                    RetrievalCommand::Gets => b"gets",
                };
                out.extend_from_slice(verb);
                for key in keys {
                    out.push(b' ');
                    out.extend_from_slice(key.as_bytes());
                }
            }
            Request::Delete { key } => {
                out.extend_from_slice(b"delete ");
                out.extend_from_slice(key.as_bytes());
            }
            Request::Arith {
                command,
                key,
                delta,
            } => {
                let verb: &[u8] = match command {
                    ArithCommand::Incr => b"incr ",
                    ArithCommand::Decr => b"decr ",
                };
                out.extend_from_slice(verb);
                out.extend_from_slice(key.as_bytes());
                out.push(b' ');
                push_u64(out, *delta);
            }
            Request::Touch { key, exptime } => {
                out.extend_from_slice(b"touch ");
                out.extend_from_slice(key.as_bytes());
                out.push(b' ');
                push_u64(out, *exptime as u64);
            }
            Request::Stats { args } => {
                out.extend_from_slice(b"stats");
                if let Some(args) = args {
                    out.push(b' ');
                    out.extend_from_slice(args);
                }
            }
            Request::Version => out.extend_from_slice(b"version"),
            Request::FlushAll => out.extend_from_slice(b"flush_all"),
        }
    }

    fn error(&self, raw: &[u8]) -> McError {
        McError::response(self.command_line(), raw.to_vec())
    }
}

/// Single-line status replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
}

impl Status {
    fn from_line(line: &[u8]) -> Option<Status> {
        match line {
            b"STORED" => Some(Status::Stored),
            b"NOT_STORED" => Some(Status::NotStored),
            b"EXISTS" => Some(Status::Exists),
            b"NOT_FOUND" => Some(Status::NotFound),
            b"DELETED" => Some(Status::Deleted),
            b"TOUCHED" => Some(Status::Touched),
            b"OK" => Some(Status::Ok),
            _ => None,
        }
    }
}

/// Decoded reply, one variant per command family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// store variants, delete, touch, cas, flush_all.
    Status(Status),
    /// incr/decr; `None` when the key is absent.
    Numeric(Option<u64>),
    /// get/gets; only keys that were found.
    Values(HashMap<Vec<u8>, Item>),
    /// stats; name to raw value.
    Stats(HashMap<Vec<u8>, Vec<u8>>),
    /// version string after `VERSION `.
    Version(Vec<u8>),
}

/// Reads one complete reply for `request` from the buffered reader.
pub async fn read_reply<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    request: &Request<'_>,
) -> McResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    match request {
        Request::Store { command, .. } => {
            read_status(reader, line_buf, request, command.accepted()).await
        }
        Request::Delete { .. } => {
            read_status(reader, line_buf, request, &[Status::Deleted, Status::NotFound]).await
        }
        Request::Touch { .. } => {
            read_status(reader, line_buf, request, &[Status::Touched, Status::NotFound]).await
        }
        Request::FlushAll => read_status(reader, line_buf, request, &[Status::Ok]).await,
        Request::Arith { .. } => read_numeric(reader, line_buf, request).await,
        Request::Retrieve { command, keys } => {
            let with_cas = *command == RetrievalCommand::Gets;
            read_values(reader, line_buf, request, keys, with_cas).await
        }
        Request::Stats { .. } => read_stats(reader, line_buf, request).await,
        Request::Version => read_version(reader, line_buf, request).await,
    }
}

async fn read_status<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    request: &Request<'_>,
    accepted: &[Status],
) -> McResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader, line_buf, request).await?;
    match Status::from_line(line_buf) {
        Some(status) if accepted.contains(&status) => Ok(Reply::Status(status)),
        _ => Err(request.error(line_buf)),
    }
}

async fn read_numeric<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    request: &Request<'_>,
) -> McResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader, line_buf, request).await?;
    if line_buf.as_slice() == b"NOT_FOUND" {
        return Ok(Reply::Numeric(None));
    }
    // memcached pads decr results with trailing spaces when the value shrinks.
    let digits = trim_trailing_spaces(line_buf);
    match parse_u64(digits) {
        Some(value) => Ok(Reply::Numeric(Some(value))),
        None => Err(request.error(line_buf)),
    }
}

struct ValueHeader {
    key: Vec<u8>,
    flags: u32,
    len: usize,
    cas: Option<u64>,
}

async fn read_values<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    request: &Request<'_>,
    keys: &[Key<'_>],
    with_cas: bool,
) -> McResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut items = HashMap::with_capacity(keys.len());
    loop {
        read_line(reader, line_buf, request).await?;
        if line_buf.as_slice() == b"END" {
            break;
        }

        let header = parse_value_header(line_buf, with_cas).ok_or_else(|| request.error(line_buf.as_slice()))?;
        let requested = keys.iter().any(|key| key.as_bytes() == header.key.as_slice());
        if !requested || items.contains_key(&header.key) || items.len() >= keys.len() {
            return Err(request.error(line_buf));
        }

        let data = read_payload(reader, line_buf, request, header.len).await?;
        items.insert(
            header.key,
            Item {
                data,
                flags: header.flags,
                cas: header.cas,
            },
        );
    }
    Ok(Reply::Values(items))
}

/// Parses `VALUE <key> <flags> <bytes> [<cas>]`.
fn parse_value_header(line: &[u8], with_cas: bool) -> Option<ValueHeader> {
    let mut parts = line.split(|&b| b == b' ');
    if parts.next()? != b"VALUE" {
        return None;
    }
    let key = parts.next().filter(|key| !key.is_empty())?.to_vec();
    let flags = u32::try_from(parse_u64(parts.next()?)?).ok()?;
    let len = usize::try_from(parse_u64(parts.next()?)?).ok()?;
    if len > MAX_PAYLOAD_LEN {
        return None;
    }
    let cas = match parts.next() {
        Some(raw) => Some(parse_u64(raw)?),
        None if with_cas => return None,
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ValueHeader {
        key,
        flags,
        len,
        cas,
    })
}

async fn read_payload<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    request: &Request<'_>,
    len: usize,
) -> McResult<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != [b'\r', b'\n'] {
        line_buf.extend_from_slice(b"\r\n");
        line_buf.extend_from_slice(&data);
        line_buf.extend_from_slice(&crlf);
        return Err(request.error(line_buf));
    }
    Ok(Bytes::from(data))
}

async fn read_stats<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    request: &Request<'_>,
) -> McResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = HashMap::new();
    loop {
        read_line(reader, line_buf, request).await?;
        if line_buf.as_slice() == b"END" {
            break;
        }

        let mut parts = line_buf.splitn(3, |&b| b == b' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tag), Some(name), Some(value)) if tag == b"STAT" && !name.is_empty() => {
                stats.insert(name.to_vec(), value.to_vec());
            }
            (Some(tag), _, _) if tag == b"STAT" => {
                tracing::trace!(line = %String::from_utf8_lossy(&line_buf[..]), "skipping stat without value");
            }
            _ => return Err(request.error(&line_buf[..])),
        }
    }
    Ok(Reply::Stats(stats))
}

async fn read_version<R>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    request: &Request<'_>,
) -> McResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader, line_buf, request).await?;
    match line_buf.strip_prefix(b"VERSION ") {
        Some(version) => Ok(Reply::Version(version.to_vec())),
        None => Err(request.error(line_buf)),
    }
}

/// Reads one CRLF-terminated line into `buf`, terminator stripped.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, request: &Request<'_>) -> McResult<()>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let bytes = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', buf)
        .await?;
    if bytes == 0 {
        return Err(closed_mid_reply());
    }
    if buf.last() != Some(&b'\n') {
        if bytes >= MAX_LINE_LEN {
            return Err(request.error(buf));
        }
        return Err(closed_mid_reply());
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(request.error(buf));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn closed_mid_reply() -> McError {
    McError::Connection(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed before reply completed",
    ))
}

fn trim_trailing_spaces(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != b' ').map_or(0, |idx| idx + 1);
    &data[..end]
}

fn parse_u64(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(value)
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
