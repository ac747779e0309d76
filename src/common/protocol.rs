//! Memcache text protocol subset
//!
//! Shared by the client-facing proxy listener, the storage node listener and
//! the proxy's node client. Supported commands:
//!
//! ```text
//! get <key>*            VALUE <key> <flags> <bytes>\r\n<data>\r\n ... END
//! gets <key>*           VALUE <key> <flags> <bytes> <revision>\r\n<data>\r\n ... END
//! get ?<key>            metadata line as the value (see RecordMeta)
//! set <key> <flags> <revision> <bytes> [noreply]\r\n<data>\r\n
//! delete <key> [noreply]
//! version / quit
//! ```
//!
//! The `exptime` column of `set` carries an explicit revision; 0 lets the
//! storage engine assign the next one.

use crate::common::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted command line
pub const MAX_LINE: u64 = 8 * 1024;

/// Oversized `set` bodies up to this multiple of `body_max` are drained
/// before the error reply; larger declared sizes are refused outright
const DRAIN_FACTOR: usize = 4;

/// A value as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub flags: u32,
    pub value: Bytes,
    /// Requested revision on `set` (0 = auto), stored revision on `gets`
    pub rev: i64,
}

impl Item {
    pub fn new(flags: u32, value: impl Into<Bytes>) -> Self {
        Self {
            flags,
            value: value.into(),
            rev: 0,
        }
    }

    pub fn with_rev(mut self, rev: i64) -> Self {
        self.rev = rev;
        self
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Metadata line returned for `get ?key` and `get ??key`:
/// `revision content-hash flags size timestamp chunk-id offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordMeta {
    pub rev: i64,
    pub hash: u32,
    pub flags: u32,
    pub size: u64,
    pub timestamp: u64,
    pub chunk_id: u32,
    pub offset: u64,
}

impl fmt::Display for RecordMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.rev, self.hash, self.flags, self.size, self.timestamp, self.chunk_id, self.offset
        )
    }
}

impl FromStr for RecordMeta {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 7 {
            return Err(Error::Protocol(format!("bad meta line: {}", s)));
        }
        let bad = |_| Error::Protocol(format!("bad meta line: {}", s));
        Ok(Self {
            rev: fields[0].parse().map_err(bad)?,
            hash: fields[1].parse().map_err(bad)?,
            flags: fields[2].parse().map_err(bad)?,
            size: fields[3].parse().map_err(bad)?,
            timestamp: fields[4].parse().map_err(bad)?,
            chunk_id: fields[5].parse().map_err(bad)?,
            offset: fields[6].parse().map_err(bad)?,
        })
    }
}

/// Split a `?key` / `??key` metadata query into the plain key
pub fn meta_query(key: &str) -> Option<&str> {
    if key.len() < 2 {
        return None;
    }
    key.strip_prefix("??")
        .filter(|k| !k.is_empty())
        .or_else(|| key.strip_prefix('?'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { keys: Vec<String>, with_rev: bool },
    Set { key: String, item: Item, noreply: bool },
    Delete { key: String, noreply: bool },
    Version,
    Quit,
}

/// One unit read from a connection
#[derive(Debug)]
pub enum Frame {
    Command(Command),
    /// Well-formed request that must be answered with an error line
    Rejected(Error),
    /// Unknown command word
    Unknown,
    Eof,
}

fn key_from(token: &str) -> String {
    token.to_string()
}

/// Read the next request from a client connection
pub async fn read_frame<R>(reader: &mut R, body_max: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut raw = Vec::new();
        let n = (&mut *reader).take(MAX_LINE).read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Ok(Frame::Eof);
        }
        if !raw.ends_with(b"\n") {
            return Ok(Frame::Rejected(Error::Protocol("line too long".into())));
        }

        // Invalid UTF-8 becomes U+FFFD, which key validation rejects
        let line = String::from_utf8_lossy(&raw);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = tokens.split_first() else {
            continue;
        };

        return match cmd {
            "get" | "gets" => {
                if args.is_empty() {
                    return Ok(Frame::Rejected(Error::Protocol("get without key".into())));
                }
                Ok(Frame::Command(Command::Get {
                    keys: args.iter().map(|k| key_from(k)).collect(),
                    with_rev: cmd == "gets",
                }))
            }
            "set" => read_set_body(reader, args, body_max).await,
            "delete" => {
                let Some(key) = args.first() else {
                    return Ok(Frame::Rejected(Error::Protocol("delete without key".into())));
                };
                Ok(Frame::Command(Command::Delete {
                    key: key_from(key),
                    noreply: args.get(1) == Some(&"noreply"),
                }))
            }
            "version" => Ok(Frame::Command(Command::Version)),
            "quit" => Ok(Frame::Command(Command::Quit)),
            _ => Ok(Frame::Unknown),
        };
    }
}

async fn read_set_body<R>(reader: &mut R, args: &[&str], body_max: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    if args.len() < 4 {
        return Ok(Frame::Rejected(Error::Protocol("bad set line".into())));
    }
    let (Ok(flags), Ok(rev), Ok(size)) = (
        args[1].parse::<u32>(),
        args[2].parse::<i64>(),
        args[3].parse::<usize>(),
    ) else {
        return Ok(Frame::Rejected(Error::Protocol("bad set line".into())));
    };
    let noreply = args.get(4) == Some(&"noreply");

    if size > body_max.saturating_mul(DRAIN_FACTOR) {
        return Ok(Frame::Rejected(Error::Protocol(format!(
            "declared size {} is not acceptable",
            size
        ))));
    }
    if size > body_max {
        let mut sink = tokio::io::sink();
        let pending = (size as u64).saturating_add(2);
        tokio::io::copy(&mut (&mut *reader).take(pending), &mut sink).await?;
        return Ok(Frame::Rejected(Error::TooLarge {
            size,
            max: body_max,
        }));
    }

    let mut body = vec![0u8; size + 2];
    reader.read_exact(&mut body).await?;
    if !body.ends_with(b"\r\n") {
        return Ok(Frame::Rejected(Error::BadDataChunk));
    }
    body.truncate(size);

    // Negative revisions are tombstones; only deletes write them
    if rev < 0 {
        return Ok(Frame::Rejected(Error::Protocol(format!(
            "negative revision {}",
            rev
        ))));
    }

    Ok(Frame::Command(Command::Set {
        key: key_from(args[0]),
        item: Item::new(flags, body).with_rev(rev),
        noreply,
    }))
}

/// Write one `VALUE` block
pub async fn write_value<W>(writer: &mut W, key: &str, item: &Item, with_rev: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = if with_rev {
        format!("VALUE {} {} {} {}\r\n", key, item.flags, item.len(), item.rev)
    } else {
        format!("VALUE {} {} {}\r\n", key, item.flags, item.len())
    };
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&item.value).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Write a status line such as `STORED` or `END`
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

// === Client side (proxy → node) ===

pub async fn send_get<W>(writer: &mut W, keys: &[&str], with_rev: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let cmd = if with_rev { "gets" } else { "get" };
    writer
        .write_all(format!("{} {}\r\n", cmd, keys.join(" ")).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

pub async fn send_set<W>(writer: &mut W, key: &str, item: &Item) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("set {} {} {} {}\r\n", key, item.flags, item.rev, item.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&item.value).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

pub async fn send_delete<W>(writer: &mut W, key: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("delete {}\r\n", key).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Read one status line, without the trailing CRLF
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let n = (&mut *reader).take(MAX_LINE).read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Err(Error::ConnectionFailed("connection closed by peer".into()));
    }
    let line = String::from_utf8_lossy(&raw);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read `VALUE` blocks up to `END`
pub async fn read_values<R>(reader: &mut R, body_max: usize) -> Result<Vec<(String, Item)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut values = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line == "END" {
            return Ok(values);
        }
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() < 4 || parts[0] != "VALUE" {
            return Err(Error::Protocol(format!("unexpected reply: {}", line)));
        }
        let bad = |_| Error::Protocol(format!("bad VALUE line: {}", line));
        let flags: u32 = parts[2].parse().map_err(bad)?;
        let size: usize = parts[3].parse().map_err(bad)?;
        let rev: i64 = match parts.get(4) {
            Some(r) => r.parse().map_err(bad)?,
            None => 0,
        };
        if size > body_max {
            return Err(Error::Protocol(format!("value of {} bytes exceeds limit", size)));
        }

        let mut body = vec![0u8; size + 2];
        reader.read_exact(&mut body).await?;
        if !body.ends_with(b"\r\n") {
            return Err(Error::Protocol("bad data chunk from node".into()));
        }
        body.truncate(size);
        values.push((parts[1].to_string(), Item::new(flags, body).with_rev(rev)));
    }
}
