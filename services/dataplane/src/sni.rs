//! Server Name Indication extraction from a TLS ClientHello.
//!
//! The inspector reads the first TLS record of a connection into a buffer
//! and parses it just far enough to find the `server_name` extension. The
//! bytes read are handed back so the caller can replay them to the backend;
//! TLS is never terminated here.
//!
//! Bounds:
//! - the whole first record must fit in `max_bytes` (default 8 KiB),
//! - it must arrive within `timeout` (default 5s).
//!
//! Only the first record is parsed: a ClientHello fragmented across several
//! handshake records is reported as `Malformed`.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

/// Default time allowed for the ClientHello to arrive.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound on the first TLS record.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Outcome of inspecting a connection's first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Server name found (lowercased, trailing dot removed).
    Found(String),
    /// Well-formed ClientHello without a server name.
    NoSni,
    /// First bytes are not a TLS handshake record.
    NotTls,
    /// ClientHello did not arrive in time.
    Timeout,
    /// First record is larger than the configured bound.
    Oversized(usize),
    /// ClientHello is truncated or structurally invalid.
    Malformed,
    /// Socket error while reading.
    IoError(String),
}

/// Configuration for SNI inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Result of an inspection plus every byte consumed from the stream.
#[derive(Debug)]
pub struct Sniffed {
    pub result: SniResult,
    pub buffered: Vec<u8>,
}

/// Peeks the ClientHello of incoming connections.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Read the first TLS record and extract its server name.
    pub async fn inspect<R: AsyncRead + Unpin>(&self, stream: &mut R) -> Sniffed {
        let mut buffered = Vec::with_capacity(RECORD_HEADER_LEN);

        let read = timeout(self.config.timeout, self.read_first_record(stream, &mut buffered)).await;

        let result = match read {
            Ok(Ok(Some(oversized))) => SniResult::Oversized(oversized),
            Ok(Ok(None)) => parse_client_hello(&buffered),
            Ok(Err(e)) => SniResult::IoError(e.to_string()),
            Err(_) => SniResult::Timeout,
        };

        Sniffed { result, buffered }
    }

    /// Fill `buf` with the first record. Returns `Some(len)` if the record
    /// announces more than `max_bytes`.
    async fn read_first_record<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buf: &mut Vec<u8>,
    ) -> io::Result<Option<usize>> {
        if !read_until(stream, buf, RECORD_HEADER_LEN).await? {
            return Ok(None);
        }

        if buf[0] != CONTENT_TYPE_HANDSHAKE {
            return Ok(None);
        }

        let record_len = RECORD_HEADER_LEN + u16::from_be_bytes([buf[3], buf[4]]) as usize;
        if record_len > self.config.max_bytes {
            debug!(record_len, max = self.config.max_bytes, "ClientHello record too large");
            return Ok(Some(record_len));
        }

        read_until(stream, buf, record_len).await?;
        Ok(None)
    }
}

/// Read until `buf` holds `want` bytes. Returns `false` on early end of stream.
async fn read_until<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    want: usize,
) -> io::Result<bool> {
    let mut chunk = [0u8; 1024];
    while buf.len() < want {
        let limit = (want - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..limit]).await?;
        if n == 0 {
            return Ok(false);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.bytes(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Split off a length-prefixed block as its own cursor.
    fn block(&mut self, len: usize) -> Option<Cursor<'a>> {
        self.bytes(len).map(Cursor::new)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Parse a complete first TLS record holding a ClientHello.
///
/// ```text
/// record:       type(1) version(2) length(2) fragment
/// handshake:    msg_type(1) length(3) body
/// client_hello: version(2) random(32) session_id<1> cipher_suites<2>
///               compression_methods<1> extensions<2>
/// extension:    type(2) data<2>
/// ```
pub fn parse_client_hello(data: &[u8]) -> SniResult {
    let mut record = Cursor::new(data);

    let Some(content_type) = record.u8() else {
        return SniResult::Malformed;
    };
    if content_type != CONTENT_TYPE_HANDSHAKE {
        return SniResult::NotTls;
    }

    let parsed = (|| {
        record.u16()?;
        let fragment_len = record.u16()? as usize;
        let mut fragment = record.block(fragment_len)?;

        if fragment.u8()? != HANDSHAKE_CLIENT_HELLO {
            return Some(SniResult::NotTls);
        }
        let body_len = fragment.u24()?;
        let mut hello = fragment.block(body_len)?;

        hello.bytes(2 + 32)?;
        let session_id_len = hello.u8()? as usize;
        hello.bytes(session_id_len)?;
        let suites_len = hello.u16()? as usize;
        hello.bytes(suites_len)?;
        let compression_len = hello.u8()? as usize;
        hello.bytes(compression_len)?;

        if hello.is_empty() {
            return Some(SniResult::NoSni);
        }

        let extensions_len = hello.u16()? as usize;
        let mut extensions = hello.block(extensions_len)?;
        while !extensions.is_empty() {
            let ext_type = extensions.u16()?;
            let ext_len = extensions.u16()? as usize;
            let ext = extensions.block(ext_len)?;
            if ext_type == EXTENSION_SERVER_NAME {
                return Some(parse_server_name_list(ext));
            }
        }

        Some(SniResult::NoSni)
    })();

    parsed.unwrap_or(SniResult::Malformed)
}

fn parse_server_name_list(mut ext: Cursor<'_>) -> SniResult {
    let parsed = (|| {
        let list_len = ext.u16()? as usize;
        let mut list = ext.block(list_len)?;
        while !list.is_empty() {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.bytes(name_len)?;
            if name_type == NAME_TYPE_HOST_NAME {
                let host = std::str::from_utf8(name).ok()?;
                if host.is_empty() {
                    return None;
                }
                return Some(SniResult::Found(normalize_server_name(host)));
            }
        }
        Some(SniResult::NoSni)
    })();

    parsed.unwrap_or(SniResult::Malformed)
}

/// Lowercase and drop a trailing dot.
pub fn normalize_server_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
