//! Minimal HTTP/1.1 exchange on dataplane connections.
//!
//! The dataplane only ever handles one request per connection: either it is
//! refused with a plain status response, or the connection is hijacked after
//! a synthetic `200 OK` and turned into a raw byte stream. Heads are parsed
//! with `httparse` and reading stops at the header boundary; anything the
//! peer pipelined after it is handed back with the hijacked stream.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::api;
use crate::error::DataplaneError;

/// Largest accepted request or response head.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Largest accepted number of headers.
pub const MAX_HEADERS: usize = 64;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Headers in arrival order, names as received.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// First value of a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn content_length(&self) -> Result<usize, DataplaneError> {
        match self.header("content-length") {
            None => Ok(0),
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| DataplaneError::Http("invalid content-length".to_string())),
        }
    }
}

/// A connection detached from the HTTP exchange.
#[derive(Debug)]
pub struct Hijacked<S> {
    pub io: S,
    /// Bytes read past the header boundary, not yet delivered anywhere.
    pub leftover: Bytes,
}

/// Capability to detach the underlying byte stream from an HTTP exchange.
#[async_trait]
pub trait Hijack {
    type Io;

    /// Write a bare status line and hand back the raw stream.
    async fn hijack(self, status: StatusCode) -> io::Result<Hijacked<Self::Io>>;
}

/// Server side of a single-request HTTP/1.1 connection.
pub struct HttpConn<S> {
    io: S,
    buf: BytesMut,
}

impl<S> HttpConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read one request head and its `Content-Length` body.
    ///
    /// Returns `None` if the peer closed before sending anything.
    pub async fn read_request(&mut self) -> Result<Option<(RequestHead, Bytes)>, DataplaneError> {
        let head = loop {
            if let Some(head) = self.try_parse_head()? {
                break head;
            }
            if self.buf.len() >= MAX_HEAD_BYTES {
                return Err(DataplaneError::Http("request head too large".to_string()));
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(DataplaneError::Http("connection closed mid-head".to_string()));
            }
        };

        let body_len = head.content_length()?;
        if body_len > MAX_BODY_BYTES {
            return Err(DataplaneError::Http(format!("request body too large ({body_len} bytes)")));
        }

        while self.buf.len() < body_len {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(DataplaneError::Http("connection closed mid-body".to_string()));
            }
        }

        let body = self.buf.split_to(body_len).freeze();
        Ok(Some((head, body)))
    }

    fn try_parse_head(&mut self) -> Result<Option<RequestHead>, DataplaneError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let consumed = match req.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(DataplaneError::Http(format!("invalid request head: {e}"))),
        };

        let head = RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        };

        let _ = self.buf.split_to(consumed);
        Ok(Some(head))
    }

    /// Answer with a bodiless status and close.
    pub async fn respond(mut self, status: StatusCode) -> io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        self.io.write_all(response.as_bytes()).await?;
        self.io.shutdown().await
    }
}

#[async_trait]
impl<S> Hijack for HttpConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Io = S;

    async fn hijack(mut self, status: StatusCode) -> io::Result<Hijacked<S>> {
        let line = format!(
            "HTTP/1.1 {} {}\r\n\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;

        Ok(Hijacked {
            io: self.io,
            leftover: self.buf.freeze(),
        })
    }
}

/// Identity carried on an egress handoff to a peer dataplane.
#[derive(Debug, Clone)]
pub struct Handoff<'a> {
    pub host: &'a str,
    pub access_token: &'a str,
    pub import_name: &'a str,
    pub client_ip: IpAddr,
}

/// Send the handoff request on a fresh peer connection and wait for its verdict.
///
/// Returns the bytes the peer sent after its response head.
pub async fn send_handoff<S>(io: &mut S, handoff: &Handoff<'_>) -> Result<Bytes, DataplaneError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {host}\r\n{auth}: {token}\r\n{import_header}: {import}\r\n{ip_header}: {ip}\r\nContent-Length: 0\r\n\r\n",
        path = api::DATAPLANE_INGRESS_PATH,
        host = handoff.host,
        auth = AUTHORIZATION.as_str(),
        token = handoff.access_token,
        import_header = api::IMPORT_NAME_HEADER,
        import = handoff.import_name,
        ip_header = api::CLIENT_IP_HEADER,
        ip = handoff.client_ip,
    );
    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let (status, leftover) = read_response_head(io).await?;
    if status != StatusCode::OK.as_u16() {
        return Err(DataplaneError::HandoffRejected(status));
    }
    Ok(leftover)
}

/// Read a response head; returns its status code and any bytes past it.
pub async fn read_response_head<S>(io: &mut S) -> Result<(u16, Bytes), DataplaneError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        match resp.parse(&buf) {
            Ok(httparse::Status::Complete(n)) => {
                let status = resp.code.unwrap_or_default();
                let _ = buf.split_to(n);
                return Ok((status, buf.freeze()));
            }
            Ok(httparse::Status::Partial) => {}
            Err(e) => return Err(DataplaneError::Http(format!("invalid response head: {e}"))),
        }

        if buf.len() >= MAX_HEAD_BYTES {
            return Err(DataplaneError::Http("response head too large".to_string()));
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Err(DataplaneError::Http("connection closed before response".to_string()));
        }
    }
}
