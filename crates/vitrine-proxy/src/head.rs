use std::io;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::io::{AsyncRead, AsyncReadExt};

const IO_CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

pub struct BufferedConn<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Reads one request head byte by byte so nothing beyond the terminating
/// CRLFCRLF is consumed. The CONNECT path needs the socket positioned
/// exactly at the first TLS byte.
pub async fn read_head_bytewise<S>(stream: &mut S, max_bytes: usize) -> io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut data = Vec::with_capacity(1024);
    let mut byte = [0_u8; 1];

    while !data.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            if data.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before request headers completed",
            ));
        }

        data.push(byte[0]);
        if data.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request header exceeded configured limit",
            ));
        }
    }

    Ok(Some(data))
}

pub async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP header exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn is_connect_head(head: &[u8]) -> bool {
    head.starts_with(b"CONNECT ")
}

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }

    let method = Method::from_bytes(method_text.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid request method"))?;
    let version = parse_http_version(version_text)?;
    let headers = parse_headers(lines)?;
    let body_mode = parse_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        method,
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_http_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "only HTTP/1.0 and HTTP/1.1 are supported",
        )),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn parse_body_mode(headers: &HeaderMap) -> io::Result<HttpBodyMode> {
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(HttpBodyMode::Chunked);
    }
    if let Some(value) = headers.get(http::header::CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length value")
            })?;
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }
    Ok(HttpBodyMode::None)
}

pub fn has_header_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

fn is_connection_close(version: HttpVersion, headers: &HeaderMap) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    if version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive") {
        return true;
    }
    false
}

/// Parses a CONNECT authority. A missing port means 443; IPv6 literals
/// come bracketed.
pub fn parse_connect_target(authority: &str) -> io::Result<ConnectTarget> {
    if authority.is_empty() {
        return Err(invalid_authority("empty CONNECT authority"));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, suffix) = rest
            .split_once(']')
            .ok_or_else(|| invalid_authority("unterminated IPv6 literal"))?;
        if host.is_empty() {
            return Err(invalid_authority("empty IPv6 literal"));
        }
        let port = match suffix.strip_prefix(':') {
            Some(port_text) => parse_port(port_text)?,
            None if suffix.is_empty() => 443,
            None => return Err(invalid_authority("garbage after IPv6 literal")),
        };
        return Ok(ConnectTarget {
            host: host.to_string(),
            port,
        });
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) => {
            if host.is_empty() {
                return Err(invalid_authority("empty CONNECT host"));
            }
            if host.contains(':') {
                return Err(invalid_authority("unbracketed IPv6 literal"));
            }
            Ok(ConnectTarget {
                host: host.to_string(),
                port: parse_port(port_text)?,
            })
        }
        None => Ok(ConnectTarget {
            host: authority.to_string(),
            port: 443,
        }),
    }
}

fn parse_port(text: &str) -> io::Result<u16> {
    text.parse::<u16>()
        .map_err(|_| invalid_authority("invalid CONNECT port"))
}

fn invalid_authority(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.to_string())
}

/// Drains the request body off the connection, decoding chunked framing,
/// bounded by `limit`.
pub async fn read_request_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    mode: HttpBodyMode,
    limit: usize,
) -> io::Result<Bytes> {
    match mode {
        HttpBodyMode::None => Ok(Bytes::new()),
        HttpBodyMode::ContentLength(length) => {
            if length > limit as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request body exceeds configured limit",
                ));
            }
            let body = read_exact_from_source(conn, length as usize).await?;
            Ok(Bytes::from(body))
        }
        HttpBodyMode::Chunked => read_chunked_body(conn, limit).await,
    }
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    limit: usize,
) -> io::Result<Bytes> {
    let mut body = Vec::new();
    loop {
        let line = read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunk size line was read",
                )
            })?;
        let chunk_len = parse_chunk_len(&line)?;

        if chunk_len == 0 {
            // Trailer section: lines until the terminating empty line.
            loop {
                let trailer = read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT)
                    .await?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before chunked trailers completed",
                        )
                    })?;
                if trailer == b"\r\n" {
                    return Ok(Bytes::from(body));
                }
            }
        }

        if body.len() + chunk_len as usize > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body exceeds configured limit",
            ));
        }

        let chunk = read_exact_from_source(conn, chunk_len as usize).await?;
        body.extend_from_slice(&chunk);

        let terminator = read_exact_from_source(conn, 2).await?;
        if terminator.as_slice() != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk terminator",
            ));
        }
    }
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid UTF-8",
        )
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

async fn read_exact_from_source<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    exact_len: usize,
) -> io::Result<Vec<u8>> {
    while conn.read_buf.len() < exact_len {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(conn.read_buf.drain(..exact_len).collect::<Vec<_>>())
}
