use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use vitrine_cache::{cache_key, is_cacheable, response_ttl, CacheEntry, HttpCache};

use crate::bufpool::{write_all_timed, BufferPool};
use crate::errors::ProxyError;
use crate::transport::OutboundTransport;

/// RFC 7230 §6.1 hop-by-hop headers, plus the de-facto
/// `Proxy-Connection`. Never forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One client request after normalization: the URI is always the
/// effective absolute URL, whether it arrived in absolute form or was
/// rewritten from an intercepted tunnel.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeDisposition {
    KeepAlive,
    Close,
}

/// The cache-lookup/forward pipeline shared by the plain-HTTP handler
/// and the TLS intercept handler. Both feed normalized requests in and
/// get an HTTP/1.1 byte stream written to their sink.
pub struct RequestPipeline {
    cache: Arc<HttpCache>,
    transport: Arc<OutboundTransport>,
    pool: Arc<BufferPool>,
    default_ttl: Duration,
    write_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(
        cache: Arc<HttpCache>,
        transport: Arc<OutboundTransport>,
        pool: Arc<BufferPool>,
        default_ttl: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            transport,
            pool,
            default_ttl,
            write_timeout,
        }
    }

    /// Serves one request: cache hit, or forward-and-maybe-cache. When
    /// `scrub_upstream_errors` is set, synthetic 502 bodies carry a
    /// generic message instead of the transport error text (the
    /// intercept path must not leak handshake details).
    pub async fn serve<W>(
        &self,
        request: ClientRequest,
        sink: &mut W,
        scrub_upstream_errors: bool,
    ) -> io::Result<ServeDisposition>
    where
        W: AsyncWrite + Unpin,
    {
        let url = request.uri.to_string();
        let key = cache_key(&request.method, &url, &request.headers);

        if let Some(entry) = self.cache.get(&key) {
            debug!(%url, "cache hit");
            let framed = entry.to_http1_response(SystemTime::now());
            write_all_timed(sink, &framed, self.write_timeout).await?;
            sink.flush().await?;
            return Ok(ServeDisposition::KeepAlive);
        }
        debug!(%url, "cache miss");

        let outbound = build_outbound_request(&request)?;
        let response = match self.transport.send(outbound).await {
            Ok(response) => response,
            Err(error) => {
                debug!(%url, %error, "upstream exchange failed");
                let (status, detail) = match &error {
                    ProxyError::UpstreamTimeout(_) => {
                        ("504 Gateway Timeout", "upstream request timed out".to_string())
                    }
                    other => ("502 Bad Gateway", other.to_string()),
                };
                let body = if scrub_upstream_errors {
                    "upstream request failed".to_string()
                } else {
                    detail
                };
                write_simple_response(sink, status, &body, self.write_timeout).await?;
                return Ok(ServeDisposition::Close);
            }
        };

        let (parts, body) = response.into_parts();
        let mut response_headers = parts.headers;
        strip_hop_by_hop(&mut response_headers);

        if is_cacheable(&request.method, &request.headers, parts.status, &response_headers) {
            let collected = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(error) => {
                    warn!(%url, %error, "upstream body read failed before headers were sent");
                    write_simple_response(
                        sink,
                        "502 Bad Gateway",
                        "upstream body read failed",
                        self.write_timeout,
                    )
                    .await?;
                    return Ok(ServeDisposition::Close);
                }
            };

            let ttl = response_ttl(&response_headers, self.default_ttl);
            let entry = CacheEntry::new(
                parts.status,
                response_headers.clone(),
                collected.clone(),
                ttl,
            );
            debug!(%url, size = collected.len(), ttl_secs = ttl.as_secs(), "caching response");
            self.cache.set(key, entry);

            let head = frame_buffered_head(parts.status, &response_headers, collected.len());
            write_all_timed(sink, &head, self.write_timeout).await?;
            write_all_timed(sink, &collected, self.write_timeout).await?;
            sink.flush().await?;
            return Ok(ServeDisposition::KeepAlive);
        }

        // Pass-through: stream the body via a pooled buffer. Without a
        // Content-Length the response is close-delimited.
        let has_length = response_headers.contains_key(CONTENT_LENGTH);
        let head = frame_streamed_head(parts.status, &response_headers, has_length);
        write_all_timed(sink, &head, self.write_timeout).await?;
        self.pool.copy_body(body, sink, self.write_timeout).await?;

        if has_length {
            Ok(ServeDisposition::KeepAlive)
        } else {
            Ok(ServeDisposition::Close)
        }
    }
}

fn build_outbound_request(request: &ClientRequest) -> io::Result<Request<Full<Bytes>>> {
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);

    let authority = request
        .uri
        .authority()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request URI has no authority"))?;
    let host = HeaderValue::from_str(authority.as_str())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "authority is not a valid Host"))?;
    headers.insert(HOST, host);

    let mut outbound = Request::builder()
        .method(request.method.clone())
        .uri(request.uri.clone())
        .body(Full::new(request.body.clone()))
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error.to_string()))?;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// Removes the static hop-by-hop set and anything the Connection header
/// nominated on top.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    for name in nominated {
        headers.remove(name.as_str());
    }
}

fn frame_buffered_head(status: StatusCode, headers: &HeaderMap, body_len: usize) -> Vec<u8> {
    let mut head = frame_status_and_headers(status, headers, true);
    head.extend_from_slice(b"X-Cache: MISS\r\n");
    head.extend_from_slice(format!("Content-Length: {body_len}\r\n\r\n").as_bytes());
    head
}

fn frame_streamed_head(status: StatusCode, headers: &HeaderMap, has_length: bool) -> Vec<u8> {
    let mut head = frame_status_and_headers(status, headers, false);
    head.extend_from_slice(b"X-Cache: MISS\r\n");
    if !has_length {
        head.extend_from_slice(b"Connection: close\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn frame_status_and_headers(
    status: StatusCode,
    headers: &HeaderMap,
    skip_content_length: bool,
) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers {
        if skip_content_length && name == &CONTENT_LENGTH {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head
}

pub async fn write_simple_response<W>(
    sink: &mut W,
    status_line: &str,
    body: &str,
    timeout: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status_line}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    write_all_timed(sink, response.as_bytes(), timeout).await?;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TE, UPGRADE};
    use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};

    use super::{build_outbound_request, frame_streamed_head, strip_hop_by_hop, ClientRequest};

    #[test]
    fn hop_by_hop_set_is_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authenticate", HeaderValue::from_static("Basic"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic xyz"));
        headers.insert(TE, HeaderValue::from_static("trailers"));
        headers.insert("trailer", HeaderValue::from_static("Expires"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert("accept", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn connection_nominated_headers_are_stripped_too() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONNECTION,
            HeaderValue::from_static("close, x-session-token"),
        );
        headers.insert("x-session-token", HeaderValue::from_static("abc"));
        headers.insert("x-request-id", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("x-session-token"));
        assert!(headers.contains_key("x-request-id"));
    }

    #[test]
    fn outbound_request_carries_host_and_clean_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("accept", HeaderValue::from_static("text/plain"));

        let request = ClientRequest {
            method: Method::GET,
            uri: "http://origin.test:8080/path".parse::<Uri>().expect("uri"),
            headers,
            body: Bytes::new(),
        };

        let outbound = build_outbound_request(&request).expect("build outbound");
        assert_eq!(outbound.uri(), &request.uri);
        assert_eq!(outbound.headers().get(HOST).unwrap(), "origin.test:8080");
        assert!(!outbound.headers().contains_key(CONNECTION));
        assert!(outbound.headers().contains_key("accept"));
    }

    #[test]
    fn streamed_head_marks_close_when_unframed() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let head = frame_streamed_head(StatusCode::OK, &headers, false);
        let text = String::from_utf8(head).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("X-Cache: MISS\r\n"), "{text}");
        assert!(text.contains("Connection: close\r\n"), "{text}");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4"));
        let head = frame_streamed_head(StatusCode::OK, &headers, true);
        let text = String::from_utf8(head).expect("utf8");
        assert!(!text.contains("Connection: close"), "{text}");
        assert!(text.contains("Content-Length: 4\r\n"), "{text}");
    }
}
