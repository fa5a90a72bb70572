use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, StatusCode};

/// One cached response. Immutable after insertion; replacing a key means
/// delete + insert of a fresh entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cached_at: SystemTime,
    pub expires_at: SystemTime,
    pub size: u64,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, ttl: Duration) -> Self {
        let cached_at = SystemTime::now();
        Self::with_validity(status, headers, body, cached_at, cached_at + ttl)
    }

    pub fn with_validity(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        cached_at: SystemTime,
        expires_at: SystemTime,
    ) -> Self {
        let size = body.len() as u64;
        Self {
            status,
            headers,
            body,
            cached_at,
            expires_at,
            size,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at < now
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.cached_at)
            .unwrap_or(Duration::ZERO)
    }

    /// Frames the entry as a served cache hit: stored status line and
    /// headers verbatim, `X-Cache: HIT`, the entry age, and a
    /// `Content-Length` recomputed from the stored body.
    pub fn to_http1_response(&self, now: SystemTime) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            if name == &CONTENT_LENGTH {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"X-Cache: HIT\r\n");
        out.extend_from_slice(format!("X-Cache-Age: {}\r\n", self.age(now).as_secs()).as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}
