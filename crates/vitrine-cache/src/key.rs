use std::fmt::Write as _;

use http::header::{ACCEPT, ACCEPT_ENCODING};
use http::{HeaderMap, Method};
use sha2::{Digest, Sha256};

/// Derives the cache key for a request: SHA-256 hex over the method, the
/// effective URL, and the content-negotiation headers that shape the
/// response. Header components are appended only when present, so
/// requests without them hash the shorter canonical string.
pub fn cache_key(method: &Method, url: &str, headers: &HeaderMap) -> String {
    let mut canonical = String::with_capacity(url.len() + 64);
    canonical.push_str(method.as_str());
    canonical.push(':');
    canonical.push_str(url);

    for name in [ACCEPT, ACCEPT_ENCODING] {
        if let Some(value) = headers.get(&name).and_then(|value| value.to_str().ok()) {
            if !value.is_empty() {
                canonical.push(':');
                canonical.push_str(value);
            }
        }
    }

    let digest = Sha256::digest(canonical.as_bytes());
    let mut rendered = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(rendered, "{byte:02x}");
    }
    rendered
}

#[cfg(test)]
mod tests {
    use http::header::{ACCEPT, ACCEPT_ENCODING, USER_AGENT};
    use http::{HeaderMap, HeaderValue, Method};

    use super::cache_key;

    #[test]
    fn key_is_stable_for_identical_requests() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        let first = cache_key(&Method::GET, "http://origin.test/a", &headers);
        let second = cache_key(&Method::GET, "http://origin.test/a", &headers);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_varies_on_method_url_and_negotiation_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html"));

        let base = cache_key(&Method::GET, "http://origin.test/a", &headers);
        assert_ne!(
            base,
            cache_key(&Method::POST, "http://origin.test/a", &headers)
        );
        assert_ne!(
            base,
            cache_key(&Method::GET, "http://origin.test/b", &headers)
        );

        let mut other = HeaderMap::new();
        other.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert_ne!(base, cache_key(&Method::GET, "http://origin.test/a", &other));
    }

    #[test]
    fn key_ignores_unrelated_headers() {
        let bare = cache_key(&Method::GET, "http://origin.test/a", &HeaderMap::new());

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        assert_eq!(bare, cache_key(&Method::GET, "http://origin.test/a", &headers));
    }
}
