use std::time::Duration;

use http::header::{AUTHORIZATION, CACHE_CONTROL};
use http::{HeaderMap, Method, StatusCode};

/// Insertion-time admission check. A response may enter the cache only
/// for an unauthenticated GET that succeeded and whose Cache-Control
/// does not opt out of shared caching.
pub fn is_cacheable(
    method: &Method,
    request_headers: &HeaderMap,
    status: StatusCode,
    response_headers: &HeaderMap,
) -> bool {
    if method != Method::GET {
        return false;
    }
    if !status.is_success() {
        return false;
    }

    if let Some(cache_control) = header_str(response_headers, &CACHE_CONTROL) {
        if cache_control.contains("no-store")
            || cache_control.contains("no-cache")
            || cache_control.contains("private")
        {
            return false;
        }
    }

    if request_headers.contains_key(AUTHORIZATION) {
        return false;
    }

    true
}

/// TTL for a response: `max-age` when Cache-Control carries one,
/// otherwise the configured default.
pub fn response_ttl(response_headers: &HeaderMap, default_ttl: Duration) -> Duration {
    let Some(cache_control) = header_str(response_headers, &CACHE_CONTROL) else {
        return default_ttl;
    };

    for directive in cache_control.split(',') {
        let directive = directive.trim();
        if let Some(value) = directive.strip_prefix("max-age=") {
            if let Ok(seconds) = value.parse::<u64>() {
                return Duration::from_secs(seconds);
            }
        }
    }

    default_ttl
}

fn header_str<'a>(headers: &'a HeaderMap, name: &http::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::header::{AUTHORIZATION, CACHE_CONTROL};
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::{is_cacheable, response_ttl};

    fn response_with_cache_control(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn plain_get_success_is_cacheable() {
        assert!(is_cacheable(
            &Method::GET,
            &HeaderMap::new(),
            StatusCode::OK,
            &HeaderMap::new(),
        ));
    }

    #[test]
    fn non_get_methods_are_never_cacheable() {
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            assert!(!is_cacheable(
                &method,
                &HeaderMap::new(),
                StatusCode::OK,
                &HeaderMap::new(),
            ));
        }
    }

    #[test]
    fn only_2xx_statuses_are_cacheable() {
        for status in [
            StatusCode::MOVED_PERMANENTLY,
            StatusCode::NOT_MODIFIED,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert!(!is_cacheable(
                &Method::GET,
                &HeaderMap::new(),
                status,
                &HeaderMap::new(),
            ));
        }
        assert!(is_cacheable(
            &Method::GET,
            &HeaderMap::new(),
            StatusCode::NO_CONTENT,
            &HeaderMap::new(),
        ));
    }

    #[test]
    fn cache_control_opt_outs_suppress_caching() {
        for value in ["no-store", "no-cache", "private", "private, max-age=60"] {
            let mut headers = HeaderMap::new();
            headers.insert(CACHE_CONTROL, HeaderValue::from_str(value).expect("header"));
            assert!(
                !is_cacheable(&Method::GET, &HeaderMap::new(), StatusCode::OK, &headers),
                "{value} must suppress caching"
            );
        }
    }

    #[test]
    fn authorization_header_suppresses_caching() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        assert!(!is_cacheable(
            &Method::GET,
            &request_headers,
            StatusCode::OK,
            &HeaderMap::new(),
        ));
    }

    #[test]
    fn max_age_wins_over_the_default_ttl() {
        let default_ttl = Duration::from_secs(300);
        assert_eq!(
            response_ttl(&response_with_cache_control("max-age=60"), default_ttl),
            Duration::from_secs(60)
        );
        assert_eq!(
            response_ttl(
                &response_with_cache_control("public, max-age=7200"),
                default_ttl
            ),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn default_ttl_applies_without_usable_max_age() {
        let default_ttl = Duration::from_secs(300);
        assert_eq!(response_ttl(&HeaderMap::new(), default_ttl), default_ttl);
        assert_eq!(
            response_ttl(&response_with_cache_control("public"), default_ttl),
            default_ttl
        );
        assert_eq!(
            response_ttl(
                &response_with_cache_control("max-age=not-a-number"),
                default_ttl
            ),
            default_ttl
        );
    }
}
