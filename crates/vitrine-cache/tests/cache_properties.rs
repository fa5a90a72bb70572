use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{AUTHORIZATION, CACHE_CONTROL};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use proptest::prelude::*;

use vitrine_cache::{is_cacheable, response_ttl, CacheEntry, HttpCache};

fn arbitrary_method() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::GET),
        Just(Method::POST),
        Just(Method::PUT),
        Just(Method::DELETE),
        Just(Method::HEAD),
        Just(Method::PATCH),
    ]
}

fn arbitrary_cache_control() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("public".to_string())),
        Just(Some("no-store".to_string())),
        Just(Some("no-cache".to_string())),
        Just(Some("private".to_string())),
        (0_u64..100_000).prop_map(|age| Some(format!("max-age={age}"))),
        (0_u64..100_000).prop_map(|age| Some(format!("public, max-age={age}"))),
    ]
}

proptest! {
    // The store never holds more bytes than its budget, whatever the
    // insertion sequence looks like.
    #[test]
    fn cache_size_never_exceeds_budget(
        max_size in 1_u64..512,
        inserts in prop::collection::vec((0_usize..32, 0_usize..96), 1..64),
    ) {
        let cache = HttpCache::new(max_size);
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        for (tick, (key_index, body_len)) in inserts.into_iter().enumerate() {
            let entry = CacheEntry::with_validity(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from(vec![b'x'; body_len]),
                base + Duration::from_secs(tick as u64),
                base + Duration::from_secs(tick as u64 + 3_600),
            );
            cache.set(format!("key-{key_index}"), entry);
            prop_assert!(cache.stats().size_bytes <= max_size);
        }
    }

    // The admission predicate accepts exactly the unauthenticated
    // successful GETs whose Cache-Control does not opt out.
    #[test]
    fn cacheability_matches_the_predicate_definition(
        method in arbitrary_method(),
        status in 100_u16..600,
        cache_control in arbitrary_cache_control(),
        authorized in any::<bool>(),
    ) {
        let status = StatusCode::from_u16(status).expect("valid status");

        let mut request_headers = HeaderMap::new();
        if authorized {
            request_headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        }

        let mut response_headers = HeaderMap::new();
        if let Some(value) = &cache_control {
            response_headers.insert(
                CACHE_CONTROL,
                HeaderValue::from_str(value).expect("header value"),
            );
        }

        let opted_out = cache_control
            .as_deref()
            .map(|value| {
                value.contains("no-store") || value.contains("no-cache") || value.contains("private")
            })
            .unwrap_or(false);
        let expected = method == Method::GET
            && status.as_u16() >= 200
            && status.as_u16() < 300
            && !opted_out
            && !authorized;

        prop_assert_eq!(
            is_cacheable(&method, &request_headers, status, &response_headers),
            expected
        );
    }

    // The TTL derived from a Cache-Control header equals the stored
    // entry's expires_at - cached_at.
    #[test]
    fn stored_validity_window_equals_derived_ttl(
        max_age in prop::option::of(0_u64..1_000_000),
        default_secs in 1_u64..10_000,
    ) {
        let default_ttl = Duration::from_secs(default_secs);

        let mut response_headers = HeaderMap::new();
        if let Some(age) = max_age {
            response_headers.insert(
                CACHE_CONTROL,
                HeaderValue::from_str(&format!("max-age={age}")).expect("header value"),
            );
        }

        let ttl = response_ttl(&response_headers, default_ttl);
        prop_assert_eq!(ttl, max_age.map(Duration::from_secs).unwrap_or(default_ttl));

        let entry = CacheEntry::new(
            StatusCode::OK,
            response_headers,
            Bytes::from_static(b"body"),
            ttl,
        );
        let window = entry
            .expires_at
            .duration_since(entry.cached_at)
            .expect("expires_at is not before cached_at");
        prop_assert_eq!(window, ttl);
    }
}
