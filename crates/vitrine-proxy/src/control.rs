use std::io;
use std::time::Duration;

use http::Method;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;
use vitrine_ca::CertificateAuthority;
use vitrine_cache::HttpCache;

use crate::bufpool::write_all_timed;

pub const SERVICE_NAME: &str = "vitrine";

/// Reserved routes served by the proxy itself. Only origin-form targets
/// reach these; absolute-form requests always forward, so an origin that
/// happens to expose `/stats` stays reachable through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRoute {
    CaCert,
    Stats,
    Health,
    Index,
}

pub fn match_control_route(method: &Method, target: &str) -> Option<ControlRoute> {
    if method != Method::GET {
        return None;
    }
    let path = target.split('?').next().unwrap_or(target);
    match path {
        "/ca.crt" => Some(ControlRoute::CaCert),
        "/stats" => Some(ControlRoute::Stats),
        "/health" => Some(ControlRoute::Health),
        "/" => Some(ControlRoute::Index),
        _ => None,
    }
}

#[derive(Serialize)]
struct StatsPayload {
    cache_hits: u64,
    cache_misses: u64,
    cache_size_bytes: u64,
    cache_entries: usize,
    hit_rate: f64,
}

pub async fn respond<W>(
    route: ControlRoute,
    ca: &CertificateAuthority,
    cache: &HttpCache,
    listen_port: u16,
    sink: &mut W,
    write_timeout: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match route {
        ControlRoute::CaCert => {
            debug!("serving root certificate download");
            let extra = format!(
                "Content-Disposition: attachment; filename=\"{SERVICE_NAME}-ca.crt\"\r\n"
            );
            write_response(
                sink,
                "application/x-x509-ca-cert",
                &extra,
                ca.root_pem(),
                write_timeout,
            )
            .await
        }
        ControlRoute::Stats => {
            let stats = cache.stats();
            let payload = StatsPayload {
                cache_hits: stats.hits,
                cache_misses: stats.misses,
                cache_size_bytes: stats.size_bytes,
                cache_entries: stats.entry_count,
                hit_rate: (cache.hit_rate() * 100.0).round() / 100.0,
            };
            let body = serde_json::to_vec(&payload).map_err(io::Error::other)?;
            write_response(sink, "application/json", "", &body, write_timeout).await
        }
        ControlRoute::Health => {
            let body = serde_json::json!({ "status": "ok", "service": SERVICE_NAME });
            let body = serde_json::to_vec(&body).map_err(io::Error::other)?;
            write_response(sink, "application/json", "", &body, write_timeout).await
        }
        ControlRoute::Index => {
            let body = index_page(listen_port);
            write_response(
                sink,
                "text/html; charset=utf-8",
                "",
                body.as_bytes(),
                write_timeout,
            )
            .await
        }
    }
}

async fn write_response<W>(
    sink: &mut W,
    content_type: &str,
    extra_headers: &str,
    body: &[u8],
    write_timeout: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\n{extra_headers}Content-Length: {}\r\n\r\n",
        body.len()
    );
    write_all_timed(sink, head.as_bytes(), write_timeout).await?;
    write_all_timed(sink, body, write_timeout).await?;
    sink.flush().await
}

fn index_page(port: u16) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{SERVICE_NAME} proxy</title></head>
<body>
<h1>{SERVICE_NAME} caching MITM proxy</h1>
<p>Running on port {port}.</p>
<ul>
<li><a href="/ca.crt">Download the CA certificate</a></li>
<li><a href="/stats">Cache statistics (JSON)</a></li>
<li><a href="/health">Health check (JSON)</a></li>
</ul>
<pre>export HTTP_PROXY=http://localhost:{port}
export HTTPS_PROXY=http://localhost:{port}

curl http://localhost:{port}/ca.crt -o {SERVICE_NAME}-ca.crt
# install the certificate in your trust store before proxying HTTPS</pre>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::{match_control_route, ControlRoute};

    #[test]
    fn reserved_paths_match_for_get_only() {
        assert_eq!(
            match_control_route(&Method::GET, "/ca.crt"),
            Some(ControlRoute::CaCert)
        );
        assert_eq!(
            match_control_route(&Method::GET, "/stats"),
            Some(ControlRoute::Stats)
        );
        assert_eq!(
            match_control_route(&Method::GET, "/health"),
            Some(ControlRoute::Health)
        );
        assert_eq!(
            match_control_route(&Method::GET, "/"),
            Some(ControlRoute::Index)
        );
        assert_eq!(
            match_control_route(&Method::GET, "/stats?verbose=1"),
            Some(ControlRoute::Stats)
        );

        assert_eq!(match_control_route(&Method::POST, "/stats"), None);
        assert_eq!(match_control_route(&Method::GET, "/other"), None);
    }

    #[test]
    fn absolute_form_targets_never_match() {
        assert_eq!(
            match_control_route(&Method::GET, "http://origin.test/stats"),
            None
        );
    }
}
