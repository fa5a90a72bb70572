use std::io;

use http::Uri;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::bufpool::write_all_timed;
use crate::head::{
    parse_request_head, read_request_body, read_until_pattern, BufferedConn, ConnectTarget,
};
use crate::pipeline::{write_simple_response, ClientRequest, ServeDisposition};
use crate::server::ConnectionContext;

/// CONNECT path: the proxy becomes the TLS server on the hijacked
/// socket, then serves requests read from inside the tunnel through the
/// shared pipeline. The tunnel stays open across requests until the
/// client asks to close or framing forces it.
pub async fn handle_connect(
    ctx: &ConnectionContext,
    mut stream: TcpStream,
    target: ConnectTarget,
) -> io::Result<()> {
    let timeouts = ctx.timeouts;
    write_all_timed(
        &mut stream,
        b"HTTP/1.1 200 Connection Established\r\n\r\n",
        timeouts.write,
    )
    .await?;

    // After the 200 every failure on this socket is silent: the client
    // only ever observes a TLS failure, never proxy error text.
    let identity = match ctx.ca.get_or_mint(&target.host) {
        Ok(identity) => identity,
        Err(error) => {
            debug!(host = %target.host, %error, "leaf issuance failed, closing tunnel");
            return Ok(());
        }
    };

    let acceptor = TlsAcceptor::from(identity.server_config);
    let accepted = tokio::time::timeout(timeouts.read_header, acceptor.accept(stream)).await;
    let tls = match accepted {
        Ok(Ok(tls)) => tls,
        Ok(Err(error)) => {
            debug!(host = %target.host, %error, "downstream TLS handshake failed");
            return Ok(());
        }
        Err(_) => {
            debug!(host = %target.host, "downstream TLS handshake timed out");
            return Ok(());
        }
    };

    let authority = connect_authority(&target);
    let mut conn = BufferedConn::new(tls);
    let mut first = true;

    loop {
        let head_timeout = if first {
            timeouts.read_header
        } else {
            timeouts.idle
        };
        first = false;

        let head_bytes = match tokio::time::timeout(
            head_timeout,
            read_until_pattern(&mut conn, b"\r\n\r\n", timeouts.max_header_bytes),
        )
        .await
        {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => break,
            Ok(Err(error)) => {
                debug!(host = %target.host, %error, "tunnel request read failed");
                break;
            }
            Err(_) => break,
        };

        let head = match parse_request_head(&head_bytes) {
            Ok(head) => head,
            Err(error) => {
                debug!(host = %target.host, %error, "malformed tunneled request");
                write_simple_response(
                    &mut conn.stream,
                    "400 Bad Request",
                    "malformed HTTP request",
                    timeouts.write,
                )
                .await?;
                break;
            }
        };

        let uri = match rewrite_tunneled_target(&head.target, &authority) {
            Ok(uri) => uri,
            Err(error) => {
                debug!(host = %target.host, %error, "tunneled request target rejected");
                write_simple_response(
                    &mut conn.stream,
                    "400 Bad Request",
                    "invalid request target",
                    timeouts.write,
                )
                .await?;
                break;
            }
        };

        let body = match tokio::time::timeout(
            timeouts.read_body,
            read_request_body(&mut conn, head.body_mode, ctx.max_request_body_bytes),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(error)) => {
                debug!(host = %target.host, %error, "tunneled request body read failed");
                break;
            }
            Err(_) => break,
        };

        let request = ClientRequest {
            method: head.method,
            uri,
            headers: head.headers,
            body,
        };
        let disposition = ctx.pipeline.serve(request, &mut conn.stream, true).await?;
        if disposition == ServeDisposition::Close || head.connection_close {
            break;
        }
    }

    let _ = conn.stream.shutdown().await;
    Ok(())
}

fn connect_authority(target: &ConnectTarget) -> String {
    if target.host.contains(':') {
        format!("[{}]:{}", target.host, target.port)
    } else {
        format!("{}:{}", target.host, target.port)
    }
}

/// Requests inside the tunnel arrive in origin form (or occasionally in
/// absolute form); either way the effective URL is https against the
/// CONNECT authority.
fn rewrite_tunneled_target(target: &str, authority: &str) -> io::Result<Uri> {
    let rewritten = if target.starts_with('/') {
        format!("https://{authority}{target}")
    } else {
        let original: Uri = target
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparseable target"))?;
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("https://{authority}{path_and_query}")
    };

    rewritten
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparseable effective URL"))
}

#[cfg(test)]
mod tests {
    use super::{connect_authority, rewrite_tunneled_target};
    use crate::head::ConnectTarget;

    #[test]
    fn origin_form_targets_gain_scheme_and_authority() {
        let uri = rewrite_tunneled_target("/index.html?x=1", "example.test:443").expect("rewrite");
        assert_eq!(uri.to_string(), "https://example.test:443/index.html?x=1");
    }

    #[test]
    fn absolute_form_targets_are_rebased_onto_the_tunnel() {
        let uri =
            rewrite_tunneled_target("http://other.test/path", "example.test:443").expect("rewrite");
        assert_eq!(uri.to_string(), "https://example.test:443/path");
    }

    #[test]
    fn ipv6_connect_hosts_are_bracketed() {
        let target = ConnectTarget {
            host: "2001:db8::1".to_string(),
            port: 8443,
        };
        assert_eq!(connect_authority(&target), "[2001:db8::1]:8443");

        let target = ConnectTarget {
            host: "example.test".to_string(),
            port: 443,
        };
        assert_eq!(connect_authority(&target), "example.test:443");
    }
}
