use std::io;

use http::Uri;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::control;
use crate::head::{
    parse_request_head, read_request_body, read_until_pattern, BufferedConn, RequestHead,
};
use crate::pipeline::{write_simple_response, ClientRequest, ServeDisposition};
use crate::server::ConnectionContext;

/// Non-CONNECT connections: a keep-alive loop serving control routes
/// (origin form) and absolute-form forwarding through the pipeline.
pub async fn handle_forward(
    ctx: &ConnectionContext,
    stream: TcpStream,
    first_head: Vec<u8>,
) -> io::Result<()> {
    let timeouts = ctx.timeouts;
    let mut conn = BufferedConn::new(stream);
    let mut head_bytes = first_head;

    loop {
        let head = match parse_request_head(&head_bytes) {
            Ok(head) => head,
            Err(error) => {
                debug!(%error, "malformed proxy request");
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

        let close_requested = head.connection_close;
        let disposition = serve_one(ctx, &mut conn, head).await?;
        if disposition == ServeDisposition::Close || close_requested {
            break;
        }

        head_bytes = match tokio::time::timeout(
            timeouts.idle,
            read_until_pattern(&mut conn, b"\r\n\r\n", timeouts.max_header_bytes),
        )
        .await
        {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => break,
            Ok(Err(error)) => {
                debug!(%error, "keep-alive request read failed");
                break;
            }
            Err(_) => break,
        };
    }

    let _ = conn.stream.shutdown().await;
    Ok(())
}

async fn serve_one(
    ctx: &ConnectionContext,
    conn: &mut BufferedConn<TcpStream>,
    head: RequestHead,
) -> io::Result<ServeDisposition> {
    let timeouts = ctx.timeouts;

    if let Some(route) = control::match_control_route(&head.method, &head.target) {
        // Keep the connection framed even if the client sent a body.
        let _ = read_request_body(conn, head.body_mode, ctx.max_request_body_bytes).await?;
        control::respond(
            route,
            &ctx.ca,
            &ctx.cache,
            ctx.listen_port,
            &mut conn.stream,
            timeouts.write,
        )
        .await?;
        return Ok(ServeDisposition::KeepAlive);
    }

    let uri = match parse_absolute_target(&head.target) {
        Ok(uri) => uri,
        Err(error) => {
            debug!(target = %head.target, %error, "rejecting non-absolute proxy target");
            write_simple_response(
                &mut conn.stream,
                "400 Bad Request",
                "proxy requests must use an absolute URI",
                timeouts.write,
            )
            .await?;
            return Ok(ServeDisposition::Close);
        }
    };

    let body = match tokio::time::timeout(
        timeouts.read_body,
        read_request_body(conn, head.body_mode, ctx.max_request_body_bytes),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(error)) => {
            debug!(%error, "request body read failed");
            write_simple_response(
                &mut conn.stream,
                "400 Bad Request",
                "unreadable request body",
                timeouts.write,
            )
            .await?;
            return Ok(ServeDisposition::Close);
        }
        Err(_) => {
            debug!("request body read timed out");
            return Ok(ServeDisposition::Close);
        }
    };

    let request = ClientRequest {
        method: head.method,
        uri,
        headers: head.headers,
        body,
    };
    ctx.pipeline.serve(request, &mut conn.stream, false).await
}

fn parse_absolute_target(target: &str) -> io::Result<Uri> {
    let uri: Uri = target
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparseable request URI"))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "absolute-form URI with authority required",
        ));
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::parse_absolute_target;

    #[test]
    fn absolute_targets_parse() {
        let uri = parse_absolute_target("http://origin.test:8080/path?q=1").expect("parse");
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.authority().map(|a| a.as_str()), Some("origin.test:8080"));
    }

    #[test]
    fn origin_form_and_garbage_targets_are_rejected() {
        assert!(parse_absolute_target("/path").is_err());
        assert!(parse_absolute_target("origin.test/path").is_err());
        assert!(parse_absolute_target("not a uri").is_err());
    }
}
