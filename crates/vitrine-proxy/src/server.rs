use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use vitrine_ca::CertificateAuthority;
use vitrine_cache::{HttpCache, SWEEP_INTERVAL};

use crate::bufpool::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::config::{ProxyConfig, ServerTimeouts};
use crate::errors::ProxyError;
use crate::forward;
use crate::head::{is_connect_head, parse_connect_target, parse_request_head, read_head_bytewise};
use crate::intercept;
use crate::pipeline::{write_simple_response, RequestPipeline};
use crate::transport::OutboundTransport;

/// Everything a connection task needs, cloned per accept.
#[derive(Clone)]
pub struct ConnectionContext {
    pub pipeline: Arc<RequestPipeline>,
    pub ca: Arc<CertificateAuthority>,
    pub cache: Arc<HttpCache>,
    pub timeouts: ServerTimeouts,
    pub max_request_body_bytes: usize,
    pub listen_port: u16,
}

pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    cache: Arc<HttpCache>,
    pipeline: Arc<RequestPipeline>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;

        let ca = Arc::new(CertificateAuthority::new(config.ca.clone())?);
        let cache = Arc::new(HttpCache::new(config.cache.max_size_bytes));
        let transport = Arc::new(OutboundTransport::new(config.transport.clone()));
        let pool = Arc::new(BufferPool::new(DEFAULT_BUFFER_SIZE));
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&cache),
            transport,
            pool,
            config.cache.default_ttl,
            config.timeouts.write,
        ));

        Ok(Self {
            config,
            ca,
            cache,
            pipeline,
        })
    }

    pub fn ca(&self) -> Arc<CertificateAuthority> {
        Arc::clone(&self.ca)
    }

    pub fn cache(&self) -> Arc<HttpCache> {
        Arc::clone(&self.cache)
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!("{}:{}", self.config.listen_addr, self.config.listen_port);
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, cache_enabled = self.cache.enabled(), "proxy listening");

        if self.cache.enabled() {
            self.cache.spawn_sweeper(SWEEP_INTERVAL);
        }

        let context = ConnectionContext {
            pipeline: Arc::clone(&self.pipeline),
            ca: Arc::clone(&self.ca),
            cache: Arc::clone(&self.cache),
            timeouts: self.config.timeouts,
            max_request_body_bytes: self.config.body.max_request_body_bytes,
            listen_port: local_addr.port(),
        };

        loop {
            let (stream, client_addr) = listener.accept().await?;
            let context = context.clone();
            tokio::spawn(async move {
                if let Err(error) = handle_connection(context, stream).await {
                    debug!(%client_addr, %error, "connection handling failed");
                }
            });
        }
    }
}

async fn handle_connection(ctx: ConnectionContext, mut stream: TcpStream) -> io::Result<()> {
    let timeouts = ctx.timeouts;

    // The first head is read byte by byte so a CONNECT leaves the socket
    // positioned exactly at the client's TLS ClientHello.
    let head_bytes = match tokio::time::timeout(
        timeouts.read_header,
        read_head_bytewise(&mut stream, timeouts.max_header_bytes),
    )
    .await
    {
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(error)) if error.kind() == io::ErrorKind::InvalidData => {
            write_simple_response(
                &mut stream,
                "431 Request Header Fields Too Large",
                "request header exceeded the configured limit",
                timeouts.write,
            )
            .await?;
            return Ok(());
        }
        Ok(Err(error)) => return Err(error),
        Err(_) => {
            debug!("request header read timed out");
            return Ok(());
        }
    };

    if is_connect_head(&head_bytes) {
        let head = match parse_request_head(&head_bytes) {
            Ok(head) => head,
            Err(error) => {
                debug!(%error, "malformed CONNECT request");
                write_simple_response(
                    &mut stream,
                    "400 Bad Request",
                    "invalid CONNECT request",
                    timeouts.write,
                )
                .await?;
                return Ok(());
            }
        };
        let target = match parse_connect_target(&head.target) {
            Ok(target) => target,
            Err(error) => {
                debug!(%error, "invalid CONNECT authority");
                write_simple_response(
                    &mut stream,
                    "400 Bad Request",
                    "invalid CONNECT authority",
                    timeouts.write,
                )
                .await?;
                return Ok(());
            }
        };
        debug!(host = %target.host, port = target.port, "intercepting CONNECT tunnel");
        return intercept::handle_connect(&ctx, stream, target).await;
    }

    forward::handle_forward(&ctx, stream, head_bytes).await
}
