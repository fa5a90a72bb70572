use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::Uri;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::sync::Semaphore;

use crate::config::TransportConfig;
use crate::errors::ProxyError;

/// The one shared upstream client. Connection pooling and HTTP/2
/// negotiation live inside hyper; this wrapper adds the per-host
/// concurrency cap and the request deadline.
pub struct OutboundTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    per_host: DashMap<String, Arc<Semaphore>>,
    config: TransportConfig,
}

impl OutboundTransport {
    pub fn new(config: TransportConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connect_timeout));
        http.set_keepalive(Some(config.tcp_keepalive));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(build_upstream_tls_config(config.verify_upstream_tls))
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .build(https);

        Self {
            client,
            per_host: DashMap::new(),
            config,
        }
    }

    pub async fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let permits = self.host_permits(request.uri());
        let deadline = self.config.request_timeout;

        let exchange = async {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| ProxyError::Upstream("connection pool closed".to_string()))?;
            self.client
                .request(request)
                .await
                .map_err(|error| ProxyError::Upstream(render_client_error(&error)))
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::UpstreamTimeout(deadline)),
        }
    }

    fn host_permits(&self, uri: &Uri) -> Arc<Semaphore> {
        let key = host_key(uri);
        self.per_host
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_conns_per_host)))
            .clone()
    }
}

fn host_key(uri: &Uri) -> String {
    let host = uri.host().unwrap_or("");
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        }
    });
    format!("{host}:{port}")
}

fn render_client_error(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        source = inner.source();
    }
    rendered
}

fn build_upstream_tls_config(verify_upstream_tls: bool) -> ClientConfig {
    if verify_upstream_tls {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    }
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
