use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("certificate authority setup failed: {0}")]
    Ca(#[from] vitrine_ca::CaError),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream request timed out after {0:?}")]
    UpstreamTimeout(Duration),
}
