use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const ROOT_VALIDITY_BACKDATE: Duration = Duration::hours(1);
const ROOT_VALIDITY: Duration = Duration::days(10 * 365);
const LEAF_VALIDITY_BACKDATE: Duration = Duration::hours(1);
const LEAF_VALIDITY: Duration = Duration::days(365);

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS identity build failed: {0}")]
    IdentityBuild(#[from] rustls::Error),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
    #[error("invalid certificate authority configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub common_name: String,
    pub organization: String,
    pub leaf_cache_capacity: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: "vitrine Local CA".to_string(),
            organization: "vitrine".to_string(),
            leaf_cache_capacity: 1024,
        }
    }
}

impl CaConfig {
    fn validate(&self) -> Result<(), CaError> {
        if self.common_name.trim().is_empty() {
            return Err(CaError::InvalidConfiguration(
                "common_name must not be empty".to_string(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(CaError::InvalidConfiguration(
                "organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A ready-to-serve identity for one hostname: the rustls server config
/// carrying the [leaf, root] chain plus the leaf material for callers
/// that need to inspect it.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub server_config: Arc<ServerConfig>,
    pub leaf_cert_der: CertificateDer<'static>,
    pub leaf_cert_pem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

struct RootMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: Vec<u8>,
    cert_der: CertificateDer<'static>,
}

#[derive(Default)]
struct LeafStore {
    identities: HashMap<String, TlsIdentity>,
    insertion_order: VecDeque<String>,
}

/// Process-wide certificate authority. The root material is created once
/// and never mutated; the private key stays inside this struct and is
/// never serialized. Leaf identities are minted lazily per hostname with
/// single-flight semantics.
pub struct CertificateAuthority {
    config: CaConfig,
    root: RootMaterial,
    leaves: RwLock<LeafStore>,
    next_serial: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl CertificateAuthority {
    pub fn new(config: CaConfig) -> Result<Self, CaError> {
        config.validate()?;
        let root = generate_root_material(&config)?;
        Ok(Self {
            config,
            root,
            leaves: RwLock::new(LeafStore::default()),
            next_serial: AtomicU64::new(initial_serial()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        })
    }

    /// Returns the identity for `hostname`, minting it on first use.
    ///
    /// Single-flight: a shared read covers the fast path; on miss the
    /// writer lock is taken, the store re-checked, and the signing
    /// performed while holding the lock, so for any hostname exactly one
    /// signing happens for the process lifetime and every caller
    /// observes the same published identity.
    pub fn get_or_mint(&self, hostname: &str) -> Result<TlsIdentity, CaError> {
        let host = normalize_host(hostname);

        {
            let store = self.leaves.read().map_err(|_| CaError::LockPoisoned)?;
            if let Some(identity) = store.identities.get(&host) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(identity.clone());
            }
        }

        let mut store = self.leaves.write().map_err(|_| CaError::LockPoisoned)?;
        if let Some(identity) = store.identities.get(&host) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(identity.clone());
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let identity = self.issue_leaf(&host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        if self.config.leaf_cache_capacity > 0 {
            while store.identities.len() >= self.config.leaf_cache_capacity {
                let Some(oldest) = store.insertion_order.pop_front() else {
                    break;
                };
                store.identities.remove(&oldest);
            }
            store.identities.insert(host.clone(), identity.clone());
            store.insertion_order.push_back(host);
        }

        Ok(identity)
    }

    /// PEM encoding of the root certificate only. The root private key
    /// has no accessor.
    pub fn root_pem(&self) -> &[u8] {
        &self.root.cert_pem
    }

    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root.cert_der
    }

    pub fn cache_size(&self) -> usize {
        self.leaves
            .read()
            .map(|store| store.identities.len())
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> CaMetrics {
        CaMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }

    fn issue_leaf(&self, host: &str) -> Result<TlsIdentity, CaError> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let params = build_leaf_params(host, serial)?;
        let leaf_key = generate_key_pair()?;
        let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let leaf_cert = params.signed_by(&leaf_key, &self.root.issuer)?;
        let leaf_cert_der = leaf_cert.der().clone();
        let leaf_cert_pem = leaf_cert.pem();

        let chain = vec![leaf_cert_der.clone(), self.root.cert_der.clone()];
        let private_key = PrivateKeyDer::from(leaf_key_der);

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsIdentity {
            server_config: Arc::new(server_config),
            leaf_cert_der,
            leaf_cert_pem,
        })
    }
}

fn generate_root_material(config: &CaConfig) -> Result<RootMaterial, CaError> {
    let root_key = generate_key_pair()?;
    let params = build_root_params(config);
    let root_cert = params.self_signed(&root_key)?;
    let cert_pem = root_cert.pem().into_bytes();
    let cert_der = root_cert.der().clone();
    let issuer = Issuer::new(params, root_key);

    Ok(RootMaterial {
        issuer,
        cert_pem,
        cert_der,
    })
}

fn build_root_params(config: &CaConfig) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - ROOT_VALIDITY_BACKDATE;
    params.not_after = now + ROOT_VALIDITY;
    params.serial_number = Some(SerialNumber::from(1_u64));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, config.common_name.clone());
    dn.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = dn;
    params
}

fn build_leaf_params(host: &str, serial: u64) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - LEAF_VALIDITY_BACKDATE;
    params.not_after = now + LEAF_VALIDITY;
    params.serial_number = Some(SerialNumber::from(serial));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.to_string());
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

// RSA-2048 to match what clients historically expect from interception
// proxies; the ring-backed rcgen cannot generate RSA keys, so ECDSA
// P-256 serves as the compat fallback.
fn generate_key_pair() -> Result<KeyPair, CaError> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
        .or_else(|_| KeyPair::generate())
        .map_err(Into::into)
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn initial_serial() -> u64 {
    // Seeded from wall-clock nanos so serials stay unique across
    // restarts even though the root itself is regenerated.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(2)
        .max(2)
}
