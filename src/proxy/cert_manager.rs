//! CA Authority: owns the long-lived root key/cert and mints per-host leaf
//! certificates on demand, coalescing concurrent requests for the same
//! host into a single signing operation.

use dashmap::DashMap;
use fs2::FileExt;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;

/// Soft upper bound on cached leaf certificates, LRU-evicted beyond this.
const MAX_LEAF_CACHE: usize = 1024;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to generate or parse certificate: {0}")]
    CertGen(#[from] rcgen::Error),
    #[error("failed to build TLS server config: {0}")]
    TlsConfig(#[from] rustls::Error),
    #[error("invalid hostname for certificate: {0}")]
    InvalidHost(String),
}

fn io_err(path: &Path, source: std::io::Error) -> CaError {
    CaError::Io {
        path: path.to_path_buf(),
        source,
    }
}

struct RootCa {
    cert: Certificate,
    key: KeyPair,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    not_after: OffsetDateTime,
}

impl RootCa {
    /// Loads the root CA from `<ca_dir>/certs/ca.pem` and
    /// `<ca_dir>/keys/ca.key` if both exist and parse, otherwise generates a
    /// fresh one and persists it atomically (write-to-tmp + rename) so
    /// external watchers waiting for `ca.pem` to appear only ever see a
    /// complete file.
    fn init(ca_dir: &Path) -> Result<Self, CaError> {
        let certs_dir = ca_dir.join("certs");
        let keys_dir = ca_dir.join("keys");
        fs::create_dir_all(&certs_dir).map_err(|e| io_err(&certs_dir, e))?;
        fs::create_dir_all(&keys_dir).map_err(|e| io_err(&keys_dir, e))?;

        let cert_path = certs_dir.join("ca.pem");
        let key_path = keys_dir.join("ca.key");

        // Serialise concurrent first-starts against the same CA directory.
        let lock_path = ca_dir.join(".ca.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| io_err(&lock_path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| io_err(&lock_path, e))?;

        let result = if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path)
        } else {
            Self::generate_and_persist(&cert_path, &key_path)
        };

        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| io_err(cert_path, e))?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| io_err(key_path, e))?;

        let key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let not_after = params.not_after;
        let cert = params.self_signed(&key)?;
        let cert_der = cert.der().clone();

        tracing::info!(path = %cert_path.display(), "loaded existing root CA");
        Ok(Self {
            cert,
            key,
            cert_der,
            cert_pem,
            not_after,
        })
    }

    fn generate_and_persist(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Secure Proxy CA");
        dn.push(DnType::OrganizationName, format!("Secure Proxy ({hostname})"));

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        let not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);
        params.not_before = now;
        params.not_after = not_after;

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        let cert_der = cert.der().clone();

        atomic_write(cert_path, cert_pem.as_bytes(), 0o644)?;
        atomic_write(key_path, key_pem.as_bytes(), 0o600)?;

        tracing::info!(path = %cert_path.display(), "generated new root CA");
        Ok(Self {
            cert,
            key,
            cert_der,
            cert_pem,
            not_after,
        })
    }
}

#[cfg(unix)]
fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<(), CaError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp_path)
            .map_err(|e| io_err(&tmp_path, e))?;
        tmp.write_all(data).map_err(|e| io_err(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from(bytes.to_vec())
}

/// A single in-memory leaf cache slot. Concurrent misses on the same host
/// coalesce onto the same `OnceCell`; only one of them actually signs a
/// certificate. The cached value carries its own expiry so a stale entry
/// can be detected and replaced without a separate bookkeeping map.
type LeafSlot = Arc<OnceCell<(Arc<ServerConfig>, OffsetDateTime)>>;

struct LeafCache {
    cells: DashMap<String, LeafSlot>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LeafCache {
    fn new(capacity: usize) -> Self {
        Self {
            cells: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn slot_for(&self, host: &str) -> LeafSlot {
        self.cells
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn touch(&self, host: &str) {
        let mut order = self.order.lock().unwrap();
        if let Some(pos) = order.iter().position(|h| h == host) {
            order.remove(pos);
        }
        order.push_back(host.to_string());
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.cells.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.cells.len()
    }

    /// Drops a single entry (and its order-tracking record) so the next
    /// lookup re-mints it from scratch.
    fn remove(&self, host: &str) {
        self.cells.remove(host);
        let mut order = self.order.lock().unwrap();
        if let Some(pos) = order.iter().position(|h| h == host) {
            order.remove(pos);
        }
    }
}

/// In-process CA: holds the root key/cert and mints + caches per-host leaf
/// certificates wrapped in ready-to-use TLS server configs.
pub struct CertManager {
    root: RootCa,
    leaf_cache: LeafCache,
}

impl CertManager {
    /// Initializes the CA, loading an existing root from `ca_dir` or
    /// generating a new one.
    pub fn new(ca_dir: impl AsRef<Path>) -> Result<Self, CaError> {
        let root = RootCa::init(ca_dir.as_ref())?;
        Ok(Self {
            root,
            leaf_cache: LeafCache::new(MAX_LEAF_CACHE),
        })
    }

    /// PEM-encoded root certificate, written to `<ca_dir>/certs/ca.pem` and
    /// also exposed here for diagnostics/tests.
    pub fn root_cert_pem(&self) -> &str {
        &self.root.cert_pem
    }

    #[cfg(test)]
    pub fn root_cert_der(&self) -> CertificateDer<'static> {
        self.root.cert_der.clone()
    }

    /// Returns a ready TLS server config presenting a leaf certificate for
    /// `host`, minting and caching one if necessary. Concurrent callers for
    /// the same host share one minting operation. A cached entry whose
    /// validity window no longer covers now is evicted and re-minted
    /// rather than served past its `not_after`.
    pub async fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        let key = host.to_ascii_lowercase();
        loop {
            let slot = self.leaf_cache.slot_for(&key);
            let (config, not_after) = slot
                .get_or_try_init(|| async { self.build_server_config(&key) })
                .await?
                .clone();

            if OffsetDateTime::now_utc() < not_after {
                self.leaf_cache.touch(&key);
                return Ok(config);
            }
            self.leaf_cache.remove(&key);
        }
    }

    fn build_server_config(&self, host: &str) -> Result<(Arc<ServerConfig>, OffsetDateTime), CaError> {
        let (chain, key_der, not_after) = self.issue_leaf(host)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok((Arc::new(config), not_after))
    }

    /// Signs a fresh leaf certificate for `host`. CN = host, SAN DNS =
    /// host, EKU = serverAuth, KU = digitalSignature + keyEncipherment,
    /// CA:FALSE, validity `[now-24h, min(now+365d, root notAfter)]`,
    /// SHA-256 signature. Returns the certificate's `not_after` alongside
    /// the chain so the cache can detect expiry without re-parsing the DER.
    fn issue_leaf(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, OffsetDateTime), CaError> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            let dns_name =
                Ia5String::try_from(host).map_err(|_| CaError::InvalidHost(host.to_string()))?;
            params.subject_alt_names = vec![SanType::DnsName(dns_name)];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        let not_before = now.checked_sub(Duration::hours(24)).unwrap_or(now);
        let preferred_not_after = now.checked_add(Duration::days(365)).unwrap_or(now);
        params.not_before = not_before;
        params.not_after = preferred_not_after.min(self.root.not_after);
        let not_after = params.not_after;

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &self.root.cert, &self.root.key)?;

        let chain = vec![cert.der().clone(), self.root.cert_der.clone()];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key, not_after))
    }

    #[cfg(test)]
    fn issue_leaf_for_test(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, OffsetDateTime), CaError> {
        self.issue_leaf(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempfile::tempdir().unwrap();

        let pem_first = {
            let manager = CertManager::new(dir.path()).expect("initial creation");
            assert!(dir.path().join("certs/ca.pem").exists());
            assert!(dir.path().join("keys/ca.key").exists());
            manager.root_cert_pem().to_string()
        };

        let manager_again = CertManager::new(dir.path()).expect("reuse existing");
        assert_eq!(manager_again.root_cert_pem(), pem_first);
    }

    #[test]
    fn root_ca_is_self_signed_with_modern_signature() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();
        let der = manager.root_cert_der();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(cert.tbs_certificate.basic_constraints().unwrap().unwrap().value.ca);
        assert_signature_is_modern(cert.signature_algorithm.algorithm.to_string().as_str());
    }

    #[test]
    fn leaf_cert_chains_to_root_and_has_correct_san() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();
        let (chain, _key, _not_after) = manager.issue_leaf_for_test("example.com").unwrap();
        assert_eq!(chain.len(), 2, "leaf + root");

        let (_, leaf) = X509Certificate::from_der(&chain[0]).unwrap();
        let sans: Vec<String> = leaf
            .subject_alternative_name()
            .unwrap()
            .unwrap()
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(sans, vec!["example.com".to_string()]);
        assert!(!leaf.tbs_certificate.basic_constraints().unwrap().unwrap().value.ca);
        assert_signature_is_modern(leaf.signature_algorithm.algorithm.to_string().as_str());

        let now = OffsetDateTime::now_utc();
        assert!(leaf.validity().not_before.to_datetime() <= now);
        assert!(leaf.validity().not_after.to_datetime() >= now);
    }

    fn assert_signature_is_modern(oid: &str) {
        // sha256WithRSAEncryption or ecdsa-with-SHA256
        let modern = oid == "1.2.840.113549.1.1.11" || oid == "1.2.840.10045.4.3.2";
        assert!(modern, "unexpected signature algorithm OID: {oid}");
    }

    #[tokio::test]
    async fn expired_leaf_is_reminted_on_next_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();

        let (chain, key_der, _not_after) = manager.issue_leaf_for_test("stale.example").unwrap();
        let mut stale_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .unwrap();
        stale_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let already_expired = OffsetDateTime::now_utc() - Duration::hours(1);

        let slot = manager.leaf_cache.slot_for("stale.example");
        slot.set((Arc::new(stale_config), already_expired)).unwrap();

        let fresh = manager
            .server_config_for_host("stale.example")
            .await
            .unwrap();

        let refreshed_slot = manager.leaf_cache.slot_for("stale.example");
        let (refreshed_config, refreshed_not_after) = refreshed_slot.get().unwrap().clone();
        assert!(Arc::ptr_eq(&fresh, &refreshed_config));
        assert!(refreshed_not_after > already_expired);
        assert_eq!(manager.leaf_cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_mint_for_same_host_single_flights() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CertManager::new(dir.path()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .server_config_for_host("shared.example")
                    .await
                    .unwrap()
            }));
        }

        let mut configs = Vec::new();
        for handle in handles {
            configs.push(handle.await.unwrap());
        }

        let first = &configs[0];
        for config in &configs {
            assert!(
                Arc::ptr_eq(first, config),
                "all callers should share one minted config"
            );
        }
    }

    #[tokio::test]
    async fn concurrent_mint_for_n_distinct_hosts_produces_n_entries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CertManager::new(dir.path()).unwrap());

        let hosts: Vec<String> = (0..10).map(|i| format!("host{i}.example")).collect();
        let mut handles = Vec::new();
        for host in &hosts {
            for _ in 0..10 {
                let manager = manager.clone();
                let host = host.clone();
                handles.push(tokio::spawn(async move {
                    manager.server_config_for_host(&host).await.unwrap()
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(manager.leaf_cache.len(), 10);
    }

    #[test]
    fn leaf_cache_evicts_oldest_beyond_capacity() {
        let cache = LeafCache::new(2);
        for host in ["a", "b", "c"] {
            cache.cells.insert(host.to_string(), Arc::new(OnceCell::new()));
            cache.touch(host);
        }
        assert_eq!(cache.cells.len(), 2);
        assert!(!cache.cells.contains_key("a"));
        assert!(cache.cells.contains_key("b"));
        assert!(cache.cells.contains_key("c"));
    }
}
