//! TLS certificates and SNI selection
//!
//! The [`CertificateStore`] holds every installed certificate and answers
//! the SNI lookup during each handshake: exact name first, then a
//! single-level wildcard, then the default certificate. Installing or
//! replacing a certificate swaps the whole table, so handshakes already in
//! flight keep the certificate they resolved and new handshakes pick up the
//! replacement.
//!
//! Private keys are held only as rustls signing keys and the PEM text needed
//! to persist them; nothing in the public API hands key material out.

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::router::normalize_host;

/// Install the ring provider as the process default. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Public facts about a certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub domain: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub issuer: String,
    pub self_signed: bool,
}

impl CertificateInfo {
    /// Whole days left before expiry (negative once expired)
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// Expires within `days` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, days: i64) -> bool {
        self.not_after <= now + ChronoDuration::days(days)
    }
}

/// A parsed certificate chain with its private key
pub struct Certificate {
    info: CertificateInfo,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    chain_pem: String,
    key_pem: String,
}

impl Certificate {
    /// Parse a PEM chain (leaf first) and a PEM private key
    pub fn from_pem(domain: &str, chain_pem: &str, key_pem: &str) -> Result<Self> {
        let mut reader = chain_pem.as_bytes();
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GatewayError::Tls(format!("Failed to read certificates: {}", e)))?;
        let leaf = chain
            .first()
            .ok_or_else(|| GatewayError::Tls(format!("{}: no certificate found", domain)))?;
        let info = parse_leaf(domain, leaf)?;

        let mut reader = key_pem.as_bytes();
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| GatewayError::Tls(format!("Failed to read private key: {}", e)))?
            .ok_or_else(|| GatewayError::Tls(format!("{}: no private key found", domain)))?;

        Ok(Self {
            info,
            chain,
            key,
            chain_pem: chain_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// Self-signed certificate covering `domains`; the first one names it
    pub fn self_signed(domains: &[String]) -> Result<Self> {
        let primary = domains
            .first()
            .ok_or_else(|| GatewayError::Tls("self-signed certificate needs a domain".to_string()))?;
        let generated = rcgen::generate_simple_self_signed(domains.to_vec())
            .map_err(|e| GatewayError::Tls(format!("Failed to generate self-signed cert: {}", e)))?;
        Self::from_pem(primary, &generated.cert.pem(), &generated.key_pair.serialize_pem())
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    pub fn domain(&self) -> &str {
        &self.info.domain
    }

    fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.key)
            .map_err(|e| GatewayError::Tls(format!("{}: unsupported private key: {}", self.info.domain, e)))?;
        Ok(Arc::new(CertifiedKey::new(self.chain.clone(), signing_key)))
    }

    /// Write `cert.pem` and `key.pem` under the store layout
    pub fn save(&self, base_dir: &Path) -> Result<CertificatePaths> {
        let paths = CertificatePaths::for_domain(base_dir, &self.info.domain);
        paths.ensure_dir()?;
        fs::write(&paths.cert_path, &self.chain_pem)
            .map_err(|e| GatewayError::Tls(format!("Failed to write certificate: {}", e)))?;
        fs::write(&paths.key_path, &self.key_pem)
            .map_err(|e| GatewayError::Tls(format!("Failed to write private key: {}", e)))?;
        debug!(domain = %self.info.domain, path = ?paths.cert_path, "Certificate written");
        Ok(paths)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("info", &self.info)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

fn parse_leaf(domain: &str, leaf: &CertificateDer<'_>) -> Result<CertificateInfo> {
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| GatewayError::Tls(format!("{}: invalid certificate: {}", domain, e)))?;
    let validity = parsed.validity();
    let issuer = parsed.issuer().to_string();
    Ok(CertificateInfo {
        domain: domain.to_ascii_lowercase(),
        not_before: timestamp(validity.not_before.timestamp())?,
        not_after: timestamp(validity.not_after.timestamp())?,
        self_signed: issuer == parsed.subject().to_string(),
        issuer,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| GatewayError::Tls(format!("certificate time {} out of range", secs)))
}

/// Certificate storage paths
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    /// Directory holding one certificate
    pub cert_dir: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertificatePaths {
    /// `<base>/<domain>/{cert,key}.pem`, with `*.` stored as `_.`
    pub fn for_domain(base_dir: &Path, domain: &str) -> Self {
        let dir_name = match domain.strip_prefix("*.") {
            Some(parent) => format!("_.{}", parent),
            None => domain.to_string(),
        };
        let cert_dir = base_dir.join(dir_name);
        Self {
            cert_path: cert_dir.join("cert.pem"),
            key_path: cert_dir.join("key.pem"),
            cert_dir,
        }
    }

    /// Check if certificate files exist
    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }

    /// Ensure certificate directory exists
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.cert_dir)
            .map_err(|e| GatewayError::Tls(format!("Failed to create cert directory: {}", e)))
    }

    pub fn load(&self, domain: &str) -> Result<Certificate> {
        let chain = fs::read_to_string(&self.cert_path)
            .map_err(|e| GatewayError::Tls(format!("Failed to read {:?}: {}", self.cert_path, e)))?;
        let key = fs::read_to_string(&self.key_path)
            .map_err(|e| GatewayError::Tls(format!("Failed to read {:?}: {}", self.key_path, e)))?;
        Certificate::from_pem(domain, &chain, &key)
    }
}

#[derive(Clone)]
struct InstalledCertificate {
    info: CertificateInfo,
    key: Arc<CertifiedKey>,
}

#[derive(Clone, Default)]
struct CertTable {
    exact: HashMap<String, InstalledCertificate>,
    /// Keyed by parent domain: `*.example.com` -> `example.com`
    wildcard: HashMap<String, InstalledCertificate>,
    default: Option<InstalledCertificate>,
}

/// SNI-indexed certificate table
pub struct CertificateStore {
    table: ArcSwap<CertTable>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(CertTable::default()),
        }
    }

    /// Install or replace the certificate for its domain
    pub fn install(&self, certificate: &Certificate) -> Result<CertificateInfo> {
        let installed = InstalledCertificate {
            info: certificate.info.clone(),
            key: certificate.certified_key()?,
        };
        let domain = installed.info.domain.clone();
        self.table.rcu(|current| {
            let mut next = CertTable::clone(current);
            match domain.strip_prefix("*.") {
                Some(parent) => next.wildcard.insert(parent.to_string(), installed.clone()),
                None => next.exact.insert(domain.clone(), installed.clone()),
            };
            next
        });
        info!(
            domain = %domain,
            not_after = %installed.info.not_after,
            "Certificate installed"
        );
        Ok(installed.info)
    }

    /// Certificate presented when no SNI entry matches
    pub fn set_default(&self, certificate: &Certificate) -> Result<CertificateInfo> {
        let installed = InstalledCertificate {
            info: certificate.info.clone(),
            key: certificate.certified_key()?,
        };
        self.table.rcu(|current| {
            let mut next = CertTable::clone(current);
            next.default = Some(installed.clone());
            next
        });
        info!(domain = %installed.info.domain, "Default certificate set");
        Ok(installed.info)
    }

    /// Remove the certificate for `domain`; true if one was installed
    pub fn remove(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        let previous = self.table.rcu(|current| {
            let mut next = CertTable::clone(current);
            match domain.strip_prefix("*.") {
                Some(parent) => next.wildcard.remove(parent),
                None => next.exact.remove(&domain),
            };
            next
        });
        match domain.strip_prefix("*.") {
            Some(parent) => previous.wildcard.contains_key(parent),
            None => previous.exact.contains_key(&domain),
        }
    }

    /// Certificate for a ClientHello server name
    pub fn resolve_for_sni(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>> {
        let table = self.table.load();
        if let Some(name) = server_name {
            let name = normalize_host(name);
            if let Some(found) = table.exact.get(&name) {
                return Ok(found.key.clone());
            }
            let parent = name.split_once('.').map(|(_, rest)| rest);
            if let Some(found) = parent.and_then(|p| table.wildcard.get(p)) {
                return Ok(found.key.clone());
            }
        }
        table
            .default
            .as_ref()
            .map(|d| d.key.clone())
            .ok_or_else(|| GatewayError::CertificateUnavailable {
                host: server_name.unwrap_or("<none>").to_string(),
            })
    }

    pub fn get(&self, domain: &str) -> Option<CertificateInfo> {
        let domain = domain.to_ascii_lowercase();
        let table = self.table.load();
        let found = match domain.strip_prefix("*.") {
            Some(parent) => table.wildcard.get(parent),
            None => table.exact.get(&domain),
        };
        found.map(|c| c.info.clone())
    }

    /// Every installed certificate (default excluded), sorted by domain
    pub fn list(&self) -> Vec<CertificateInfo> {
        let table = self.table.load();
        let mut all: Vec<CertificateInfo> = table
            .exact
            .values()
            .chain(table.wildcard.values())
            .map(|c| c.info.clone())
            .collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        all
    }

    pub fn has_default(&self) -> bool {
        self.table.load().default.is_some()
    }

    /// Install every `<domain>/cert.pem` + `key.pem` pair under `dir`.
    /// Broken entries are skipped with a warning.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            debug!(path = ?dir, "Certificate directory does not exist yet");
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let domain = match name.strip_prefix("_.") {
                Some(parent) => format!("*.{}", parent),
                None => name,
            };
            let paths = CertificatePaths::for_domain(dir, &domain);
            if !paths.exists() {
                continue;
            }
            match paths.load(&domain).and_then(|cert| self.install(&cert)) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(domain = %domain, error = %e, "Skipping certificate"),
            }
        }
        info!(count = loaded, path = ?dir, "Certificates loaded");
        Ok(loaded)
    }

    /// TLS acceptor resolving certificates from this store
    pub fn acceptor(self: &Arc<Self>) -> Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Tls(format!("TLS config error: {}", e)))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver {
                store: Arc::clone(self),
            }));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("certificates", &self.list().len())
            .field("default", &self.has_default())
            .finish()
    }
}

struct SniResolver {
    store: Arc<CertificateStore>,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.store.resolve_for_sni(client_hello.server_name()) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "TLS handshake without certificate");
                None
            }
        }
    }
}
