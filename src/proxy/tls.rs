//! Certificate minting for HTTPS interception.
//!
//! A root CA is loaded from disk (or generated on first run), and per-host
//! leaf certificates are signed by it on demand so the proxy can terminate
//! TLS for the repository host. Generated `ServerConfig`s are cached in
//! memory per host.

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::{pki_types::PrivateKeyDer, ServerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::error::TlsError;

const CA_COMMON_NAME: &str = "Git Auth Proxy Root CA";

pub struct TlsHandler {
    ca_cert: Arc<Certificate>,
    ca_key: Arc<KeyPair>,

    /// Generated ServerConfig per host.
    server_configs: Arc<DashMap<String, Arc<ServerConfig>>>,
}

impl TlsHandler {
    /// Create a handler backed by the given CA cert/key paths; defaults to
    /// `~/.git-auth-proxy/ca.{crt,key}` when not configured.
    pub fn new(
        ca_cert_path: Option<PathBuf>,
        ca_key_path: Option<PathBuf>,
    ) -> Result<Self, TlsError> {
        let (cert_path, key_path) = match (ca_cert_path, ca_key_path) {
            (Some(cert), Some(key)) => (cert, key),
            (cert, key) => {
                let ca_dir = dirs::home_dir()
                    .ok_or_else(|| TlsError::CertLoad("could not find home directory".into()))?
                    .join(".git-auth-proxy");
                (
                    cert.unwrap_or_else(|| ca_dir.join("ca.crt")),
                    key.unwrap_or_else(|| ca_dir.join("ca.key")),
                )
            }
        };

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (ca_cert, ca_key) = Self::load_or_create_ca(&cert_path, &key_path)?;

        Ok(Self {
            ca_cert: Arc::new(ca_cert),
            ca_key: Arc::new(ca_key),
            server_configs: Arc::new(DashMap::new()),
        })
    }

    fn load_or_create_ca(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(Certificate, KeyPair), TlsError> {
        if cert_path.exists() && key_path.exists() {
            tracing::info!("Loading existing CA certificate from {:?}", cert_path);
            Self::load_ca_from_disk(key_path)
        } else {
            tracing::info!("Generating new CA certificate");
            let (ca_cert, ca_key) = Self::generate_root_ca()?;
            Self::save_ca_to_disk(&ca_cert, &ca_key, cert_path, key_path)?;
            Ok((ca_cert, ca_key))
        }
    }

    fn ca_params() -> Result<CertificateParams, TlsError> {
        let mut params = CertificateParams::new(vec![CA_COMMON_NAME.to_string()])
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "Git Auth Proxy");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);

        Ok(params)
    }

    fn generate_root_ca() -> Result<(Certificate, KeyPair), TlsError> {
        let params = Self::ca_params()?;
        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        Ok((cert, key_pair))
    }

    /// rcgen 0.13 has no Certificate::from_pem, so the CA certificate is
    /// re-derived from the stored key with the same fixed parameters.
    fn load_ca_from_disk(key_path: &Path) -> Result<(Certificate, KeyPair), TlsError> {
        let key_pem = fs::read_to_string(key_path)?;
        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| TlsError::CertLoad(e.to_string()))?;

        let params = Self::ca_params().map_err(|e| TlsError::CertLoad(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertLoad(e.to_string()))?;

        Ok((cert, key_pair))
    }

    fn save_ca_to_disk(
        ca: &Certificate,
        ca_key: &KeyPair,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(), TlsError> {
        fs::write(cert_path, ca.pem())?;
        fs::write(key_path, ca_key.serialize_pem())?;

        tracing::info!(
            ca_cert_path = ?cert_path,
            ca_key_path = ?key_path,
            "Saved CA certificate to disk"
        );

        Ok(())
    }

    fn generate_host_cert(
        host: &str,
        ca_cert: &Certificate,
        ca_key: &KeyPair,
    ) -> Result<(Certificate, KeyPair), TlsError> {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(90);

        params.subject_alt_names = vec![rcgen::SanType::DnsName(
            host.to_string()
                .try_into()
                .map_err(|e| TlsError::CertGeneration(format!("invalid host name: {e:?}")))?,
        )];

        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, ca_cert, ca_key)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        Ok((cert, key_pair))
    }

    /// Get or generate a ServerConfig for the given host.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, TlsError> {
        if let Some(config) = self.server_configs.get(host) {
            tracing::trace!(host = host, "using cached ServerConfig");
            return Ok(config.clone());
        }

        tracing::debug!(host = host, "generating interception certificate");
        let (host_cert, host_key) = Self::generate_host_cert(host, &self.ca_cert, &self.ca_key)?;

        let chain_pem = format!("{}{}", host_cert.pem(), self.ca_cert.pem());
        let cert_chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;

        let private_key = PrivateKeyDer::try_from(host_key.serialize_der())
            .map_err(|e| TlsError::InvalidCert(format!("invalid private key: {e:?}")))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;

        let config = Arc::new(config);
        self.server_configs.insert(host.to_string(), config.clone());

        Ok(config)
    }

    /// CA certificate PEM, for installing into a client's trust store.
    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert.pem()
    }
}
