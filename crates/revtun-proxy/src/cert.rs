//! TLS material for tunnel proxies

use crate::config::{TlsMin, TunnelProxyConfig};
use crate::error::ProxyError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Certificate chain and key served by a tunnel proxy
pub type CertifiedKey = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

pub trait CertificateProvider: Send + Sync + fmt::Debug {
    fn certified_key(&self) -> Result<CertifiedKey, ProxyError>;
}

/// PEM files, read again every time a proxy starts
#[derive(Debug, Clone)]
pub struct FileCertificateProvider {
    cert: PathBuf,
    key: PathBuf,
}

impl FileCertificateProvider {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }
}

impl CertificateProvider for FileCertificateProvider {
    fn certified_key(&self) -> Result<CertifiedKey, ProxyError> {
        Ok((load_certs(&self.cert)?, load_private_key(&self.key)?))
    }
}

/// A certificate generated once at construction
pub struct SelfSignedCertificateProvider {
    names: Vec<String>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl SelfSignedCertificateProvider {
    pub fn new(names: Vec<String>) -> Result<Self, ProxyError> {
        let certified = rcgen::generate_simple_self_signed(names.clone()).map_err(|e| {
            ProxyError::Tls(format!("Failed to generate self-signed cert: {}", e))
        })?;
        info!(names = ?names, "Generated self-signed tunnel proxy certificate");
        Ok(Self {
            names,
            cert: certified.cert.der().to_vec(),
            key: certified.key_pair.serialize_der(),
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl fmt::Debug for SelfSignedCertificateProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfSignedCertificateProvider")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl CertificateProvider for SelfSignedCertificateProvider {
    fn certified_key(&self) -> Result<CertifiedKey, ProxyError> {
        Ok((
            vec![CertificateDer::from(self.cert.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone())),
        ))
    }
}

/// Pick the provider the proxy config asks for; `None` when proxies are off
pub fn provider_from_config(
    config: &TunnelProxyConfig,
) -> Result<Option<Arc<dyn CertificateProvider>>, ProxyError> {
    if let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) {
        return Ok(Some(Arc::new(FileCertificateProvider::new(cert, key))));
    }
    if config.self_signed {
        let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        if let Some(host) = &config.host {
            if !names.contains(host) {
                names.push(host.clone());
            }
        }
        return Ok(Some(Arc::new(SelfSignedCertificateProvider::new(names)?)));
    }
    Ok(None)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server config for a proxy listener, accepting `tls_min` and newer
pub fn server_config(
    provider: &dyn CertificateProvider,
    tls_min: TlsMin,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let (certs, key) = provider.certified_key()?;

    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(tls_min.versions())
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("Invalid cert/key: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Client config for HTTPS backends. Backends are loopback-only, so their
/// certificates are not verified.
pub(crate) fn backend_client_config() -> Result<Arc<ClientConfig>, ProxyError> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyBackendCert))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("No private key found".to_string()))
}

#[derive(Debug)]
struct AnyBackendCert;

impl ServerCertVerifier for AnyBackendCert {
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
        crypto_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
