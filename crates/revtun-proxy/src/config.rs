//! Tunnel proxy configuration

use crate::error::ProxyError;
use http::HeaderValue;
use rustls::pki_types::ServerName;
use rustls::SupportedProtocolVersion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

static TLS12_AND_UP: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Lowest TLS version the proxy accepts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsMin {
    #[default]
    V12,
    V13,
}

impl TlsMin {
    pub fn parse(value: &str) -> Result<Self, ProxyError> {
        match value.trim() {
            "1.2" => Ok(TlsMin::V12),
            "1.3" => Ok(TlsMin::V13),
            _ => Err(ProxyError::config("TLS must be either 1.2 or 1.3")),
        }
    }

    pub(crate) fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsMin::V12 => TLS12_AND_UP,
            TlsMin::V13 => TLS13_ONLY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelProxyConfig {
    /// Public host used in proxy URLs; the bind host when unset
    pub host: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Serve a generated certificate instead of files
    pub self_signed: bool,
    /// noVNC static files served by VNC proxies
    pub novnc_root: Option<PathBuf>,
    /// `"1.2"` or `"1.3"`
    pub tls_min: Option<String>,
    /// Allowed CORS origins; empty disables CORS
    pub cors: Vec<String>,
}

impl TunnelProxyConfig {
    /// Proxies can be started only with TLS material configured
    pub fn is_enabled(&self) -> bool {
        self.cert_file.is_some() || self.key_file.is_some() || self.self_signed
    }

    pub fn tls_min(&self) -> Result<TlsMin, ProxyError> {
        match &self.tls_min {
            Some(value) => TlsMin::parse(value),
            None => Ok(TlsMin::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) => {
                return Err(ProxyError::config(
                    "when 'cert_file' is set, 'key_file' must be set as well",
                ))
            }
            (None, Some(_)) => {
                return Err(ProxyError::config(
                    "when 'key_file' is set, 'cert_file' must be set as well",
                ))
            }
            (Some(_), Some(_)) if self.self_signed => {
                return Err(ProxyError::config(
                    "'self_signed' cannot be combined with 'cert_file' and 'key_file'",
                ))
            }
            _ => {}
        }

        self.tls_min()?;

        if let Some(host) = &self.host {
            if ServerName::try_from(host.as_str()).is_err() {
                return Err(ProxyError::config(format!(
                    "invalid tunnel proxy host '{}': use IP address or FQDN",
                    host
                )));
            }
        }

        if let Some(root) = &self.novnc_root {
            if !root.is_dir() {
                return Err(ProxyError::config(format!(
                    "novnc_root '{}' is not a directory",
                    root.display()
                )));
            }
        }

        for origin in &self.cors {
            if HeaderValue::from_str(origin).is_err() {
                return Err(ProxyError::config(format!(
                    "invalid CORS origin '{}'",
                    origin
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let config = TunnelProxyConfig::default();
        assert!(!config.is_enabled());
        assert!(config.validate().is_ok());
        assert_eq!(config.tls_min().unwrap(), TlsMin::V12);
    }

    #[test]
    fn test_cert_and_key_go_together() {
        let config = TunnelProxyConfig {
            cert_file: Some("cert.pem".into()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'key_file' must be set as well"));

        let config = TunnelProxyConfig {
            key_file: Some("key.pem".into()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'cert_file' must be set as well"));
    }

    #[test]
    fn test_self_signed_excludes_files() {
        let config = TunnelProxyConfig {
            cert_file: Some("cert.pem".into()),
            key_file: Some("key.pem".into()),
            self_signed: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_min() {
        let mut config = TunnelProxyConfig {
            self_signed: true,
            tls_min: Some("1.3".into()),
            ..Default::default()
        };
        assert_eq!(config.tls_min().unwrap(), TlsMin::V13);

        config.tls_min = Some("1.1".into());
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "invalid tunnel proxy config: TLS must be either 1.2 or 1.3"
        );
    }

    #[test]
    fn test_host_must_be_ip_or_fqdn() {
        let mut config = TunnelProxyConfig {
            self_signed: true,
            host: Some("tunnels.example.com".into()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.host = Some("10.1.2.3".into());
        assert!(config.validate().is_ok());

        config.host = Some("not a host".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_novnc_root_must_be_directory() {
        let config = TunnelProxyConfig {
            self_signed: true,
            novnc_root: Some("/definitely/not/here".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TunnelProxyConfig {
            self_signed: true,
            novnc_root: Some(std::env::temp_dir()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
