//! TLS client configuration for backends

use edgegate_environment::TlsSettings;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

use crate::error::ProxyError;

/// Connector plus the name presented during the handshake
#[derive(Clone)]
pub struct BackendTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for BackendTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTls")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl BackendTls {
    /// Build the client side of TLS for `host`
    pub fn new(settings: &TlsSettings, host: &str) -> Result<Self, ProxyError> {
        let config = client_config(settings)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::ConfigInvalid(format!("Invalid TLS server name '{}': {}", host, e)))?;

        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

pub fn client_config(settings: &TlsSettings) -> Result<Arc<rustls::ClientConfig>, ProxyError> {
    ensure_crypto_provider();

    let builder = if settings.skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
    } else {
        let mut roots = rustls::RootCertStore::empty();
        match &settings.ca_cert_pem {
            Some(pem) => {
                for cert in parse_certs(pem)? {
                    roots
                        .add(cert)
                        .map_err(|e| ProxyError::ConfigInvalid(format!("Invalid CA certificate: {}", e)))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let config = match (&settings.client_cert_pem, &settings.client_key_pem) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(parse_certs(cert)?, parse_key(key)?)
            .map_err(|e| ProxyError::ConfigInvalid(format!("Invalid client certificate: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ProxyError::ConfigInvalid(
                "Client certificate and key must be given together".to_string(),
            ))
        }
    };

    Ok(Arc::new(config))
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::ConfigInvalid(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::ConfigInvalid("No certificate found in PEM".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ProxyError::ConfigInvalid(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| ProxyError::ConfigInvalid("No private key found".to_string()))
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Accepts any server certificate; only used when an environment opts out of verification
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roots() {
        assert!(client_config(&TlsSettings::enabled()).is_ok());
    }

    #[test]
    fn test_skip_verify() {
        assert!(client_config(&TlsSettings::insecure()).is_ok());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let settings = TlsSettings {
            client_cert_pem: Some("-----BEGIN CERTIFICATE-----".to_string()),
            ..TlsSettings::enabled()
        };
        assert!(matches!(
            client_config(&settings),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_garbage_ca_is_rejected() {
        let settings = TlsSettings {
            ca_cert_pem: Some("not a pem".to_string()),
            ..TlsSettings::enabled()
        };
        assert!(matches!(
            client_config(&settings),
            Err(ProxyError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_ip_server_name() {
        let tls = BackendTls::new(&TlsSettings::insecure(), "10.0.0.5").unwrap();
        assert!(matches!(tls.server_name(), ServerName::IpAddress(_)));
    }
}
