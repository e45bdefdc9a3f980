use log::warn;
use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::fs;
use std::sync::Arc;

use super::PublishError;
use crate::config::MqttConfig;

fn read_file(path: &str) -> Result<Vec<u8>, PublishError> {
    return fs::read(path).map_err(|e| PublishError::Io { path: path.to_string(), source: e });
}

/// Plain TCP, verified TLS or TLS accepting any server certificate
pub fn build_transport(config: &MqttConfig) -> Result<Transport, PublishError> {
    if !config.tls_enabled {
        return Ok(Transport::Tcp);
    }

    if config.tls_insecure {
        warn!("TLS certificate verification of {} is disabled", config.host);
        return Ok(Transport::Tls(TlsConfiguration::Rustls(Arc::new(insecure_client_config(config)?))));
    }

    let ca = read_file(&config.tls_ca)?;
    let client_auth = match (&config.tls_cert, &config.tls_keyfile) {
        (Some(cert), Some(key)) => Some((read_file(cert)?, read_file(key)?)),
        _ => None,
    };

    return Ok(Transport::Tls(TlsConfiguration::Simple { ca, alpn: None, client_auth }));
}

fn insecure_client_config(config: &MqttConfig) -> Result<ClientConfig, PublishError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| PublishError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));

    return match (&config.tls_cert, &config.tls_keyfile) {
        (Some(cert), Some(key)) => {
            let certs = CertificateDer::pem_file_iter(cert)
                .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
                .map_err(|e| PublishError::Tls(format!("{cert}: {e}")))?;
            let key = PrivateKeyDer::from_pem_file(key)
                .map_err(|e| PublishError::Tls(format!("{key}: {e}")))?;
            builder.with_client_auth_cert(certs, key).map_err(|e| PublishError::Tls(e.to_string()))
        }
        _ => Ok(builder.with_no_client_auth()),
    };
}

/// Skips chain and name checks but still verifies handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(&self, _end_entity: &CertificateDer<'_>, _intermediates: &[CertificateDer<'_>],
                          _server_name: &ServerName<'_>, _ocsp_response: &[u8], _now: UnixTime)
                          -> Result<ServerCertVerified, rustls::Error> {
        return Ok(ServerCertVerified::assertion());
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct)
                              -> Result<HandshakeSignatureValid, rustls::Error> {
        return verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms);
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct)
                              -> Result<HandshakeSignatureValid, rustls::Error> {
        return verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms);
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        return self.0.signature_verification_algorithms.supported_schemes();
    }
}
