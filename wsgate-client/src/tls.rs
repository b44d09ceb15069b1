//! TLS connector construction for `wss://` targets.

use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Builds a verifying connector. Trust anchors come from the CA bundle at
/// `ca_cert_path` when given, otherwise from the webpki root set.
pub fn create_tls_connector(
    ca_cert_path: Option<&Path>,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(build_root_store(ca_cert_path)?)
        .with_no_client_auth();

    Ok((
        TlsConnector::from(Arc::new(client_config)),
        server_name(server_host)?,
    ))
}

/// Builds a connector that accepts any server certificate. Development and
/// testing only.
pub fn create_insecure_tls_connector(
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let verifier = AcceptAnyCert {
        provider: rustls::crypto::aws_lc_rs::default_provider().into(),
    };
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok((
        TlsConnector::from(Arc::new(client_config)),
        server_name(server_host)?,
    ))
}

fn server_name(host: &str) -> Result<ServerName<'static>, ClientError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", host)))
}

fn build_root_store(ca_cert_path: Option<&Path>) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    match ca_cert_path {
        Some(ca_path) => {
            for cert in read_ca_bundle(ca_path)? {
                store
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

fn read_ca_bundle(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path).map_err(|e| {
        ClientError::TlsConfig(format!("cannot open CA bundle {}: {}", path.display(), e))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ClientError::TlsConfig(format!("bad CA bundle {}: {}", path.display(), e))
        })
}

/// Certificate verifier that waves everything through. Signature checks
/// still run so the handshake stays well formed.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
