//! Certificate loading and acceptor construction for TLS listeners.

use crate::config::TlsConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds a `TlsAcceptor` from the PEM files named in the config.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_cert_chain(cert_path)?, load_key(key_path)?)
        .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ServerError> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) => Err(ServerError::TlsConfig(format!(
            "cannot open {}: {}",
            path.display(),
            e
        ))),
    }
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ServerError::TlsConfig(format!("bad certificate in {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            ServerError::TlsConfig(format!("bad private key in {}: {}", path.display(), e))
        })?
        .ok_or_else(|| {
            ServerError::TlsConfig(format!("no private key in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let err = load_cert_chain(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }

    #[test]
    fn test_missing_key_file() {
        let err = load_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }

    #[test]
    fn test_acceptor_requires_cert_path() {
        let config = TlsConfig {
            enabled: true,
            cert_path: None,
            key_path: Some("/some/key.pem".into()),
        };
        let err = create_tls_acceptor(&config).err().expect("expected error");
        assert!(err.to_string().contains("cert_path not set"));
    }

    #[test]
    fn test_acceptor_requires_key_path() {
        let config = TlsConfig {
            enabled: true,
            cert_path: Some("/some/cert.pem".into()),
            key_path: None,
        };
        let err = create_tls_acceptor(&config).err().expect("expected error");
        assert!(err.to_string().contains("key_path not set"));
    }
}
