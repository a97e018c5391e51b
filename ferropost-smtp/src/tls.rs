//! Server TLS material.
//!
//! The listener speaks implicit TLS when material is available. Three
//! outcomes: explicitly disabled (a sentinel error the caller treats as
//! "run plaintext"), a certificate/key pair loaded from PEM files, or an
//! ephemeral self-signed certificate generated at startup when nothing is
//! configured.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use ferropost_common::config;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    /// TLS was switched off via `SMTP_TLS_DISABLE`. Not a failure; the
    /// caller falls back to a plaintext listener.
    #[error("smtp tls disabled: certificate not configured")]
    Disabled,

    #[error("load certificate {path}: {source}")]
    CertificateLoad {
        path: String,
        source: std::io::Error,
    },

    #[error("load key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("generate ephemeral certificate: {0}")]
    Generate(String),

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// Build the server TLS configuration from the environment.
///
/// # Errors
/// [`TlsError::Disabled`] when TLS is forced off; real errors when
/// configured material cannot be loaded.
pub fn load_server_config() -> Result<Arc<ServerConfig>, TlsError> {
    if config::bool_env("SMTP_TLS_DISABLE", false) {
        return Err(TlsError::Disabled);
    }

    let cert_path = std::env::var("SMTP_TLS_CERT").unwrap_or_default();
    let key_path = std::env::var("SMTP_TLS_KEY").unwrap_or_default();
    if cert_path.is_empty() || key_path.is_empty() {
        return ephemeral_config(&config::hostname());
    }
    config_from_files(&cert_path, &key_path)
}

/// Load a certificate chain and private key from PEM files.
///
/// # Errors
/// Fails when either file is unreadable or holds no usable material.
pub fn config_from_files(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let file = File::open(cert_path).map_err(|source| TlsError::CertificateLoad {
        path: cert_path.to_string(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::CertificateLoad {
            path: cert_path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::CertificateLoad {
            path: cert_path.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no certificates in file"),
        });
    }

    let key = load_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|err| TlsError::KeyLoad {
        path: path.to_string(),
        reason: err.to_string(),
    })?;
    let item = rustls_pemfile::read_one(&mut BufReader::new(file)).map_err(|err| {
        TlsError::KeyLoad {
            path: path.to_string(),
            reason: err.to_string(),
        }
    })?;

    match item {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path.to_string(),
            reason: "unable to determine key format (expected PKCS1, PKCS8, or SEC1)".to_string(),
        }),
    }
}

/// Self-signed certificate for `hostname`, valid only for this process
/// lifetime. Used when no material is configured.
pub fn ephemeral_config(hostname: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let certified = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
        .map_err(|err| TlsError::Generate(err.to_string()))?;

    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_material_builds_a_config() {
        assert!(ephemeral_config("relay.test").is_ok());
    }

    #[test]
    fn files_round_trip_through_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["relay.test".into()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let config = config_from_files(cert_path.to_str().unwrap(), key_path.to_str().unwrap());
        assert!(config.is_ok());
    }

    #[test]
    fn missing_files_are_reported() {
        let err = config_from_files("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }

    #[test]
    fn garbage_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["relay.test".into()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, "not a key").unwrap();

        let err = config_from_files(cert_path.to_str().unwrap(), key_path.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, TlsError::KeyLoad { .. }));
    }
}
