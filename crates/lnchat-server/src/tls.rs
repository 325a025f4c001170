//! TLS setup for the RPC listener.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tracing::info;
use x509_parser::pem::Pem;

use crate::config::TlsPaths;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("{0} contains no certificate")]
    Empty(String),

    #[error("invalid certificate in {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("certificate {subject} expired at unix time {not_after}")]
    Expired { subject: String, not_after: i64 },

    #[error("certificate {subject} is not valid before unix time {not_before}")]
    NotYetValid { subject: String, not_before: i64 },
}

fn check_window(subject: &str, not_before: i64, not_after: i64, now: i64) -> Result<(), TlsError> {
    if now < not_before {
        return Err(TlsError::NotYetValid {
            subject: subject.to_string(),
            not_before,
        });
    }
    if now > not_after {
        return Err(TlsError::Expired {
            subject: subject.to_string(),
            not_after,
        });
    }
    Ok(())
}

/// Check that every certificate in the PEM file at `path` is valid at
/// `now` (unix seconds).
pub fn check_certificates(path: &Path, now: i64) -> Result<(), TlsError> {
    let display = path.display().to_string();
    let data = std::fs::read(path).map_err(|source| TlsError::Read {
        path: display.clone(),
        source,
    })?;

    let mut count = 0;
    for pem in Pem::iter_from_buffer(&data) {
        let pem = pem.map_err(|e| TlsError::Invalid {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let cert = pem.parse_x509().map_err(|e| TlsError::Invalid {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let validity = cert.validity();
        check_window(
            &cert.subject().to_string(),
            validity.not_before.timestamp(),
            validity.not_after.timestamp(),
            now,
        )?;
        count += 1;
    }
    if count == 0 {
        return Err(TlsError::Empty(display));
    }
    Ok(())
}

/// Validate the certificate chain and build the rustls configuration.
pub async fn load(paths: &TlsPaths) -> anyhow::Result<RustlsConfig> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs() as i64;
    check_certificates(&paths.cert_path, now)?;
    let config = RustlsConfig::from_pem_file(&paths.cert_path, &paths.key_path).await?;
    info!(cert = %paths.cert_path.display(), "TLS enabled");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_window() {
        assert!(check_window("cn", 100, 200, 150).is_ok());
        assert!(matches!(
            check_window("cn", 100, 200, 201),
            Err(TlsError::Expired { not_after: 200, .. })
        ));
        assert!(matches!(
            check_window("cn", 100, 200, 99),
            Err(TlsError::NotYetValid { not_before: 100, .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_certificates(&dir.path().join("nope.pem"), 0).unwrap_err();
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[test]
    fn test_file_without_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, b"not a certificate\n").unwrap();
        assert!(matches!(
            check_certificates(&path, 0),
            Err(TlsError::Empty(_))
        ));
    }
}
