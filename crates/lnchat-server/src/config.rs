//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server can start against a
//! simulated node with zero configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown LN_BACKEND {0:?} (expected \"lnd\" or \"sim\")")]
    UnknownBackend(String),

    #[error("{0} requires {1}")]
    Missing(&'static str, &'static str),
}

/// Which payment node the service drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// A running LND, reached through its REST gateway.
    Lnd {
        rest_url: String,
        macaroon_path: Option<PathBuf>,
        tls_cert_path: Option<PathBuf>,
    },
    /// An in-process simulated node.
    Sim { alias: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthConfig {
    pub user: String,
    /// bcrypt hash of the password.
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`, default `127.0.0.1:8080`.
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DB_PATH`, default `./lnchat.db`.
    pub db_path: PathBuf,

    /// Env: `LN_BACKEND` (`lnd` | `sim`), default `sim`.
    pub backend: Backend,

    /// Both of `TLS_CERT_PATH` and `TLS_KEY_PATH`, or plain HTTP.
    pub tls: Option<TlsPaths>,

    /// `BASIC_AUTH_USER` and `BASIC_AUTH_PASSWORD_HASH`, or no auth.
    pub basic_auth: Option<BasicAuthConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([127, 0, 0, 1], 8080).into(),
            db_path: PathBuf::from("./lnchat.db"),
            backend: Backend::Sim {
                alias: "lnchat".to_string(),
            },
            tls: None,
            basic_auth: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = var("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        config.backend = match var("LN_BACKEND").as_deref().unwrap_or("sim") {
            "sim" => Backend::Sim {
                alias: var("SIM_ALIAS").unwrap_or_else(|| "lnchat".to_string()),
            },
            "lnd" => Backend::Lnd {
                rest_url: var("LND_REST_URL")
                    .unwrap_or_else(|| "https://127.0.0.1:8080".to_string()),
                macaroon_path: var("LND_MACAROON_PATH").map(PathBuf::from),
                tls_cert_path: var("LND_TLS_CERT_PATH").map(PathBuf::from),
            },
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        config.tls = match (var("TLS_CERT_PATH"), var("TLS_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("TLS_CERT_PATH", "TLS_KEY_PATH")),
            (None, Some(_)) => return Err(ConfigError::Missing("TLS_KEY_PATH", "TLS_CERT_PATH")),
        };

        config.basic_auth = match (var("BASIC_AUTH_USER"), var("BASIC_AUTH_PASSWORD_HASH")) {
            (Some(user), Some(password_hash)) => Some(BasicAuthConfig {
                user,
                password_hash,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::Missing(
                    "BASIC_AUTH_USER",
                    "BASIC_AUTH_PASSWORD_HASH",
                ))
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing(
                    "BASIC_AUTH_PASSWORD_HASH",
                    "BASIC_AUTH_USER",
                ))
            }
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 8080).into());
        assert_eq!(
            config.backend,
            Backend::Sim {
                alias: "lnchat".into()
            }
        );
        assert!(config.tls.is_none());
        assert!(config.basic_auth.is_none());
    }

    #[test]
    fn test_lnd_backend() {
        let config = load(&[
            ("LN_BACKEND", "lnd"),
            ("LND_REST_URL", "https://node:8080"),
            ("LND_MACAROON_PATH", "/tmp/admin.macaroon"),
            ("HTTP_ADDR", "0.0.0.0:9000"),
        ])
        .unwrap();
        assert_eq!(
            config.backend,
            Backend::Lnd {
                rest_url: "https://node:8080".into(),
                macaroon_path: Some("/tmp/admin.macaroon".into()),
                tls_cert_path: None,
            }
        );
        assert_eq!(config.http_addr.port(), 9000);
    }

    #[test]
    fn test_invalid_http_addr_keeps_default() {
        let config = load(&[("HTTP_ADDR", "nonsense")]).unwrap();
        assert_eq!(config.http_addr.port(), 8080);
    }

    #[test]
    fn test_half_configured_pairs_are_rejected() {
        assert!(matches!(
            load(&[("TLS_CERT_PATH", "cert.pem")]),
            Err(ConfigError::Missing("TLS_CERT_PATH", _))
        ));
        assert!(matches!(
            load(&[("BASIC_AUTH_PASSWORD_HASH", "$2b$04$x")]),
            Err(ConfigError::Missing("BASIC_AUTH_PASSWORD_HASH", _))
        ));
        assert!(matches!(
            load(&[("LN_BACKEND", "cln")]),
            Err(ConfigError::UnknownBackend(_))
        ));
    }
}
