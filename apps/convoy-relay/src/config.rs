use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::directory::DuplicatePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET must be set and non-empty")]
    MissingJwtSecret,
    #[error("SSL_ENABLED requires SSL_KEY_PATH and SSL_CERT_PATH")]
    IncompleteTls,
    #[error("invalid {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ssl_enabled: bool,
    pub ssl_key_path: Option<PathBuf>,
    pub ssl_cert_path: Option<PathBuf>,
    pub jwt_secret: String,
    pub duplicate_policy: DuplicatePolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value: raw,
            })?,
            Err(_) => 8080,
        };

        let ssl_enabled = env::var("SSL_ENABLED")
            .map(|raw| matches!(raw.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let ssl_key_path = env::var("SSL_KEY_PATH").ok().map(PathBuf::from);
        let ssl_cert_path = env::var("SSL_CERT_PATH").ok().map(PathBuf::from);
        if ssl_enabled && (ssl_key_path.is_none() || ssl_cert_path.is_none()) {
            return Err(ConfigError::IncompleteTls);
        }

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }

        let duplicate_policy = match env::var("DUPLICATE_POLICY") {
            Ok(raw) => match raw.as_str() {
                "reject-new" => DuplicatePolicy::RejectNew,
                "displace-old" => DuplicatePolicy::DisplaceOld,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "DUPLICATE_POLICY",
                        value: raw,
                    })
                }
            },
            Err(_) => DuplicatePolicy::RejectNew,
        };

        Ok(Self {
            port,
            ssl_enabled,
            ssl_key_path,
            ssl_cert_path,
            jwt_secret,
            duplicate_policy,
        })
    }
}
