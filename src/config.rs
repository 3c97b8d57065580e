//! Configuration for the herder.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Main configuration, loaded from the environment (`HERDER_*` keys).
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the public HTTP server listens on.
    pub port: u16,
    /// Base directory under which daemon mount directories are created.
    pub mounts: PathBuf,
    /// Advertised base URL, substituted into the bootstrap script.
    pub url: String,
    /// Name of the linked webstrates document-server container.
    pub webstrates: String,
    /// Whether to mount the golem reverse proxy and link golems to the
    /// webstrates container.
    pub proxy: bool,
    /// Image used for golem containers.
    pub golem_image: String,
    /// Shared secret guarding the token generation endpoint. When unset the
    /// endpoint replies 405.
    pub token_password: Option<SecretString>,
    /// Path to the RSA private key PEM used for token signing.
    pub privkey: PathBuf,
    /// Path to the RSA public key PEM used for token validation.
    pub pubkey: PathBuf,
    /// Path to the credit ledger database file.
    pub meter_db: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            port: optional_env("HERDER_PORT")?
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "HERDER_PORT".to_string(),
                    message: format!("must be a port number: {e}"),
                })?
                .unwrap_or(8000),
            mounts: optional_env("HERDER_MOUNTS")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/herder-mounts")),
            url: optional_env("HERDER_URL")?.unwrap_or_else(|| "localhost".to_string()),
            webstrates: optional_env("HERDER_WEBSTRATES")?
                .unwrap_or_else(|| "webstrates".to_string()),
            proxy: optional_env("HERDER_PROXY")?
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "HERDER_PROXY".to_string(),
                    message: format!("must be true or false: {e}"),
                })?
                .unwrap_or(false),
            golem_image: optional_env("HERDER_GOLEM_IMAGE")?
                .unwrap_or_else(|| "webstrates/golem".to_string()),
            token_password: optional_env("HERDER_TOKEN_PASSWORD")?.map(SecretString::from),
            privkey: optional_env("HERDER_PRIVKEY")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("key.pem")),
            pubkey: optional_env("HERDER_PUBKEY")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("cert.pem")),
            meter_db: optional_env("HERDER_METER_DB")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("meter.db")),
        })
    }

    /// The configured token password, if any.
    pub fn token_password(&self) -> Option<&str> {
        self.token_password.as_ref().map(|p| p.expose_secret())
    }
}

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}
