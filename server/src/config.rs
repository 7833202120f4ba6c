//! Server configuration module.
//!
//! Parses configuration from environment variables for the Beer API server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BEERAPI_SECRET_KEY` | Yes | - | HMAC secret used to sign access tokens |
//! | `PORT` | No | 3000 | HTTP server port |
//! | `BEERAPI_URL_PREFIX` | No | `/api/v1` | Prefix for all REST routes |
//! | `BEERAPI_BASE_URL` | No | `http://localhost:{PORT}` | Absolute base for generated links |
//! | `BEERAPI_WS_IDLE_TIMEOUT_SECS` | No | 0 (disabled) | Close silent websockets after this long |
//! | `BEERAPI_WS_MAX_MALFORMED_FRAMES` | No | 0 (unlimited) | Consecutive malformed frames tolerated |

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::connection::ConnectionSettings;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 3000;

/// Default prefix for REST routes.
const DEFAULT_URL_PREFIX: &str = "/api/v1";

/// Secrets shorter than this are accepted but flagged.
const MIN_RECOMMENDED_SECRET_LEN: usize = 32;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret for signing and verifying access tokens.
    pub secret_key: String,

    /// HTTP server port.
    pub port: u16,

    /// Prefix mounted in front of every REST route (e.g. `/api/v1`).
    pub url_prefix: String,

    /// Absolute base URL used when building `Link` headers and self links.
    pub base_url: String,

    /// Websocket connection tunables.
    pub connection: ConnectionSettings,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `BEERAPI_SECRET_KEY` is missing or empty
    /// - The port or a numeric websocket setting is not a valid number
    /// - The URL prefix does not start with `/`
    ///
    /// # Example
    ///
    /// ```no_run
    /// use beerapi_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let secret_key = match env::var("BEERAPI_SECRET_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => return Err(ConfigError::MissingEnvVar("BEERAPI_SECRET_KEY".to_string())),
        };
        let url_prefix = env::var("BEERAPI_URL_PREFIX")
            .unwrap_or_else(|_| DEFAULT_URL_PREFIX.to_string());
        let base_url =
            env::var("BEERAPI_BASE_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));

        let idle_secs = parse_u64_env("BEERAPI_WS_IDLE_TIMEOUT_SECS")?;
        let max_malformed = parse_u64_env("BEERAPI_WS_MAX_MALFORMED_FRAMES")?;
        let max_malformed_frames =
            u32::try_from(max_malformed).map_err(|_| ConfigError::InvalidFormat {
                var: "BEERAPI_WS_MAX_MALFORMED_FRAMES".to_string(),
                message: "value too large".to_string(),
            })?;

        let config = Self {
            secret_key,
            port,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            connection: ConnectionSettings {
                idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
                max_malformed_frames,
            },
        };

        config.validate()?;

        if config.secret_key.len() < MIN_RECOMMENDED_SECRET_LEN {
            warn!(
                length = config.secret_key.len(),
                recommended = MIN_RECOMMENDED_SECRET_LEN,
                "BEERAPI_SECRET_KEY is short; use a longer random secret in production"
            );
        }

        if config.connection.max_malformed_frames == 0 {
            warn!("Malformed websocket frames are tolerated without limit");
        }

        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.url_prefix.is_empty() && !self.url_prefix.starts_with('/') {
            return Err(ConfigError::InvalidFormat {
                var: "BEERAPI_URL_PREFIX".to_string(),
                message: format!("must start with '/', got '{}'", self.url_prefix),
            });
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidFormat {
                var: "BEERAPI_BASE_URL".to_string(),
                message: format!("must be an http(s) URL, got '{}'", self.base_url),
            });
        }

        Ok(())
    }

    /// Absolute URL of a REST resource path such as `/beer`.
    #[must_use]
    pub fn resource_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.url_prefix, path)
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse an optional non-negative integer variable, defaulting to 0.
fn parse_u64_env(name: &str) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(0),
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|err: std::num::ParseIntError| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: err.to_string(),
            }),
        Err(_) => Ok(0),
    }
}
