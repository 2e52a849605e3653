//! Service configuration
//!
//! Every setting comes from the environment and is read once at startup
//! into a typed [`Config`]. Secret validation is fatal here: a missing or
//! short JWT secret aborts boot rather than running with weak keys.

use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::keys::KeyError;
use crate::auth::KeySet;
use crate::store::StoreConfig;

/// Default key rotation cadence.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_SERVER_ADDR: &str = ":8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingVar(&'static str),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error("invalid SERVER_ADDR: {0}")]
    InvalidAddr(String),
    #[error("invalid JWT_KEY_ROTATION_INTERVAL: {0}")]
    InvalidDuration(String),
}

/// Deployment environment; controls cookie Secure flags and log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

pub struct Config {
    pub server_addr: SocketAddr,
    pub env: Environment,
    /// Exact origins allowed on the HTTP and WS surfaces.
    pub allowed_origins: Vec<String>,
    pub store: StoreConfig,
    pub keys: KeySet,
    pub rotation_interval: Duration,
    /// Enables the `X-Admin-Token` admin path when set.
    pub admin_api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let current = required_env("JWT_SECRET")?;
        let refresh = required_env("JWT_REFRESH_SECRET")?;
        let previous = optional_env("JWT_SECRET_PREVIOUS");
        let next = optional_env("JWT_SECRET_NEXT");
        let key_id = optional_env("JWT_KEY_ID");
        let keys = KeySet::new(current, refresh, previous, next, key_id)?;

        let rotation_interval = match optional_env("JWT_KEY_ROTATION_INTERVAL") {
            Some(raw) => parse_duration(&raw).ok_or(ConfigError::InvalidDuration(raw))?,
            None => DEFAULT_ROTATION_INTERVAL,
        };

        let allowed_origins = optional_env("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let env = match optional_env("ENV").as_deref() {
            Some("development") => Environment::Development,
            _ => Environment::Production,
        };

        let server_addr =
            parse_server_addr(&optional_env("SERVER_ADDR").unwrap_or_else(|| {
                DEFAULT_SERVER_ADDR.to_string()
            }))?;

        let store = StoreConfig {
            addr: optional_env("REDIS_ADDR").unwrap_or_else(|| "localhost:6379".to_string()),
            password: optional_env("REDIS_PASSWORD").unwrap_or_default(),
            db: 0,
        };

        Ok(Config {
            server_addr,
            env,
            allowed_origins,
            store,
            keys,
            rotation_interval,
            admin_api_token: optional_env("ADMIN_API_TOKEN"),
        })
    }
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingVar(name))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// A bare `:port` binds all interfaces.
fn parse_server_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map_err(|_| ConfigError::InvalidAddr(raw.to_string()))
}

/// Parse `24h` / `30m` / `90s` / bare-seconds duration strings.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (value, unit) = match raw.char_indices().rfind(|(_, c)| c.is_ascii_digit()) {
        Some((idx, _)) => raw.split_at(idx + 1),
        None => return None,
    };
    let value: u64 = value.parse().ok()?;
    match unit {
        "h" => Some(Duration::from_secs(value * 3600)),
        "m" => Some(Duration::from_secs(value * 60)),
        "s" | "" => Some(Duration::from_secs(value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_addr() {
        assert_eq!(
            parse_server_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_server_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_server_addr("not-an-addr").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("1d"), None);
        assert_eq!(parse_duration(""), None);
    }
}
