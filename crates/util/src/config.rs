use std::{env, fmt, net::SocketAddr, path::PathBuf, time::Duration};

use super::{env_parse_or, server_bind_address, DEFAULT_DATABASE_URL};

/// Host pattern SNS signing certificates are expected to be served from.
pub const DEFAULT_CERT_HOST_PATTERN: &str = r"^sns\.[a-z0-9-]+\.amazonaws\.com(\.cn)?$";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_FLUSH_MAX_RETRIES: u32 = 10;
const DEFAULT_CERT_CACHE_CAPACITY: usize = 64;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// JSON file listing the trigger instances served by this process.
    pub triggers_file: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Conflict retries after the first flush attempt of trigger storage.
    pub flush_max_retries: u32,
    pub cert_cache_capacity: usize,
    /// `None` disables the signing certificate host check.
    pub cert_host_pattern: Option<String>,
    pub http_timeout: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url = env::var("DATABASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let triggers_file = env::var("SNS_TRIGGERS_FILE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let poll_interval_secs = positive("SNS_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        let flush_max_retries = number("SNS_FLUSH_MAX_RETRIES", DEFAULT_FLUSH_MAX_RETRIES)?;
        let cert_cache_capacity = positive("SNS_CERT_CACHE_CAPACITY", DEFAULT_CERT_CACHE_CAPACITY)?;
        let http_timeout_secs = positive("SNS_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;

        // Present-but-empty turns the host check off.
        let cert_host_pattern = match env::var("SNS_CERT_HOST_PATTERN") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => Some(DEFAULT_CERT_HOST_PATTERN.to_string()),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            triggers_file,
            poll_interval: Duration::from_secs(poll_interval_secs),
            flush_max_retries,
            cert_cache_capacity,
            cert_host_pattern,
            http_timeout: Duration::from_secs(http_timeout_secs),
        })
    }
}

fn number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    env_parse_or(name, default).map_err(|value| ConfigError::InvalidNumber { name, value })
}

fn positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let value = number(name, default)?;
    if value == T::default() {
        return Err(ConfigError::ZeroValue(name));
    }
    Ok(value)
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { name: &'static str, value: String },
    ZeroValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a non-negative integer (got {value})")
            }
            Self::ZeroValue(name) => write!(f, "{name} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
