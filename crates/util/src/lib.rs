pub mod config;

use std::{env, net::SocketAddr, str::FromStr};

pub use config::{AppConfig, ConfigError, Environment};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://sns-trigger.db?mode=rwc";

/// Loads environment variables from `.env` when available.
///
/// Missing files are ignored so the function is safe in production builds
/// where dotenv files are not deployed.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Returns the address the HTTP server should bind to.
///
/// The value is resolved from the `APP_BIND_ADDR` environment variable and
/// falls back to [`DEFAULT_BIND_ADDR`] when the variable is not set.
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    let value = env::var("APP_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    value.parse()
}

/// Reads `name` and parses it, returning `default` when the variable is unset
/// or blank. The raw value is returned on parse failure so callers can report it.
pub fn env_parse_or<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| raw),
        _ => Ok(default),
    }
}

/// Serializes tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn returns_default_address_when_env_missing() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_BIND_ADDR");
        let addr = server_bind_address().expect("default address is valid");
        assert_eq!(addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn env_parse_or_falls_back_and_reports_garbage() {
        let _lock = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("SNS_UTIL_TEST_NUMBER");
        assert_eq!(env_parse_or("SNS_UTIL_TEST_NUMBER", 7u32), Ok(7));

        env::set_var("SNS_UTIL_TEST_NUMBER", " 12 ");
        assert_eq!(env_parse_or("SNS_UTIL_TEST_NUMBER", 7u32), Ok(12));

        env::set_var("SNS_UTIL_TEST_NUMBER", "twelve");
        assert_eq!(
            env_parse_or("SNS_UTIL_TEST_NUMBER", 7u32),
            Err("twelve".to_string())
        );
        env::remove_var("SNS_UTIL_TEST_NUMBER");
    }
}
