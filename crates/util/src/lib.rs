pub mod config;

use std::{env, net::SocketAddr};

pub use config::{AppConfig, BlobConfig, ConfigError, Environment};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://school-fees.db?mode=rwc";

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
    env_or("APP_BIND_ADDR", DEFAULT_BIND_ADDR).parse()
}

/// Reads a variable, treating unset and blank values alike.
pub(crate) fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::sync::{LazyLock, Mutex, MutexGuard};

    static ENV_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    pub const VARIABLES: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "APP_TOKEN_SECRET",
        "SCHOOL_TIMEZONE",
        "RECEIPT_MAX_BYTES",
        "BLOB_BACKEND",
        "BLOB_LOCAL_DIR",
        "BLOB_PUBLIC_BASE_URL",
        "BLOB_API_URL",
        "BLOB_API_TOKEN",
        "EVENTS_HEARTBEAT_SECS",
        "APP_SEED_DEMO",
    ];

    /// Serializes env-mutating tests and starts each from a clean slate.
    pub fn lock_clean() -> MutexGuard<'static, ()> {
        let guard = ENV_GUARD
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for name in VARIABLES {
            std::env::remove_var(name);
        }
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::lock_clean;

    #[test]
    fn returns_default_address_when_env_missing() {
        let _lock = lock_clean();
        let addr = server_bind_address().expect("default address is valid");
        assert_eq!(addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn parses_custom_address_from_env() {
        let _lock = lock_clean();
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        let addr = server_bind_address().expect("custom address should parse");
        assert_eq!(addr.to_string(), "0.0.0.0:9000");
        env::remove_var("APP_BIND_ADDR");
    }

    #[test]
    fn blank_values_count_as_unset() {
        let _lock = lock_clean();
        env::set_var("DATABASE_URL", "   ");
        assert_eq!(env_or("DATABASE_URL", DEFAULT_DATABASE_URL), DEFAULT_DATABASE_URL);
        env::remove_var("DATABASE_URL");
    }
}
