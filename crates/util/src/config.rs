use std::{fmt, net::SocketAddr, path::PathBuf};

use url::Url;

use super::{env_opt, env_or, server_bind_address, DEFAULT_DATABASE_URL};

const DEV_TOKEN_SECRET: &str = "dev-only-token-secret";
const DEFAULT_RECEIPT_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_HEARTBEAT_SECS: u64 = 25;
const DEFAULT_BLOB_DIR: &str = "./blob-data";
const DEFAULT_BLOB_PUBLIC_URL: &str = "http://127.0.0.1:8080/blobs";

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

/// Where receipt images are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobConfig {
    /// Files on local disk, served from `public_base_url` by something else.
    Local {
        root: PathBuf,
        public_base_url: Url,
    },
    /// A remote blob service speaking the put/list/delete HTTP API.
    Http { api_url: Url, token: String },
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub token_secret: Vec<u8>,
    pub school_timezone: String,
    pub receipt_max_bytes: u64,
    pub blob: BlobConfig,
    pub events_heartbeat_secs: u64,
    pub seed_demo: bool,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_str(&env_or("APP_ENV", "development"))?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let token_secret = match env_opt("APP_TOKEN_SECRET") {
            Some(secret) => secret.into_bytes(),
            None if environment == Environment::Production => {
                return Err(ConfigError::MissingVariable("APP_TOKEN_SECRET"));
            }
            None => DEV_TOKEN_SECRET.as_bytes().to_vec(),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            token_secret,
            school_timezone: env_or("SCHOOL_TIMEZONE", "UTC"),
            receipt_max_bytes: parse_u64("RECEIPT_MAX_BYTES", DEFAULT_RECEIPT_MAX_BYTES)?,
            blob: blob_from_env()?,
            events_heartbeat_secs: parse_u64("EVENTS_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?,
            seed_demo: environment.is_development() && parse_flag("APP_SEED_DEMO")?,
        })
    }
}

fn blob_from_env() -> Result<BlobConfig, ConfigError> {
    match env_or("BLOB_BACKEND", "local").as_str() {
        "local" => Ok(BlobConfig::Local {
            root: PathBuf::from(env_or("BLOB_LOCAL_DIR", DEFAULT_BLOB_DIR)),
            public_base_url: parse_url(
                "BLOB_PUBLIC_BASE_URL",
                &env_or("BLOB_PUBLIC_BASE_URL", DEFAULT_BLOB_PUBLIC_URL),
            )?,
        }),
        "http" => {
            let raw_url =
                env_opt("BLOB_API_URL").ok_or(ConfigError::MissingVariable("BLOB_API_URL"))?;
            let token =
                env_opt("BLOB_API_TOKEN").ok_or(ConfigError::MissingVariable("BLOB_API_TOKEN"))?;
            Ok(BlobConfig::Http {
                api_url: parse_url("BLOB_API_URL", &raw_url)?,
                token,
            })
        }
        other => Err(ConfigError::InvalidBlobBackend(other.to_string())),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_opt(name) {
        Some(value) => value
            .parse::<u64>()
            .ok()
            .filter(|parsed| *parsed > 0)
            .ok_or(ConfigError::InvalidNumber { name, value }),
        None => Ok(default),
    }
}

fn parse_flag(name: &'static str) -> Result<bool, ConfigError> {
    match env_opt(name).as_deref() {
        None | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => Err(ConfigError::InvalidFlag {
            name,
            value: other.to_string(),
        }),
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { name, source })
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVariable(&'static str),
    InvalidNumber {
        name: &'static str,
        value: String,
    },
    InvalidFlag {
        name: &'static str,
        value: String,
    },
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },
    InvalidBlobBackend(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVariable(name) => write!(f, "{name} must be set"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::InvalidFlag { name, value } => {
                write!(f, "{name} must be 'true' or 'false' (got {value})")
            }
            Self::InvalidUrl { name, source } => write!(f, "invalid {name} value: {source}"),
            Self::InvalidBlobBackend(value) => {
                write!(f, "BLOB_BACKEND must be 'local' or 'http' (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
