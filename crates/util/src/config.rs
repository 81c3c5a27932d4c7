use std::{env, fmt, net::SocketAddr};

use super::server_bind_address;

const DEFAULT_DATABASE_URL: &str = "sqlite://roster.db?mode=rwc";
const DEFAULT_TEAM_ABSENCE_THRESHOLD: f64 = 0.3;
const DEFAULT_SSE_RING_MAX: usize = 256;
const DEFAULT_SSE_RING_TTL_SECS: u64 = 300;
const DEFAULT_SSE_HEARTBEAT_SECS: u64 = 25;

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
    pub auth_token_secret: Vec<u8>,
    pub team_absence_threshold: f64,
    pub sse_ring_max: usize,
    pub sse_ring_ttl_secs: u64,
    pub sse_heartbeat_secs: u64,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        // Production refuses to start without an explicit signing secret; the
        // other environments fall back to a fixed development value.
        let auth_token_secret = match env::var("AUTH_TOKEN_SECRET") {
            Ok(value) if !value.is_empty() => value.into_bytes(),
            _ if environment == Environment::Production => {
                return Err(ConfigError::MissingTokenSecret)
            }
            _ => b"dev-token-secret".to_vec(),
        };

        let team_absence_threshold = parse_var(
            "TEAM_ABSENCE_THRESHOLD",
            DEFAULT_TEAM_ABSENCE_THRESHOLD,
            |raw| raw.parse::<f64>().ok().filter(|v| (0.0..=1.0).contains(v)),
        )?;
        let sse_ring_max = parse_var("SSE_RING_MAX", DEFAULT_SSE_RING_MAX, |raw| {
            raw.parse::<usize>().ok().filter(|v| *v > 0)
        })?;
        let sse_ring_ttl_secs = parse_var("SSE_RING_TTL_SECS", DEFAULT_SSE_RING_TTL_SECS, |raw| {
            raw.parse::<u64>().ok()
        })?;
        let sse_heartbeat_secs =
            parse_var("SSE_HEARTBEAT_SECS", DEFAULT_SSE_HEARTBEAT_SECS, |raw| {
                raw.parse::<u64>().ok().filter(|v| *v > 0)
            })?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            auth_token_secret,
            team_absence_threshold,
            sse_ring_max,
            sse_ring_ttl_secs,
            sse_heartbeat_secs,
        })
    }
}

fn parse_var<T>(
    name: &'static str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse(&raw).ok_or(ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingTokenSecret,
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingTokenSecret => {
                write!(f, "AUTH_TOKEN_SECRET must be set when APP_ENV is production")
            }
            Self::InvalidValue { name, value } => {
                write!(f, "invalid {name} value: {value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
