use std::time::Duration;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Gateway settings, read from the environment at startup.
#[derive(Clone)]
pub struct Config {
    /// Address the listener binds, `LISTEN_HOST:HTTP_PORT`
    pub listen_addr: String,
    pub log_level: Level,
    /// Comma-separated identity service URLs
    pub identity_service_addresses: String,
    /// HMAC secret access tokens are signed with
    pub secret: String,
    pub token_issuer: Option<String>,
    pub token_audience: Option<String>,
    /// Adds `Secure` to the refresh token cookie
    pub refresh_cookie_secure: bool,
    pub upstream_connect_timeout: Duration,
    pub upstream_request_timeout: Duration,
    /// How long in-flight requests may run after a shutdown signal
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let host = get("LISTEN_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match get("HTTP_PORT") {
            Some(value) => value.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "HTTP_PORT",
                value,
                reason: "expected a port number",
            })?,
            None => 8080,
        };

        let log_level = parse_level(&required("LOG_LEVEL")?)?;

        Ok(Self {
            listen_addr: format!("{}:{}", host, port),
            log_level,
            identity_service_addresses: required("IDENTITY_SERVICE_ADDRESSES")?,
            secret: required("ACCESS_TOKEN_SECRET")?,
            token_issuer: get("ACCESS_TOKEN_ISSUER"),
            token_audience: get("ACCESS_TOKEN_AUDIENCE"),
            refresh_cookie_secure: parse_bool("REFRESH_COOKIE_SECURE", get("REFRESH_COOKIE_SECURE"), true)?,
            upstream_connect_timeout: parse_secs(
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                get("UPSTREAM_CONNECT_TIMEOUT_SECS"),
                5,
            )?,
            upstream_request_timeout: parse_secs(
                "UPSTREAM_REQUEST_TIMEOUT_SECS",
                get("UPSTREAM_REQUEST_TIMEOUT_SECS"),
                30,
            )?,
            shutdown_grace: parse_secs("SHUTDOWN_GRACE_SECS", get("SHUTDOWN_GRACE_SECS"), 5)?,
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("log_level", &self.log_level)
            .field("identity_service_addresses", &self.identity_service_addresses)
            .field("secret", &"<redacted>")
            .field("token_issuer", &self.token_issuer)
            .field("token_audience", &self.token_audience)
            .field("refresh_cookie_secure", &self.refresh_cookie_secure)
            .field("upstream_connect_timeout", &self.upstream_connect_timeout)
            .field("upstream_request_timeout", &self.upstream_request_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

fn parse_level(value: &str) -> Result<Level, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ConfigError::Invalid {
            key: "LOG_LEVEL",
            value: value.to_string(),
            reason: "expected trace, debug, info, warn or error",
        }),
    }
}

fn parse_bool(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected true or false",
        }),
    }
}

fn parse_secs(key: &'static str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(Duration::from_secs(default));
    };
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a positive number of seconds",
        }),
    }
}
