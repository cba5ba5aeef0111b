//! Configuration management for Steam Sentry.
//!
//! Configuration can be set via environment variables:
//! - `STEAM_API_KEY` - Required. Steam Web API key for the profile checks.
//! - `INGEST_API_URL` - Required. Downstream ingest endpoint for approved profiles.
//! - `INGEST_API_KEY` - Required. Credential for the ingest endpoint.
//! - `HOST` - Optional. Server host. Defaults to `0.0.0.0`.
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `WORKING_DIR` - Optional. Directory holding the JSON state files. Defaults to `.`.
//! - `BACKOFF_SEQUENCE_MINUTES` - Optional. Comma-separated 429 backoff minutes.
//! - `COOLDOWN_CONNECTION_RESET_MS` / `COOLDOWN_TIMEOUT_MS` /
//!   `COOLDOWN_DNS_FAILURE_MS` / `COOLDOWN_SOCKS_ERROR_MS` /
//!   `COOLDOWN_PERMANENT_MS` - Optional. Fixed cooldown durations per error
//!   category.
//! - `STEAM_API_BASE_URL` / `STEAM_COMMUNITY_BASE_URL` - Optional. Upstream
//!   base URLs, overridable so a stub server can stand in for Steam.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Default 429 backoff sequence, in minutes.
pub const DEFAULT_BACKOFF_SEQUENCE: [u64; 10] = [1, 2, 4, 8, 16, 32, 60, 120, 240, 480];

/// Fixed cooldown durations for the non-429 error categories.
#[derive(Debug, Clone)]
pub struct CooldownDurations {
    pub connection_reset: Duration,
    pub timeout: Duration,
    pub dns_failure: Duration,
    pub socks_error: Duration,
    /// Defined and configurable but not produced by any categoriser rule.
    pub permanent: Duration,
}

impl Default for CooldownDurations {
    fn default() -> Self {
        Self {
            connection_reset: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(5 * 60),
            dns_failure: Duration::from_secs(10 * 60),
            socks_error: Duration::from_secs(10 * 60),
            permanent: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Steam Web API key
    pub steam_api_key: String,

    /// Downstream ingest endpoint for approved profiles
    pub ingest_api_url: String,

    /// Credential for the ingest endpoint
    pub ingest_api_key: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory holding the queue, proxy and cooldown JSON files
    pub working_dir: PathBuf,

    /// 429 backoff sequence in minutes, saturating at the final element
    pub backoff_sequence: Vec<u64>,

    /// Fixed durations for non-429 cooldown categories
    pub cooldowns: CooldownDurations,

    /// Steam Web API base URL
    pub steam_api_base: String,

    /// Steam community base URL (inventory pages)
    pub community_base: String,

    /// Delay between dispatched profiles in the main loop
    pub processing_delay: Duration,

    /// Idle delay when the queue has nothing processable
    pub empty_queue_delay: Duration,

    /// Interval of the deferred-check reactivation loop
    pub reactivation_interval: Duration,

    /// Minimum gap between any two upstream calls, across all connections
    pub request_gap: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if any of `STEAM_API_KEY`,
    /// `INGEST_API_URL` or `INGEST_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let steam_api_key = require_env("STEAM_API_KEY")?;
        let ingest_api_url = require_env("INGEST_API_URL")?;
        let ingest_api_key = require_env("INGEST_API_KEY")?;

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let working_dir = std::env::var("WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let backoff_sequence = match std::env::var("BACKOFF_SEQUENCE_MINUTES") {
            Ok(raw) => parse_backoff_sequence(&raw)?,
            Err(_) => DEFAULT_BACKOFF_SEQUENCE.to_vec(),
        };

        let defaults = CooldownDurations::default();
        let cooldowns = CooldownDurations {
            connection_reset: env_duration_ms(
                "COOLDOWN_CONNECTION_RESET_MS",
                defaults.connection_reset,
            )?,
            timeout: env_duration_ms("COOLDOWN_TIMEOUT_MS", defaults.timeout)?,
            dns_failure: env_duration_ms("COOLDOWN_DNS_FAILURE_MS", defaults.dns_failure)?,
            socks_error: env_duration_ms("COOLDOWN_SOCKS_ERROR_MS", defaults.socks_error)?,
            permanent: env_duration_ms("COOLDOWN_PERMANENT_MS", defaults.permanent)?,
        };

        let steam_api_base = std::env::var("STEAM_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.steampowered.com".to_string());
        let community_base = std::env::var("STEAM_COMMUNITY_BASE_URL")
            .unwrap_or_else(|_| "https://steamcommunity.com".to_string());

        Ok(Self {
            steam_api_key,
            ingest_api_url,
            ingest_api_key,
            host,
            port,
            working_dir,
            backoff_sequence,
            cooldowns,
            steam_api_base: steam_api_base.trim_end_matches('/').to_string(),
            community_base: community_base.trim_end_matches('/').to_string(),
            processing_delay: Duration::from_millis(350),
            empty_queue_delay: Duration::from_secs(5),
            reactivation_interval: Duration::from_secs(60),
            request_gap: Duration::from_secs(1),
        })
    }

    /// Path of the outbound-connection config file.
    pub fn proxies_path(&self) -> PathBuf {
        self.working_dir.join("config_proxies.json")
    }

    /// Path of the persisted cooldown matrix.
    pub fn cooldowns_path(&self) -> PathBuf {
        self.working_dir.join("endpoint_cooldowns.json")
    }

    /// Path of the durable profile queue.
    pub fn queue_path(&self) -> PathBuf {
        self.working_dir.join("profiles_queue.json")
    }

    /// Create a config with custom values (useful for testing).
    pub fn for_tests(working_dir: PathBuf) -> Self {
        Self {
            steam_api_key: "test-key".to_string(),
            ingest_api_url: "http://127.0.0.1:0/links".to_string(),
            ingest_api_key: "test-ingest-key".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            working_dir,
            backoff_sequence: DEFAULT_BACKOFF_SEQUENCE.to_vec(),
            cooldowns: CooldownDurations::default(),
            steam_api_base: "https://api.steampowered.com".to_string(),
            community_base: "https://steamcommunity.com".to_string(),
            processing_delay: Duration::from_millis(350),
            empty_queue_delay: Duration::from_secs(5),
            reactivation_interval: Duration::from_secs(60),
            request_gap: Duration::from_secs(1),
        }
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))?;
            if ms == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be > 0".to_string(),
                ));
            }
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

/// Parse a comma-separated list of strictly positive minute values.
fn parse_backoff_sequence(raw: &str) -> Result<Vec<u64>, ConfigError> {
    let name = "BACKOFF_SEQUENCE_MINUTES";
    let mut sequence = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let minutes: u64 = trimmed
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}: {}", trimmed, e)))?;
        if minutes == 0 {
            return Err(ConfigError::InvalidValue(
                name.to_string(),
                "entries must be strictly positive".to_string(),
            ));
        }
        sequence.push(minutes);
    }
    if sequence.is_empty() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "sequence must have at least one entry".to_string(),
        ));
    }
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_parses_and_trims() {
        assert_eq!(parse_backoff_sequence("1,2,4").unwrap(), vec![1, 2, 4]);
        assert_eq!(parse_backoff_sequence(" 5 , 10 ").unwrap(), vec![5, 10]);
    }

    #[test]
    fn backoff_sequence_rejects_zero_and_garbage() {
        assert!(parse_backoff_sequence("1,0,4").is_err());
        assert!(parse_backoff_sequence("one minute").is_err());
        assert!(parse_backoff_sequence("").is_err());
    }

    #[test]
    fn default_durations_match_documented_values() {
        let d = CooldownDurations::default();
        assert_eq!(d.connection_reset, Duration::from_secs(300));
        assert_eq!(d.timeout, Duration::from_secs(300));
        assert_eq!(d.dns_failure, Duration::from_secs(600));
        assert_eq!(d.socks_error, Duration::from_secs(600));
        assert_eq!(d.permanent, Duration::from_secs(86_400));
    }

    #[test]
    fn default_backoff_sequence_saturates_at_eight_hours() {
        assert_eq!(DEFAULT_BACKOFF_SEQUENCE.last(), Some(&480));
        assert!(DEFAULT_BACKOFF_SEQUENCE.windows(2).all(|w| w[0] < w[1]));
    }
}
