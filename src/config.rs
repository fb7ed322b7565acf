//! Configuration module for the metrics sender.
//!
//! This module provides environment-based configuration for the sender task,
//! including buffer capacity, send cadence, endpoint defaults and the document
//! layout used on the wire.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default database URL metrics are posted to
const DEFAULT_DATABASE_URL: &str = "http://localhost:8086/metrics";

/// Default device location appended to the database URL
const DEFAULT_DEVICE_LOCATION: &str = "default-location";

/// Default metrics buffer capacity in bytes
const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Smallest buffer that still holds the document framing and a few entries
const MIN_BUFFER_SIZE: usize = 64;

/// Largest buffer we are willing to reserve up front
const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Default period between send cycles in seconds (5 minutes)
const DEFAULT_SEND_PERIOD_SECS: u64 = 300;

const MIN_SEND_PERIOD_SECS: u64 = 1;
const MAX_SEND_PERIOD_SECS: u64 = 86_400;

/// Default priority of the sender task
const DEFAULT_TASK_PRIORITY: u8 = 5;
const MAX_TASK_PRIORITY: u8 = 25;

/// Default stack size of the sender task in bytes
const DEFAULT_TASK_STACK_SIZE: usize = 256 * 1024;
const MIN_TASK_STACK_SIZE: usize = 16 * 1024;
const MAX_TASK_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Default HTTP request timeout in milliseconds
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
const MIN_HTTP_TIMEOUT_MS: u64 = 100;
const MAX_HTTP_TIMEOUT_MS: u64 = 120_000;

/// Years before this are treated as an unsynchronized clock
const DEFAULT_MIN_VALID_YEAR: i32 = 2020;

/// Structural framing of the JSON document built each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentLayout {
    /// `{"name":value,...}`
    Flat,

    /// `{"fields":{"name":{"integerValue":value},...}}`
    Fields,
}

impl FromStr for DocumentLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(DocumentLayout::Flat),
            "fields" => Ok(DocumentLayout::Fields),
            other => Err(format!("'{}' is not a document layout (flat, fields)", other)),
        }
    }
}

/// Whether an unsynchronized clock also blocks sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockPolicy {
    /// Only network reachability gates a send
    NetworkOnly,

    /// Network reachability and a valid wall clock are both required
    RequireClock,
}

impl FromStr for ClockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network_only" => Ok(ClockPolicy::NetworkOnly),
            "require_clock" => Ok(ClockPolicy::RequireClock),
            other => Err(format!(
                "'{}' is not a clock policy (network_only, require_clock)",
                other
            )),
        }
    }
}

/// Configuration for the metrics sender.
///
/// All settings can be configured via `METRICS_SENDER_*` environment variables,
/// see [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether the sender task is started at all
    pub enabled: bool,

    /// Capacity of the metrics buffer in bytes, including the terminator slot
    pub buffer_size: usize,

    /// Fixed delay between the end of one cycle and the start of the next
    pub send_period: Duration,

    /// Scheduling priority hint for the sender task
    pub task_priority: u8,

    /// Stack size of the dedicated sender thread in bytes
    pub task_stack_size: usize,

    /// HTTP request timeout duration
    pub http_timeout: Duration,

    /// Default database URL used when no endpoint URL is given
    pub database_url: String,

    /// Default device location used when no location is given
    pub device_location: String,

    /// Default authentication token used when no token is given
    pub token: Option<String>,

    /// Log the document every cycle before the readiness check
    pub print_buffer: bool,

    /// Framing of the JSON document
    pub document_layout: DocumentLayout,

    /// Readiness policy for the wall clock
    pub clock_policy: ClockPolicy,

    /// First calendar year considered a synchronized clock
    pub min_valid_year: i32,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Recognized variables (all optional):
    /// - `METRICS_SENDER_ENABLED` (default: true)
    /// - `METRICS_SENDER_BUFFER_SIZE` (default: 2048)
    /// - `METRICS_SENDER_SEND_PERIOD_SECS` (default: 300)
    /// - `METRICS_SENDER_TASK_PRIORITY` (default: 5)
    /// - `METRICS_SENDER_TASK_STACK_SIZE` (default: 262144)
    /// - `METRICS_SENDER_HTTP_TIMEOUT_MS` (default: 5000)
    /// - `METRICS_SENDER_DATABASE_URL` (default: http://localhost:8086/metrics)
    /// - `METRICS_SENDER_DEVICE_LOCATION` (default: default-location)
    /// - `METRICS_SENDER_TOKEN` (default: unset)
    /// - `METRICS_SENDER_PRINT_BUFFER` (default: false)
    /// - `METRICS_SENDER_DOCUMENT_LAYOUT` (default: fields)
    /// - `METRICS_SENDER_CLOCK_POLICY` (default: network_only)
    /// - `METRICS_SENDER_MIN_VALID_YEAR` (default: 2020)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed or is
    /// outside its allowed range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use metrics_sender::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Database URL: {}", config.database_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `from_env` is this with `std::env::var` as the lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = parse_bool(&lookup, "METRICS_SENDER_ENABLED", true)?;

        let buffer_size = parse_ranged(
            &lookup,
            "METRICS_SENDER_BUFFER_SIZE",
            DEFAULT_BUFFER_SIZE,
            MIN_BUFFER_SIZE,
            MAX_BUFFER_SIZE,
        )?;

        let send_period_secs = parse_ranged(
            &lookup,
            "METRICS_SENDER_SEND_PERIOD_SECS",
            DEFAULT_SEND_PERIOD_SECS,
            MIN_SEND_PERIOD_SECS,
            MAX_SEND_PERIOD_SECS,
        )?;

        let task_priority = parse_ranged(
            &lookup,
            "METRICS_SENDER_TASK_PRIORITY",
            DEFAULT_TASK_PRIORITY,
            0,
            MAX_TASK_PRIORITY,
        )?;

        let task_stack_size = parse_ranged(
            &lookup,
            "METRICS_SENDER_TASK_STACK_SIZE",
            DEFAULT_TASK_STACK_SIZE,
            MIN_TASK_STACK_SIZE,
            MAX_TASK_STACK_SIZE,
        )?;

        let http_timeout_ms = parse_ranged(
            &lookup,
            "METRICS_SENDER_HTTP_TIMEOUT_MS",
            DEFAULT_HTTP_TIMEOUT_MS,
            MIN_HTTP_TIMEOUT_MS,
            MAX_HTTP_TIMEOUT_MS,
        )?;

        let database_url = lookup("METRICS_SENDER_DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let database_url = database_url.trim().trim_end_matches('/').to_string();
        if database_url.is_empty() {
            return Err(ConfigError::for_var(
                "METRICS_SENDER_DATABASE_URL",
                "database URL must not be empty",
            ));
        }

        let device_location = lookup("METRICS_SENDER_DEVICE_LOCATION")
            .unwrap_or_else(|| DEFAULT_DEVICE_LOCATION.to_string());

        let token = lookup("METRICS_SENDER_TOKEN").filter(|t| !t.is_empty());

        let print_buffer = parse_bool(&lookup, "METRICS_SENDER_PRINT_BUFFER", false)?;

        let document_layout = parse_with(
            &lookup,
            "METRICS_SENDER_DOCUMENT_LAYOUT",
            DocumentLayout::Fields,
        )?;

        let clock_policy = parse_with(
            &lookup,
            "METRICS_SENDER_CLOCK_POLICY",
            ClockPolicy::NetworkOnly,
        )?;

        let min_valid_year = parse_ranged(
            &lookup,
            "METRICS_SENDER_MIN_VALID_YEAR",
            DEFAULT_MIN_VALID_YEAR,
            1970,
            9999,
        )?;

        Ok(Self {
            enabled,
            buffer_size,
            send_period: Duration::from_secs(send_period_secs),
            task_priority,
            task_stack_size,
            http_timeout: Duration::from_millis(http_timeout_ms),
            database_url,
            device_location,
            token,
            print_buffer,
            document_layout,
            clock_policy,
            min_valid_year,
        })
    }
}

impl Default for Config {
    /// Create a configuration made of the compiled-in defaults.
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            send_period: Duration::from_secs(DEFAULT_SEND_PERIOD_SECS),
            task_priority: DEFAULT_TASK_PRIORITY,
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            device_location: DEFAULT_DEVICE_LOCATION.to_string(),
            token: None,
            print_buffer: false,
            document_layout: DocumentLayout::Fields,
            clock_policy: ClockPolicy::NetworkOnly,
            min_valid_year: DEFAULT_MIN_VALID_YEAR,
        }
    }
}

/// Parse a numeric variable and check it against an inclusive range.
fn parse_ranged<F, T>(lookup: &F, env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(value) = lookup(env_var) else {
        return Ok(default);
    };

    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value)))?;

    if parsed < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("value {} is below minimum ({})", parsed, min),
        ));
    }

    if parsed > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("value {} exceeds maximum ({})", parsed, max),
        ));
    }

    Ok(parsed)
}

fn parse_bool<F>(lookup: &F, env_var: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(env_var) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(true),
            "0" | "false" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::for_var(
                env_var,
                format!("'{}' is not a valid boolean", value),
            )),
        },
        None => Ok(default),
    }
}

fn parse_with<F, T>(lookup: &F, env_var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr<Err = String>,
{
    match lookup(env_var) {
        Some(value) => value
            .parse()
            .map_err(|message| ConfigError::for_var(env_var, message)),
        None => Ok(default),
    }
}
