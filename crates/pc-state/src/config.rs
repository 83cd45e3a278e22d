use crate::history_cache::DEFAULT_HISTORY_CAPACITY;
use crate::preflight_cache::{DEFAULT_PREFLIGHT_CAPACITY, DEFAULT_PREFLIGHT_TTL};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_AUTO_REFRESH_MS: u64 = 4_000;
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be a boolean flag, got {value:?}")]
    InvalidFlag { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub debounce: Duration,
    pub auto_refresh_interval: Duration,
    pub auto_refresh: bool,
    pub history_limit: u32,
    pub history_capacity: usize,
    pub preflight_capacity: usize,
    pub preflight_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            auto_refresh_interval: Duration::from_millis(DEFAULT_AUTO_REFRESH_MS),
            auto_refresh: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            preflight_capacity: DEFAULT_PREFLIGHT_CAPACITY,
            preflight_ttl: DEFAULT_PREFLIGHT_TTL,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source; unset or blank
    /// variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &'static str| lookup(key).filter(|value| !value.trim().is_empty());

        let debounce_ms = match read("PC_HISTORY_DEBOUNCE_MS") {
            Some(value) => parse_number(&value, "PC_HISTORY_DEBOUNCE_MS")?,
            None => DEFAULT_DEBOUNCE_MS,
        };
        let auto_refresh_ms = match read("PC_HISTORY_AUTO_REFRESH_MS") {
            Some(value) => parse_number(&value, "PC_HISTORY_AUTO_REFRESH_MS")?,
            None => DEFAULT_AUTO_REFRESH_MS,
        };
        let auto_refresh = match read("PC_HISTORY_AUTO_REFRESH") {
            Some(value) => parse_bool_flag(&value).ok_or(ConfigError::InvalidFlag {
                key: "PC_HISTORY_AUTO_REFRESH",
                value,
            })?,
            None => defaults.auto_refresh,
        };
        let history_limit = match read("PC_HISTORY_LIMIT") {
            Some(value) => parse_number(&value, "PC_HISTORY_LIMIT")? as u32,
            None => defaults.history_limit,
        };
        let history_capacity = match read("PC_HISTORY_CAPACITY") {
            Some(value) => parse_number(&value, "PC_HISTORY_CAPACITY")? as usize,
            None => defaults.history_capacity,
        };
        let preflight_capacity = match read("PC_PREFLIGHT_CAPACITY") {
            Some(value) => parse_number(&value, "PC_PREFLIGHT_CAPACITY")? as usize,
            None => defaults.preflight_capacity,
        };
        let preflight_ttl = match read("PC_PREFLIGHT_TTL_SECS") {
            Some(value) => Duration::from_secs(parse_number(&value, "PC_PREFLIGHT_TTL_SECS")?),
            None => defaults.preflight_ttl,
        };

        Ok(Self {
            debounce: Duration::from_millis(debounce_ms),
            auto_refresh_interval: Duration::from_millis(auto_refresh_ms),
            auto_refresh,
            history_limit,
            history_capacity,
            preflight_capacity,
            preflight_ttl,
        })
    }
}

fn parse_number(value: &str, key: &'static str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|parsed| *parsed > 0 && *parsed <= u32::MAX as u64)
        .ok_or_else(|| ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
