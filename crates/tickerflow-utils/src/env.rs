//! Typed environment variable access

use std::str::FromStr;
use thiserror::Error;

/// Error raised when an environment override cannot be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid value for {name}: '{value}' ({reason})")]
pub struct EnvError {
    /// Variable name
    pub name: String,
    /// Raw value found in the environment
    pub value: String,
    /// Parser message
    pub reason: String,
}

/// Read and parse an environment variable
///
/// Returns `Ok(None)` when the variable is unset or blank.
pub fn env_parsed<T>(name: &str) -> Result<Option<T>, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_value(name, std::env::var(name).ok())
}

/// Read a boolean flag (`1`, `true`, `yes`, `on` / `0`, `false`, `no`, `off`)
pub fn env_flag(name: &str) -> Result<Option<bool>, EnvError> {
    parse_flag(name, std::env::var(name).ok())
}

fn parse_value<T>(name: &str, raw: Option<String>) -> Result<Option<T>, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse::<T>().map(Some).map_err(|e| EnvError {
        name: name.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn parse_flag(name: &str, raw: Option<String>) -> Result<Option<bool>, EnvError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(EnvError {
            name: name.to_string(),
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}
