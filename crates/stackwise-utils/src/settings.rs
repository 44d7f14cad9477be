//! # Capture Settings
//!
//! Defaults for trace capture, read from the environment so that a process
//! can be tuned without recompiling:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `STACKWISE_MAX_FRAMES` | frames to keep | 64 |
//! | `STACKWISE_SKIP_FRAMES` | innermost frames to drop | 0 |
//! | `STACKWISE_RESOLVE_BUDGET_MS` | wall-clock budget for symbolication | none |
//! | `STACKWISE_DEMANGLE` | demangle names (`true`/`false`, `1`/`0`, `yes`/`no`, `on`/`off`) | true |
//!
//! Unset or empty variables keep their default; malformed ones are errors.

use std::env;
use std::time::Duration;

pub const MAX_FRAMES_ENV: &str = "STACKWISE_MAX_FRAMES";
pub const SKIP_FRAMES_ENV: &str = "STACKWISE_SKIP_FRAMES";
pub const RESOLVE_BUDGET_ENV: &str = "STACKWISE_RESOLVE_BUDGET_MS";
pub const DEMANGLE_ENV: &str = "STACKWISE_DEMANGLE";

/// Frames kept when nothing is configured
pub const DEFAULT_MAX_FRAMES: usize = 64;

/// Capture defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSettings
{
    pub max_frames: usize,
    pub skip_frames: usize,
    pub resolve_budget: Option<Duration>,
    pub demangle: bool,
}

impl Default for TraceSettings
{
    fn default() -> Self
    {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            skip_frames: 0,
            resolve_budget: None,
            demangle: true,
        }
    }
}

impl TraceSettings
{
    /// Read settings from the process environment.
    ///
    /// ## Errors
    ///
    /// Returns [`SettingsError`] naming the first malformed variable.
    pub fn from_env() -> Result<Self, SettingsError>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    ///
    /// ## Errors
    ///
    /// Returns [`SettingsError`] naming the first malformed variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let value = |name: &str| lookup(name).map(|raw| raw.trim().to_string()).filter(|raw| !raw.is_empty());

        if let Some(raw) = value(MAX_FRAMES_ENV) {
            settings.max_frames = parse_count(MAX_FRAMES_ENV, &raw)?;
        }
        if let Some(raw) = value(SKIP_FRAMES_ENV) {
            settings.skip_frames = parse_count(SKIP_FRAMES_ENV, &raw)?;
        }
        if let Some(raw) = value(RESOLVE_BUDGET_ENV) {
            let millis = raw.parse::<u64>().map_err(|_| SettingsError::invalid(RESOLVE_BUDGET_ENV, &raw))?;
            settings.resolve_budget = Some(Duration::from_millis(millis));
        }
        if let Some(raw) = value(DEMANGLE_ENV) {
            settings.demangle = parse_flag(DEMANGLE_ENV, &raw)?;
        }
        Ok(settings)
    }
}

fn parse_count(name: &'static str, raw: &str) -> Result<usize, SettingsError>
{
    raw.parse::<usize>().map_err(|_| SettingsError::invalid(name, raw))
}

fn parse_flag(name: &'static str, raw: &str) -> Result<bool, SettingsError>
{
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::invalid(name, raw)),
    }
}

/// Malformed setting
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError
{
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue
    {
        name: &'static str,
        value: String,
    },
}

impl SettingsError
{
    fn invalid(name: &'static str, value: &str) -> Self
    {
        SettingsError::InvalidValue {
            name,
            value: value.to_string(),
        }
    }
}
