//! Profile configuration for readerlink.
//!
//! TOML profiles merged with `READERLINK_*` environment overrides, and
//! translation to [`readerlink_core::ControllerConfig`]. The core never
//! reads files; the binary loads a profile here and hands the result in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use readerlink_core::{ControllerConfig, DiscoveryMethod};

/// Prefix for environment overrides. Nested keys use `__`, e.g.
/// `READERLINK_DEFAULTS__UPDATE_CANCEL_THRESHOLD`.
pub const ENV_PREFIX: &str = "READERLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    /// Tuning shared by every profile unless overridden.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named store profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Name of the profile to use: the explicit one, else `default_profile`,
    /// else `"default"`.
    pub fn active_profile_name(&self, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_owned)
            .or_else(|| self.default_profile.clone())
            .unwrap_or_else(|| "default".into())
    }

    /// Look up a profile and translate it into a runtime configuration.
    pub fn controller_config(&self, profile_name: &str) -> Result<ControllerConfig, ConfigError> {
        let profile =
            self.profiles
                .get(profile_name)
                .ok_or_else(|| ConfigError::ProfileNotFound {
                    name: profile_name.into(),
                })?;
        profile_to_controller_config(profile, &self.defaults)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_update_success_delay_ms")]
    pub update_success_delay_ms: u64,

    #[serde(default = "default_update_cancel_threshold")]
    pub update_cancel_threshold: f32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            update_success_delay_ms: default_update_success_delay_ms(),
            update_cancel_threshold: default_update_cancel_threshold(),
        }
    }
}

fn default_update_success_delay_ms() -> u64 {
    u64::try_from(ControllerConfig::DEFAULT_UPDATE_SUCCESS_DELAY.as_millis()).unwrap_or(1000)
}
fn default_update_cancel_threshold() -> f32 {
    ControllerConfig::DEFAULT_UPDATE_CANCEL_THRESHOLD
}

/// A named store profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// Store whose readers are searched for.
    pub site_id: i64,

    /// `bluetooth_scan` or `local_mobile`.
    #[serde(default = "default_discovery_method")]
    pub discovery_method: String,

    /// Override of `defaults.update_success_delay_ms`.
    pub update_success_delay_ms: Option<u64>,

    /// Override of `defaults.update_cancel_threshold`.
    pub update_cancel_threshold: Option<f32>,
}

impl Profile {
    pub fn new(site_id: i64) -> Self {
        Self {
            site_id,
            discovery_method: default_discovery_method(),
            update_success_delay_ms: None,
            update_cancel_threshold: None,
        }
    }
}

fn default_discovery_method() -> String {
    DiscoveryMethod::default().to_string()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "readerlink", "readerlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("readerlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file. A missing file contributes nothing.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    tracing::debug!(path = %path.display(), "loading configuration");

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, falling back to the defaults on any error.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "ignoring unreadable configuration");
        Config::default()
    })
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `ControllerConfig` from a profile, filling gaps from `defaults`.
pub fn profile_to_controller_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ControllerConfig, ConfigError> {
    let discovery_method =
        DiscoveryMethod::from_str(&profile.discovery_method).map_err(|_| {
            ConfigError::Validation {
                field: "discovery_method".into(),
                reason: format!(
                    "expected 'bluetooth_scan' or 'local_mobile', got '{}'",
                    profile.discovery_method
                ),
            }
        })?;

    let threshold = profile
        .update_cancel_threshold
        .unwrap_or(defaults.update_cancel_threshold);
    let in_range = threshold > 0.0 && threshold <= 1.0;
    if !in_range {
        return Err(ConfigError::Validation {
            field: "update_cancel_threshold".into(),
            reason: format!("must be in (0, 1], got {threshold}"),
        });
    }

    let delay_ms = profile
        .update_success_delay_ms
        .unwrap_or(defaults.update_success_delay_ms);

    Ok(ControllerConfig {
        site_id: profile.site_id,
        discovery_method,
        update_success_delay: Duration::from_millis(delay_ms),
        update_cancel_threshold: threshold,
    })
}
