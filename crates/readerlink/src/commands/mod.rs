//! Command handlers and the configuration plumbing they share.

pub mod config_cmd;
pub mod simulate;

use std::path::PathBuf;

use readerlink_config::{Config, Profile};
use readerlink_core::ControllerConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Store searched for when no profile is configured.
const FALLBACK_SITE_ID: i64 = 1;

/// The config file this invocation reads.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(readerlink_config::config_path)
}

pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let cfg = readerlink_config::load_config_from(&config_file(global))?;
    Ok(cfg)
}

/// Build the runtime configuration from the active profile.
///
/// A profile named with `--profile` must exist. Without one, a missing
/// default profile falls back to the built-in defaults.
pub fn resolve_controller_config(
    global: &GlobalOpts,
    cfg: &Config,
    site_override: Option<i64>,
) -> Result<ControllerConfig, CliError> {
    let name = cfg.active_profile_name(global.profile.as_deref());

    let mut config = match cfg.profiles.get(&name) {
        Some(profile) => readerlink_config::profile_to_controller_config(profile, &cfg.defaults)?,
        None if global.profile.is_some() => {
            let mut available: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(CliError::ProfileNotFound {
                name,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            });
        }
        None => {
            tracing::debug!(profile = %name, "no such profile; using built-in defaults");
            readerlink_config::profile_to_controller_config(
                &Profile::new(FALLBACK_SITE_ID),
                &cfg.defaults,
            )?
        }
    };

    if let Some(site_id) = site_override {
        config.site_id = site_id;
    }
    Ok(config)
}
