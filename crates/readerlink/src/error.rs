//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use readerlink_config::ConfigError;
use readerlink_core::{CoreError, ReaderError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const DISCOVERY: i32 = 4;
    pub const TIMEOUT: i32 = 8;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Search ───────────────────────────────────────────────────────
    #[error("Searching for card readers failed")]
    #[diagnostic(
        code(readerlink::discovery_failed),
        help("Check that Bluetooth is enabled and the reader is switched on.")
    )]
    DiscoveryFailed {
        #[source]
        source: ReaderError,
    },

    #[error("A card reader search is already running")]
    #[diagnostic(code(readerlink::search_in_progress))]
    SearchInProgress,

    #[error("The search was interrupted")]
    #[diagnostic(code(readerlink::interrupted))]
    Interrupted,

    #[error("No reader was connected within {after}")]
    #[diagnostic(
        code(readerlink::timeout),
        help("Increase the limit with --timeout, or add readers with --reader.")
    )]
    Timeout { after: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(readerlink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(readerlink::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Add one under [profiles.{name}] in the config file."
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error(transparent)]
    #[diagnostic(
        code(readerlink::config),
        help("Run: readerlink config path  to locate the config file")
    )]
    Config(ConfigError),

    // ── Interactive ──────────────────────────────────────────────────
    #[error("Prompt failed: {0}")]
    #[diagnostic(code(readerlink::prompt))]
    Prompt(String),

    // ── IO / Serialization ────────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(readerlink::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render TOML: {0}")]
    #[diagnostic(code(readerlink::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DiscoveryFailed { .. } => exit_code::DISCOVERY,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Interrupted => exit_code::INTERRUPTED,
            Self::Validation { .. } => exit_code::USAGE,
            Self::ProfileNotFound { .. } | Self::Config(_) => exit_code::CONFIG,
            _ => exit_code::GENERAL,
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DiscoveryFailed(source) => CliError::DiscoveryFailed { source },
            CoreError::SessionInProgress => CliError::SearchInProgress,
            CoreError::Shutdown => CliError::Interrupted,
            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            other => CliError::Config(other),
        }
    }
}

impl From<dialoguer::Error> for CliError {
    fn from(err: dialoguer::Error) -> Self {
        CliError::Prompt(err.to_string())
    }
}
