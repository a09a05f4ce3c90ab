// ── Core error types ──
//
// `ReaderError` is what the reader SDK reports; the controller classifies
// it into prompts and never retries on its own. `CoreError` is what a
// session hands to its caller on the failure path.

use thiserror::Error;
use url::Url;

/// Failure reported by the reader SDK during discovery, connect, or an update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReaderError {
    // ── Discovery ────────────────────────────────────────────────────
    #[error("Reader discovery failed: {message}")]
    Discovery { message: String },

    // ── Connection ───────────────────────────────────────────────────
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    // ── Mandatory software update ────────────────────────────────────
    #[error("Reader software update failed: {error}")]
    SoftwareUpdate {
        error: SoftwareUpdateError,
        /// Battery charge at the time of failure, when the reader reported it.
        battery_level: Option<f32>,
    },
}

impl ReaderError {
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    pub fn software_update(error: SoftwareUpdateError) -> Self {
        Self::SoftwareUpdate {
            error,
            battery_level: None,
        }
    }

    /// True when the merchant interrupted the update themselves.
    pub fn is_update_interrupted(&self) -> bool {
        matches!(
            self,
            Self::SoftwareUpdate {
                error: SoftwareUpdateError::InterruptedByUser,
                ..
            }
        )
    }
}

/// Why a connect attempt was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("The store address is incomplete")]
    IncompleteStoreAddress {
        /// Store settings page where the merchant can fix the address.
        admin_url: Option<Url>,
    },

    #[error("The store postal code is invalid")]
    InvalidPostalCode,

    #[error("Reader battery is critically low")]
    CriticallyLowBatteryBluetooth,

    #[error("Connecting to the reader failed: {message}")]
    Other { message: String },
}

impl ConnectionError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Why a mandatory reader software update did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SoftwareUpdateError {
    #[error("the update was interrupted")]
    InterruptedByUser,

    #[error("the reader battery is too low to update")]
    BatteryTooLow,

    #[error("{message}")]
    Other { message: String },
}

/// Failure result of a search-and-connect session.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Session errors ───────────────────────────────────────────────
    #[error("Searching for card readers failed")]
    DiscoveryFailed(#[source] ReaderError),

    #[error("A card reader search is already in progress")]
    SessionInProgress,

    #[error("The connection controller was shut down")]
    Shutdown,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}
