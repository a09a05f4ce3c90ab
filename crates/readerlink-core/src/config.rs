// ── Runtime controller configuration ──
//
// Describes *which* store a search runs for and how the workflow is
// tuned. Never touches disk; the binary builds one from a profile and
// hands it in.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::CoreError;

/// How the reader SDK should look for readers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiscoveryMethod {
    /// Scan for Bluetooth card readers.
    #[default]
    BluetoothScan,
    /// Use the reader built into the device itself.
    LocalMobile,
}

/// Per-search parameters handed to the reader SDK when discovery starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryParams {
    pub site_id: i64,
    pub method: DiscoveryMethod,
}

/// Configuration for a [`ConnectionController`](crate::ConnectionController).
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Store the readers are being connected for.
    pub site_id: i64,
    pub discovery_method: DiscoveryMethod,
    /// How long a successful connect is held back after a mandatory
    /// update finished, so the "update complete" state is visible.
    pub update_success_delay: Duration,
    /// Update progress at which the update can no longer be cancelled.
    pub update_cancel_threshold: f32,
}

impl ControllerConfig {
    pub const DEFAULT_UPDATE_SUCCESS_DELAY: Duration = Duration::from_secs(1);
    pub const DEFAULT_UPDATE_CANCEL_THRESHOLD: f32 = 0.995;

    pub fn new(site_id: i64) -> Self {
        Self {
            site_id,
            ..Self::default()
        }
    }

    /// Reject settings a search cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let threshold = self.update_cancel_threshold;
        if threshold > 0.0 && threshold <= 1.0 {
            Ok(())
        } else {
            Err(CoreError::Config {
                message: format!("update_cancel_threshold must be in (0, 1], got {threshold}"),
            })
        }
    }

    pub(crate) fn discovery_params(&self) -> DiscoveryParams {
        DiscoveryParams {
            site_id: self.site_id,
            method: self.discovery_method,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            site_id: 0,
            discovery_method: DiscoveryMethod::default(),
            update_success_delay: Self::DEFAULT_UPDATE_SUCCESS_DELAY,
            update_cancel_threshold: Self::DEFAULT_UPDATE_CANCEL_THRESHOLD,
        }
    }
}
