// ── Reader domain types ──
//
// A `Reader` is an opaque descriptor handed to us by the reader SDK.
// The controller only ever compares ids and passes readers back to
// the SDK; the remaining fields exist for display.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── ReaderId ────────────────────────────────────────────────────────

/// Identifier of a physical card reader (usually its serial number).
///
/// Surrounding whitespace is trimmed; case is preserved because SDKs
/// report serials verbatim and the known-reader store round-trips them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct ReaderId(String);

impl ReaderId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ReaderId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for ReaderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ReaderId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// ── ReaderModel ─────────────────────────────────────────────────────

/// Hardware model reported by the SDK.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderModel {
    Chipper2X,
    StripeM2,
    WisePad3,
    TapToPay,
    Other(String),
}

impl fmt::Display for ReaderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chipper2X => f.write_str("BBPOS Chipper 2X BT"),
            Self::StripeM2 => f.write_str("Stripe M2"),
            Self::WisePad3 => f.write_str("BBPOS WisePad 3"),
            Self::TapToPay => f.write_str("Tap to Pay"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

// ── Reader ──────────────────────────────────────────────────────────

/// A card reader visible to (or connected through) the reader SDK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reader {
    pub id: ReaderId,
    pub name: Option<String>,
    /// Battery charge in `0.0..=1.0`, when the reader reports one.
    pub battery_level: Option<f32>,
    pub model: ReaderModel,
    pub software_version: Option<String>,
}

impl Reader {
    /// A reader with only an id and a model; handy for tests and the simulator.
    pub fn new(id: impl Into<ReaderId>, model: ReaderModel) -> Self {
        Self {
            id: id.into(),
            name: None,
            battery_level: None,
            model,
            software_version: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_battery_level(mut self, level: f32) -> Self {
        self.battery_level = Some(level.clamp(0.0, 1.0));
        self
    }

    /// Name to show merchants: the advertised name, or the id if there is none.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.id.as_str())
    }
}
