// ── Session outcome types ──

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::reader::Reader;

/// Where in the flow the merchant backed out.
///
/// The string forms are the analytics names callers report; the
/// controller itself only produces the first four.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CancellationSource {
    SearchingForReader,
    FoundReader,
    FoundSeveralReaders,
    ConnectionError,
    ReaderSoftwareUpdate,
    #[strum(serialize = "card_reader")]
    Reader,
    #[strum(serialize = "apple_tap_to_pay_terms_acceptance")]
    AppleTosAcceptance,
    #[strum(serialize = "preflight_select_reader_type")]
    SelectReaderType,
    PaymentValidatingOrder,
    PaymentPreparingReader,
    PaymentWaitingForInput,
    #[strum(serialize = "unknown")]
    Other,
}

/// Successful end of a search-and-connect session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ConnectionResult {
    Connected(Reader),
    Canceled(CancellationSource),
}

impl ConnectionResult {
    pub fn connected_reader(&self) -> Option<&Reader> {
        match self {
            Self::Connected(reader) => Some(reader),
            Self::Canceled(_) => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_source_uses_analytics_names() {
        assert_eq!(
            CancellationSource::SearchingForReader.as_ref(),
            "searching_for_reader"
        );
        assert_eq!(CancellationSource::FoundSeveralReaders.to_string(), "found_several_readers");
        assert_eq!(CancellationSource::Reader.as_ref(), "card_reader");
        assert_eq!(
            CancellationSource::AppleTosAcceptance.as_ref(),
            "apple_tap_to_pay_terms_acceptance"
        );
        assert_eq!(CancellationSource::Other.as_ref(), "unknown");
    }

    #[test]
    fn cancellation_source_parses_analytics_names() {
        let source: CancellationSource = "reader_software_update".parse().unwrap();
        assert_eq!(source, CancellationSource::ReaderSoftwareUpdate);
        assert!("not_a_source".parse::<CancellationSource>().is_err());
    }
}
