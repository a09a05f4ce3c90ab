// ── UI-facing projection ──
//
// What the presentation layer renders for each step of a search. Every
// variant carries only display data plus the actions the merchant can
// take from that step. Actions post an intent back into the session
// that produced them; once that session is over they do nothing.

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::error::ReaderError;
use crate::model::{CancellationSource, Reader, ReaderId};

// ── Intents ─────────────────────────────────────────────────────────

/// A merchant decision routed back into the session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Intent {
    /// Connect to the reader offered by the single-reader prompt.
    ConnectCandidate,
    /// "Keep searching": skip the offered reader for the rest of the session.
    SkipCandidate,
    /// Connect to a reader picked from the list.
    ConnectTo(ReaderId),
    /// Dismiss a failure prompt and go back to scanning.
    ContinueSearch,
    /// Restart discovery from scratch.
    Retry,
    Cancel(CancellationSource),
    /// Stop the mandatory update in progress.
    CancelUpdate,
    /// Re-show the incomplete-address prompt after the merchant fixed the address.
    RefreshIncompleteAddress,
    /// Acknowledge a discovery failure, ending the session.
    CloseScanFailure,
}

/// Hands out actions bound to one session's intent channel.
#[derive(Clone)]
pub(crate) struct ActionSink {
    tx: mpsc::UnboundedSender<Intent>,
}

impl ActionSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Intent>) -> Self {
        Self { tx }
    }

    pub(crate) fn action(&self, intent: Intent) -> UiAction {
        UiAction {
            intent,
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn cancel(&self, source: CancellationSource) -> UiAction {
        self.action(Intent::Cancel(source))
    }

    pub(crate) fn connect(&self) -> ConnectAction {
        ConnectAction {
            tx: self.tx.clone(),
        }
    }
}

// ── Actions ─────────────────────────────────────────────────────────

/// A button the merchant can tap.
#[derive(Clone)]
pub struct UiAction {
    intent: Intent,
    tx: mpsc::UnboundedSender<Intent>,
}

impl UiAction {
    pub fn invoke(&self) {
        if self.tx.send(self.intent.clone()).is_err() {
            debug!(intent = ?self.intent, "action for a finished search ignored");
        }
    }
}

impl fmt::Debug for UiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UiAction").field(&self.intent).finish()
    }
}

/// Connect to one reader out of a list, by id.
#[derive(Clone)]
pub struct ConnectAction {
    tx: mpsc::UnboundedSender<Intent>,
}

impl ConnectAction {
    pub fn invoke(&self, reader_id: &ReaderId) {
        if self.tx.send(Intent::ConnectTo(reader_id.clone())).is_err() {
            debug!(reader = %reader_id, "connect action for a finished search ignored");
        }
    }
}

impl fmt::Debug for ConnectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectAction")
    }
}

// ── UiState ─────────────────────────────────────────────────────────

/// The step of the connection workflow currently shown to the merchant.
#[derive(Debug, Clone, Default)]
pub enum UiState {
    /// No search is running.
    #[default]
    Idle,
    ScanningForReader {
        cancel: UiAction,
    },
    ConnectingToReader,
    /// A connect attempt failed for a reason a fresh look may fix.
    ConnectingFailed {
        error: ReaderError,
        continue_search: UiAction,
        cancel_search: UiAction,
    },
    ConnectingFailedIncompleteAddress {
        /// Store settings page; `None` once the merchant has been there.
        admin_url: Option<Url>,
        refresh: UiAction,
        retry_search: UiAction,
        cancel_search: UiAction,
    },
    ConnectingFailedInvalidPostalCode {
        retry_search: UiAction,
        cancel_search: UiAction,
    },
    ConnectingFailedCriticallyLowBattery {
        retry_search: UiAction,
        cancel_search: UiAction,
    },
    /// One reader is available; ask before connecting to it.
    FoundReader {
        name: String,
        reader_id: ReaderId,
        connect: UiAction,
        continue_search: UiAction,
        cancel_search: UiAction,
    },
    FoundSeveralReaders {
        readers: Vec<Reader>,
        connect: ConnectAction,
        cancel_search: UiAction,
    },
    /// The visible readers changed while the list is already on screen.
    UpdateSeveralReadersList {
        readers: Vec<Reader>,
        connect: ConnectAction,
        cancel_search: UiAction,
    },
    UpdateInProgress {
        required_update: bool,
        progress: f32,
        /// Absent once the update is too far along to stop.
        cancel: Option<UiAction>,
    },
    UpdatingFailed {
        close: UiAction,
    },
    UpdatingFailedLowBattery {
        battery_level: Option<f32>,
        close: UiAction,
    },
    ScanningFailed {
        error: ReaderError,
        close: UiAction,
    },
    /// Any prompt on screen should be taken down.
    Dismissed,
}

impl UiState {
    /// Short, stable name for logs and simple front-ends.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ScanningForReader { .. } => "scanning_for_reader",
            Self::ConnectingToReader => "connecting_to_reader",
            Self::ConnectingFailed { .. } => "connecting_failed",
            Self::ConnectingFailedIncompleteAddress { .. } => {
                "connecting_failed_incomplete_address"
            }
            Self::ConnectingFailedInvalidPostalCode { .. } => {
                "connecting_failed_invalid_postal_code"
            }
            Self::ConnectingFailedCriticallyLowBattery { .. } => {
                "connecting_failed_critically_low_battery"
            }
            Self::FoundReader { .. } => "found_reader",
            Self::FoundSeveralReaders { .. } => "found_several_readers",
            Self::UpdateSeveralReadersList { .. } => "update_several_readers_list",
            Self::UpdateInProgress { .. } => "update_in_progress",
            Self::UpdatingFailed { .. } => "updating_failed",
            Self::UpdatingFailedLowBattery { .. } => "updating_failed_low_battery",
            Self::ScanningFailed { .. } => "scanning_failed",
            Self::Dismissed => "dismissed",
        }
    }

    /// Readers listed by the several-readers prompt, if that is what is shown.
    pub fn listed_readers(&self) -> Option<&[Reader]> {
        match self {
            Self::FoundSeveralReaders { readers, .. }
            | Self::UpdateSeveralReadersList { readers, .. } => Some(readers),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_post_their_intent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ActionSink::new(tx);

        sink.cancel(CancellationSource::FoundReader).invoke();
        sink.connect().invoke(&ReaderId::new("R1"));

        assert_eq!(
            rx.try_recv().ok(),
            Some(Intent::Cancel(CancellationSource::FoundReader))
        );
        assert_eq!(rx.try_recv().ok(), Some(Intent::ConnectTo(ReaderId::new("R1"))));
    }

    #[test]
    fn actions_outliving_their_session_are_inert() {
        let (tx, rx) = mpsc::unbounded_channel();
        let action = ActionSink::new(tx).action(Intent::Retry);
        drop(rx);

        // Must not panic.
        action.invoke();
    }

    #[test]
    fn listed_readers_only_for_list_prompts() {
        assert!(UiState::Idle.listed_readers().is_none());
        assert!(UiState::Dismissed.listed_readers().is_none());
    }
}
