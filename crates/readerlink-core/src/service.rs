// ── Collaborator seams ──
//
// The controller never talks to hardware or storage directly. It is
// handed three collaborators: the reader SDK, the store of the last
// connected reader, and the source of the active payment gateway.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::watch;

use crate::config::DiscoveryParams;
use crate::error::ReaderError;
use crate::model::{Reader, ReaderId};

// ── Discovery ───────────────────────────────────────────────────────

/// Something the reader SDK reports while discovery runs.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// The full set of readers currently visible. Each report replaces the last.
    ReadersChanged(Vec<Reader>),
    /// Discovery stopped with an error. Nothing follows on the same stream.
    Failed(ReaderError),
}

pub type DiscoveryStream = BoxStream<'static, DiscoveryEvent>;

// ── Software updates ────────────────────────────────────────────────

/// Stops a software update that is still in progress.
#[async_trait]
pub trait CancelUpdate: Send + Sync {
    async fn cancel(&self) -> Result<(), ReaderError>;
}

/// Shared handle to the cancellable of an update in progress.
#[derive(Clone)]
pub struct UpdateCancelHandle(Arc<dyn CancelUpdate>);

impl UpdateCancelHandle {
    pub fn new(inner: impl CancelUpdate + 'static) -> Self {
        Self(Arc::new(inner))
    }

    pub async fn cancel(&self) -> Result<(), ReaderError> {
        self.0.cancel().await
    }
}

impl fmt::Debug for UpdateCancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpdateCancelHandle")
    }
}

/// Progress of a mandatory update, reported while a connect is pending.
#[derive(Debug, Clone)]
pub enum SoftwareUpdateEvent {
    Started { cancel: UpdateCancelHandle },
    /// Install progress in `0.0..=1.0`.
    Installing { progress: f32 },
    Completed,
    /// Any other update notification; ignored by the controller.
    Other,
}

pub type SoftwareUpdateStream = BoxStream<'static, SoftwareUpdateEvent>;

// ── Collaborator traits ─────────────────────────────────────────────

/// The card reader SDK.
#[async_trait]
pub trait CardReaderService: Send + Sync {
    /// Start discovery. Events arrive on the returned stream until it is
    /// dropped or reports a failure.
    fn discover(&self, params: DiscoveryParams) -> DiscoveryStream;

    /// Stop discovery. Resolves once the SDK has acknowledged.
    async fn cancel_discovery(&self) -> Result<(), ReaderError>;

    /// Connect to a reader. May run a mandatory software update first,
    /// which is reported on [`software_updates`](Self::software_updates).
    async fn connect(&self, reader: Reader) -> Result<Reader, ReaderError>;

    /// Subscribe to software update events.
    fn software_updates(&self) -> SoftwareUpdateStream;
}

/// What the known-reader store currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KnownReaderState {
    /// The store has not finished loading.
    #[default]
    Loading,
    Loaded(Option<ReaderId>),
}

impl KnownReaderState {
    pub fn reader_id(&self) -> Option<&ReaderId> {
        match self {
            Self::Loaded(id) => id.as_ref(),
            Self::Loading => None,
        }
    }
}

/// Remembers the last reader the merchant connected to.
pub trait KnownReaderProvider: Send + Sync {
    fn known_reader(&self) -> watch::Receiver<KnownReaderState>;

    fn remember(&self, reader_id: &ReaderId);
}

/// Source of the payment gateway account in use.
pub trait GatewayAccountProvider: Send + Sync {
    /// The gateway account id, `None` until one is configured.
    fn gateway_id(&self) -> watch::Receiver<Option<String>>;
}
