// ── Simulated reader SDK ──
//
// In-memory stand-ins for the three collaborators. The demo binary and
// the integration tests drive searches against these; a `SimHandle`
// plays the part of the physical world (readers coming into range,
// connects succeeding or failing, updates progressing).

use std::collections::VecDeque;
use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DiscoveryParams;
use crate::error::{ConnectionError, ReaderError, SoftwareUpdateError};
use crate::model::{Reader, ReaderId};
use crate::service::{
    CancelUpdate, CardReaderService, DiscoveryEvent, DiscoveryStream, GatewayAccountProvider,
    KnownReaderProvider, KnownReaderState, SoftwareUpdateEvent, SoftwareUpdateStream,
    UpdateCancelHandle,
};

const UPDATE_CHANNEL_SIZE: usize = 64;
/// How long a failed connect keeps the radio busy before scan results resume.
const RESCAN_DELAY: Duration = Duration::from_millis(100);

// ── Connect plans ───────────────────────────────────────────────────

/// How the next simulated connect behaves. Connects with no plan queued succeed.
#[derive(Debug, Clone)]
pub enum ConnectPlan {
    Succeed,
    Fail(ReaderError),
    /// Run a cancellable mandatory update reporting each progress step, then connect.
    UpdateThenSucceed { steps: Vec<f32> },
    /// Wait for [`SimHandle::complete_connect`].
    Manual,
}

/// Counters describing what the controller asked the simulated SDK to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub discovery_starts: usize,
    pub discovery_cancels: usize,
    pub connect_attempts: Vec<ReaderId>,
    pub update_cancels: usize,
}

// ── Shared state ────────────────────────────────────────────────────

struct Shared {
    state: Mutex<SimState>,
    updates: broadcast::Sender<SoftwareUpdateEvent>,
}

struct SimState {
    visible: Vec<Reader>,
    discovery: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    last_params: Option<DiscoveryParams>,
    pending_failure: Option<ReaderError>,
    plans: VecDeque<ConnectPlan>,
    manual: VecDeque<oneshot::Sender<Result<Reader, ReaderError>>>,
    connect_delay: Duration,
    update_step: Duration,
    stats: SimStats,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SoftwareUpdateEvent) {
        // No subscribers simply means no connect is watching.
        let _ = self.updates.send(event);
    }
}

// ── SimulatedReaderService ──────────────────────────────────────────

/// A [`CardReaderService`] backed by memory.
pub struct SimulatedReaderService {
    shared: Arc<Shared>,
}

impl SimulatedReaderService {
    /// A service with nothing in range, plus the handle that controls it.
    pub fn new() -> (Self, SimHandle) {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState {
                visible: Vec::new(),
                discovery: None,
                last_params: None,
                pending_failure: None,
                plans: VecDeque::new(),
                manual: VecDeque::new(),
                connect_delay: Duration::ZERO,
                update_step: Duration::from_millis(100),
                stats: SimStats::default(),
            }),
            updates,
        });
        let handle = SimHandle {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, handle)
    }

    /// Report the readers in range to the live discovery again, the way a
    /// scan does once a connect attempt lets go of the radio.
    fn rescan_after(&self, delay: Duration) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            time::sleep(delay).await;
            let state = shared.lock();
            if let Some(tx) = state.discovery.as_ref().filter(|_| !state.visible.is_empty()) {
                debug!(readers = state.visible.len(), "simulated discovery rescan");
                let _ = tx.send(DiscoveryEvent::ReadersChanged(state.visible.clone()));
            }
        });
    }

    async fn run_update(&self, steps: &[f32], step: Duration) -> Result<(), ReaderError> {
        let token = CancellationToken::new();
        self.shared.emit(SoftwareUpdateEvent::Started {
            cancel: UpdateCancelHandle::new(SimUpdateCancel {
                token: token.clone(),
                shared: Arc::clone(&self.shared),
            }),
        });

        for &progress in steps {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(progress, "simulated update interrupted");
                    return Err(ReaderError::software_update(SoftwareUpdateError::InterruptedByUser));
                }
                () = time::sleep(step) => {}
            }
            self.shared
                .emit(SoftwareUpdateEvent::Installing { progress });
        }

        self.shared.emit(SoftwareUpdateEvent::Completed);
        Ok(())
    }
}

#[async_trait]
impl CardReaderService for SimulatedReaderService {
    fn discover(&self, params: DiscoveryParams) -> DiscoveryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.lock();
        state.stats.discovery_starts += 1;
        state.last_params = Some(params);

        if let Some(error) = state.pending_failure.take() {
            let _ = tx.send(DiscoveryEvent::Failed(error));
        } else {
            if !state.visible.is_empty() {
                let _ = tx.send(DiscoveryEvent::ReadersChanged(state.visible.clone()));
            }
            state.discovery = Some(tx);
        }
        debug!(site_id = params.site_id, "simulated discovery started");

        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn cancel_discovery(&self) -> Result<(), ReaderError> {
        {
            let mut state = self.shared.lock();
            state.stats.discovery_cancels += 1;
            state.discovery = None;
        }
        // The SDK acknowledges on its own schedule.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn connect(&self, reader: Reader) -> Result<Reader, ReaderError> {
        let (plan, delay, step) = {
            let mut state = self.shared.lock();
            state.stats.connect_attempts.push(reader.id.clone());
            (
                state.plans.pop_front().unwrap_or(ConnectPlan::Succeed),
                state.connect_delay,
                state.update_step,
            )
        };
        debug!(reader = %reader.id, ?plan, "simulated connect");

        if !delay.is_zero() {
            time::sleep(delay).await;
        }

        let result = match plan {
            ConnectPlan::Succeed => Ok(reader),
            ConnectPlan::Fail(error) => Err(error),
            ConnectPlan::UpdateThenSucceed { steps } => {
                self.run_update(&steps, step).await.map(|()| reader)
            }
            ConnectPlan::Manual => {
                let (tx, rx) = oneshot::channel();
                self.shared.lock().manual.push_back(tx);
                rx.await
                    .unwrap_or_else(|_| Err(ConnectionError::other("connect abandoned").into()))
            }
        };
        if result.is_err() {
            self.rescan_after(RESCAN_DELAY);
        }
        result
    }

    fn software_updates(&self) -> SoftwareUpdateStream {
        BroadcastStream::new(self.shared.updates.subscribe())
            .filter_map(|event| future::ready(event.ok()))
            .boxed()
    }
}

struct SimUpdateCancel {
    token: CancellationToken,
    shared: Arc<Shared>,
}

#[async_trait]
impl CancelUpdate for SimUpdateCancel {
    async fn cancel(&self) -> Result<(), ReaderError> {
        self.shared.lock().stats.update_cancels += 1;
        self.token.cancel();
        Ok(())
    }
}

// ── SimHandle ───────────────────────────────────────────────────────

/// Controls a [`SimulatedReaderService`] from the outside.
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<Shared>,
}

impl SimHandle {
    /// Replace the set of readers in range, reporting it to a running discovery.
    pub fn set_visible(&self, readers: Vec<Reader>) {
        let mut state = self.shared.lock();
        if let Some(tx) = &state.discovery {
            let _ = tx.send(DiscoveryEvent::ReadersChanged(readers.clone()));
        }
        state.visible = readers;
    }

    /// Fail the running discovery, or the next one to start.
    pub fn fail_discovery(&self, error: ReaderError) {
        let mut state = self.shared.lock();
        match state.discovery.take() {
            Some(tx) => {
                let _ = tx.send(DiscoveryEvent::Failed(error));
            }
            None => state.pending_failure = Some(error),
        }
    }

    pub fn push_plan(&self, plan: ConnectPlan) {
        self.shared.lock().plans.push_back(plan);
    }

    /// Resolve the oldest connect waiting under [`ConnectPlan::Manual`].
    /// Returns `false` when no connect was waiting.
    pub fn complete_connect(&self, result: Result<Reader, ReaderError>) -> bool {
        let waiting = self.shared.lock().manual.pop_front();
        match waiting {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Number of connects waiting under [`ConnectPlan::Manual`].
    pub fn waiting_connects(&self) -> usize {
        self.shared.lock().manual.len()
    }

    pub fn emit_update(&self, event: SoftwareUpdateEvent) {
        self.shared.emit(event);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.lock().connect_delay = delay;
    }

    /// Time between simulated update progress steps.
    pub fn set_update_step(&self, step: Duration) {
        self.shared.lock().update_step = step;
    }

    pub fn is_discovering(&self) -> bool {
        self.shared.lock().discovery.is_some()
    }

    pub fn last_discovery_params(&self) -> Option<DiscoveryParams> {
        self.shared.lock().last_params
    }

    pub fn stats(&self) -> SimStats {
        self.shared.lock().stats.clone()
    }
}

// ── Known readers and gateway ───────────────────────────────────────

/// A [`KnownReaderProvider`] holding the remembered reader in memory.
pub struct MemoryKnownReaders {
    tx: watch::Sender<KnownReaderState>,
}

impl MemoryKnownReaders {
    pub fn loaded(reader_id: Option<ReaderId>) -> Self {
        let (tx, _) = watch::channel(KnownReaderState::Loaded(reader_id));
        Self { tx }
    }

    /// A store that has not loaded yet; see [`finish_loading`](Self::finish_loading).
    pub fn loading() -> Self {
        let (tx, _) = watch::channel(KnownReaderState::Loading);
        Self { tx }
    }

    pub fn finish_loading(&self, reader_id: Option<ReaderId>) {
        self.tx.send_replace(KnownReaderState::Loaded(reader_id));
    }

    pub fn current(&self) -> Option<ReaderId> {
        self.tx.borrow().reader_id().cloned()
    }
}

impl KnownReaderProvider for MemoryKnownReaders {
    fn known_reader(&self) -> watch::Receiver<KnownReaderState> {
        self.tx.subscribe()
    }

    fn remember(&self, reader_id: &ReaderId) {
        debug!(reader = %reader_id, "remembering reader");
        self.tx
            .send_replace(KnownReaderState::Loaded(Some(reader_id.clone())));
    }
}

/// A [`GatewayAccountProvider`] with a fixed, or later supplied, account.
pub struct StaticGateway {
    tx: watch::Sender<Option<String>>,
}

impl StaticGateway {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(Some(gateway_id.into()));
        Self { tx }
    }

    /// No account yet; see [`set`](Self::set).
    pub fn pending() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn set(&self, gateway_id: impl Into<String>) {
        self.tx.send_replace(Some(gateway_id.into()));
    }
}

impl GatewayAccountProvider for StaticGateway {
    fn gateway_id(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}
