// ── Connection controller ──
//
// Public facade over one search session at a time. Each call to
// `search_and_connect` spawns a driver task that owns a fresh `Session`,
// merges every event source into it one event at a time, and carries
// out the effects it returns.

use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_core::Stream;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Sleep};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{CoreError, ReaderError};
use crate::model::{ConnectionResult, Reader};
use crate::service::{
    CardReaderService, DiscoveryEvent, DiscoveryStream, GatewayAccountProvider,
    KnownReaderProvider, KnownReaderState, SoftwareUpdateStream,
};
use crate::session::{AfterCancel, Effect, Event, Session};
use crate::ui::{ActionSink, Intent, UiState};

/// What a search hands to its completion callback.
pub type SearchResult = Result<ConnectionResult, CoreError>;

type Callback = Box<dyn FnOnce(SearchResult) + Send + 'static>;

// ── ConnectionController ────────────────────────────────────────────

/// Entry point for connecting a card reader.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. Runs at most one search
/// at a time; the UI state of that search is observable through
/// [`ui_state`](Self::ui_state).
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    service: Arc<dyn CardReaderService>,
    known_readers: Arc<dyn KnownReaderProvider>,
    gateway: Arc<dyn GatewayAccountProvider>,
    ui_state: watch::Sender<UiState>,
    searching: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionController {
    pub fn new(
        config: ControllerConfig,
        service: Arc<dyn CardReaderService>,
        known_readers: Arc<dyn KnownReaderProvider>,
        gateway: Arc<dyn GatewayAccountProvider>,
    ) -> Self {
        let (ui_state, _) = watch::channel(UiState::Idle);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                service,
                known_readers,
                gateway,
                ui_state,
                searching: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Search for a reader and connect to it, reporting the outcome to
    /// `on_completion` exactly once.
    ///
    /// Returns immediately. If a search is already running, this call's
    /// callback receives [`CoreError::SessionInProgress`] and the running
    /// search carries on undisturbed. An invalid configuration is reported
    /// as [`CoreError::Config`] without starting discovery.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn search_and_connect<F>(&self, on_completion: F)
    where
        F: FnOnce(SearchResult) + Send + 'static,
    {
        let mut completion = Completion::new(Box::new(on_completion));

        if self.inner.cancel.is_cancelled() {
            warn!("card reader search requested after shutdown");
            tokio::spawn(async move { completion.deliver(Err(CoreError::Shutdown)) });
            return;
        }
        if let Err(err) = self.inner.config.validate() {
            warn!(%err, "card reader search rejected");
            tokio::spawn(async move { completion.deliver(Err(err)) });
            return;
        }
        if self.inner.searching.swap(true, Ordering::AcqRel) {
            warn!("card reader search already in progress; rejecting the new one");
            tokio::spawn(async move { completion.deliver(Err(CoreError::SessionInProgress)) });
            return;
        }

        let driver = SessionDriver::new(Arc::clone(&self.inner), completion);
        tokio::spawn(driver.run());
    }

    /// Async form of [`search_and_connect`](Self::search_and_connect).
    pub async fn connect(&self) -> SearchResult {
        let (tx, rx) = oneshot::channel();
        self.search_and_connect(move |result| {
            // The caller stopped waiting; nothing left to tell.
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(CoreError::Shutdown))
    }

    /// Subscribe to the UI state of the current search.
    pub fn ui_state(&self) -> watch::Receiver<UiState> {
        self.inner.ui_state.subscribe()
    }

    /// UI state changes as a stream, starting with the current value.
    pub fn ui_state_stream(&self) -> WatchStream<UiState> {
        WatchStream::new(self.ui_state())
    }

    pub fn is_searching(&self) -> bool {
        self.inner.searching.load(Ordering::Acquire)
    }

    /// Stop the running search, if any, and refuse new ones.
    ///
    /// The running search asks the SDK to stop discovery and then
    /// completes with [`CoreError::Shutdown`].
    pub fn shutdown(&self) {
        info!("shutting down connection controller");
        self.inner.cancel.cancel();
    }
}

// ── Completion ──────────────────────────────────────────────────────

/// The caller's callback, consumed on first delivery.
struct Completion {
    callback: Option<Callback>,
}

impl Completion {
    fn new(callback: Callback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    fn is_delivered(&self) -> bool {
        self.callback.is_none()
    }

    fn deliver(&mut self, outcome: SearchResult) {
        match self.callback.take() {
            Some(callback) => callback(outcome),
            None => warn!("search result already delivered; dropping {outcome:?}"),
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!("search dropped before producing a result");
            callback(Err(CoreError::Shutdown));
        }
    }
}

// ── Session driver ──────────────────────────────────────────────────

/// A value tagged with the discovery generation or connect attempt it belongs to.
struct Tagged<T> {
    tag: u64,
    inner: T,
}

struct PendingCompletion {
    outcome: SearchResult,
    deadline: Pin<Box<Sleep>>,
}

type ConnectFuture = BoxFuture<'static, Result<Reader, ReaderError>>;
type CancelFuture = BoxFuture<'static, (AfterCancel, Result<(), ReaderError>)>;

struct SessionDriver {
    inner: Arc<ControllerInner>,
    session: Session,
    completion: Completion,
    intents: mpsc::UnboundedReceiver<Intent>,
    cancel: CancellationToken,
    shutdown_seen: bool,

    gateway: Option<watch::Receiver<Option<String>>>,
    known_reader: Option<watch::Receiver<KnownReaderState>>,
    discovery: Option<Tagged<DiscoveryStream>>,
    updates: Option<Tagged<SoftwareUpdateStream>>,
    connect: Option<Tagged<ConnectFuture>>,
    discovery_cancel: Option<CancelFuture>,
    pending: Option<PendingCompletion>,
}

impl SessionDriver {
    fn new(inner: Arc<ControllerInner>, completion: Completion) -> Self {
        let (tx, intents) = mpsc::unbounded_channel();
        let session = Session::new(inner.config.clone(), ActionSink::new(tx));
        let cancel = inner.cancel.child_token();
        let gateway = Some(inner.gateway.gateway_id());
        let known_reader = Some(inner.known_readers.known_reader());

        Self {
            inner,
            session,
            completion,
            intents,
            cancel,
            shutdown_seen: false,
            gateway,
            known_reader,
            discovery: None,
            updates: None,
            connect: None,
            discovery_cancel: None,
            pending: None,
        }
    }

    async fn run(mut self) {
        info!(site_id = self.inner.config.site_id, "card reader search started");

        let effects = self.session.start();
        self.apply(effects);

        if let Some(gateway) = self.gateway.as_mut() {
            let gateway_id = gateway.borrow_and_update().clone();
            self.dispatch(Event::GatewayChanged(gateway_id));
        }
        if let Some(known_reader) = self.known_reader.as_mut() {
            let known = known_reader.borrow_and_update().clone();
            self.dispatch(Event::KnownReaderChanged(known));
        }

        while !self.completion.is_delivered() {
            let event = tokio::select! {
                biased;

                () = self.cancel.cancelled(), if !self.shutdown_seen => {
                    self.shutdown_seen = true;
                    if self.pending.is_some() {
                        self.deliver_pending();
                        None
                    } else {
                        Some(Event::Shutdown)
                    }
                }

                () = deadline(&mut self.pending) => {
                    self.deliver_pending();
                    None
                }

                Some(intent) = self.intents.recv() => Some(Event::User(intent)),

                changed = watch_next(&mut self.gateway) => match changed {
                    Some(gateway_id) => Some(Event::GatewayChanged(gateway_id)),
                    None => {
                        debug!("gateway account source closed");
                        self.gateway = None;
                        None
                    }
                },

                changed = watch_next(&mut self.known_reader) => match changed {
                    Some(known) => Some(Event::KnownReaderChanged(known)),
                    None => {
                        debug!("known reader source closed");
                        self.known_reader = None;
                        None
                    }
                },

                (then, result) = resolve(&mut self.discovery_cancel) => {
                    self.discovery_cancel = None;
                    Some(Event::DiscoveryCancelled { then, result })
                }

                (generation, item) = next_tagged(&mut self.discovery) => match item {
                    Some(DiscoveryEvent::ReadersChanged(readers)) => {
                        Some(Event::ReadersDiscovered { generation, readers })
                    }
                    Some(DiscoveryEvent::Failed(error)) => {
                        Some(Event::DiscoveryFailed { generation, error })
                    }
                    None => {
                        debug!(generation, "discovery stream ended");
                        self.discovery = None;
                        None
                    }
                },

                (attempt, item) = next_tagged(&mut self.updates) => match item {
                    Some(event) => Some(Event::Update { attempt, event }),
                    None => {
                        self.updates = None;
                        None
                    }
                },

                (attempt, result) = resolve_tagged(&mut self.connect) => {
                    self.connect = None;
                    self.drain_updates();
                    Some(Event::ConnectFinished { attempt, result })
                }
            };

            if let Some(event) = event {
                self.dispatch(event);
            }
        }

        debug!(state = self.session.state().name(), "search driver exiting");
    }

    /// Hand over update events the SDK reported before the connect resolved.
    fn drain_updates(&mut self) {
        while let Some(updates) = self.updates.as_mut() {
            let attempt = updates.tag;
            let next = updates.inner.next().now_or_never();
            match next {
                Some(Some(event)) => self.dispatch(Event::Update { attempt, event }),
                Some(None) => self.updates = None,
                None => break,
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let effects = self.session.handle(event);
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartDiscovery { generation, params } => {
                    debug!(generation, method = %params.method, "starting discovery");
                    self.discovery = Some(Tagged {
                        tag: generation,
                        inner: self.inner.service.discover(params),
                    });
                }
                Effect::StopDiscovery => self.discovery = None,
                Effect::CancelDiscovery { then } => {
                    debug!(?then, "cancelling discovery");
                    self.discovery = None;
                    let service = Arc::clone(&self.inner.service);
                    self.discovery_cancel =
                        Some(async move { (then, service.cancel_discovery().await) }.boxed());
                }
                Effect::ObserveUpdates { attempt } => {
                    self.updates = Some(Tagged {
                        tag: attempt,
                        inner: self.inner.service.software_updates(),
                    });
                }
                Effect::Connect { attempt, reader } => {
                    let service = Arc::clone(&self.inner.service);
                    self.connect = Some(Tagged {
                        tag: attempt,
                        inner: async move { service.connect(reader).await }.boxed(),
                    });
                }
                Effect::ReleaseConnectAttempt => {
                    self.connect = None;
                    self.updates = None;
                }
                Effect::CancelUpdate(handle) => {
                    tokio::spawn(async move {
                        if let Err(error) = handle.cancel().await {
                            warn!(%error, "cancelling the reader software update failed");
                        }
                    });
                }
                Effect::Remember(reader_id) => self.inner.known_readers.remember(&reader_id),
                Effect::Present(ui) => {
                    debug!(ui = ui.name(), "presenting");
                    self.inner.ui_state.send_replace(ui);
                }
                Effect::Complete { outcome, delay } => match delay {
                    Some(delay) => self.hold(outcome, delay),
                    None => self.finish(outcome),
                },
            }
        }
    }

    /// Keep the result back for `delay` so the finished update stays on screen.
    fn hold(&mut self, outcome: SearchResult, delay: Duration) {
        debug!(?delay, "holding the result after a completed update");
        self.discovery = None;
        self.updates = None;
        self.pending = Some(PendingCompletion {
            outcome,
            deadline: Box::pin(time::sleep(delay)),
        });
    }

    fn deliver_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.finish(pending.outcome);
        }
    }

    fn finish(&mut self, outcome: SearchResult) {
        self.discovery = None;
        self.updates = None;
        self.connect = None;
        self.discovery_cancel = None;

        match &outcome {
            Ok(ConnectionResult::Connected(reader)) => {
                info!(reader = %reader.id, "card reader search finished: connected");
            }
            Ok(ConnectionResult::Canceled(source)) => {
                info!(%source, "card reader search finished: cancelled");
            }
            Err(error) => info!(%error, "card reader search finished with an error"),
        }

        // Reset before the callback runs so it may start the next search.
        self.inner.ui_state.send_replace(UiState::Idle);
        self.inner.searching.store(false, Ordering::Release);
        self.completion.deliver(outcome);
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        if !self.completion.is_delivered() {
            self.inner.ui_state.send_replace(UiState::Idle);
            self.inner.searching.store(false, Ordering::Release);
        }
    }
}

// ── Select helpers ──────────────────────────────────────────────────
//
// Each resolves with the next item of an optional source, or never
// resolves when the source is absent.

async fn watch_next<T: Clone>(rx: &mut Option<watch::Receiver<T>>) -> Option<T> {
    let Some(rx) = rx.as_mut() else {
        return future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => Some(rx.borrow_and_update().clone()),
        Err(_) => None,
    }
}

async fn next_tagged<S>(slot: &mut Option<Tagged<S>>) -> (u64, Option<S::Item>)
where
    S: Stream + Unpin,
{
    match slot {
        Some(tagged) => (tagged.tag, tagged.inner.next().await),
        None => future::pending().await,
    }
}

async fn resolve_tagged<F>(slot: &mut Option<Tagged<F>>) -> (u64, F::Output)
where
    F: Future + Unpin,
{
    match slot {
        Some(tagged) => {
            let tag = tagged.tag;
            (tag, (&mut tagged.inner).await)
        }
        None => future::pending().await,
    }
}

async fn resolve<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot {
        Some(fut) => fut.await,
        None => future::pending().await,
    }
}

async fn deadline(pending: &mut Option<PendingCompletion>) {
    match pending {
        Some(pending) => pending.deadline.as_mut().await,
        None => future::pending().await,
    }
}
