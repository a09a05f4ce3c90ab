// ── Search session state machine ──
//
// One `Session` exists per `search_and_connect` call. It does no I/O:
// the driver in `controller` feeds it events from the collaborators and
// from merchant actions, and performs the effects it returns. Because
// every event goes through `handle`, state changes never interleave.

use std::collections::HashSet;
use std::mem;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ControllerConfig, DiscoveryParams};
use crate::error::{ConnectionError, CoreError, ReaderError, SoftwareUpdateError};
use crate::model::{CancellationSource, ConnectionResult, Reader, ReaderId};
use crate::service::{KnownReaderState, SoftwareUpdateEvent, UpdateCancelHandle};
use crate::ui::{ActionSink, Intent, UiState};

// ── State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ControllerState {
    Idle,
    /// Waiting for the gateway account.
    Initializing,
    /// Waiting for the known-reader store to load.
    PreparingForSearch,
    BeginSearch,
    Searching,
    FoundReader,
    FoundSeveralReaders,
    ConnectToReader,
    ConnectingFailed(ReaderError),
    Updating { progress: f32 },
    Retry,
    Cancel(CancellationSource),
    DiscoveryFailed(ReaderError),
}

impl ControllerState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::PreparingForSearch => "preparing_for_search",
            Self::BeginSearch => "begin_search",
            Self::Searching => "searching",
            Self::FoundReader => "found_reader",
            Self::FoundSeveralReaders => "found_several_readers",
            Self::ConnectToReader => "connect_to_reader",
            Self::ConnectingFailed(_) => "connecting_failed",
            Self::Updating { .. } => "updating",
            Self::Retry => "retry",
            Self::Cancel(_) => "cancel",
            Self::DiscoveryFailed(_) => "discovery_failed",
        }
    }

    fn is_connecting(&self) -> bool {
        matches!(self, Self::ConnectToReader | Self::Updating { .. })
    }
}

// ── Events and effects ──────────────────────────────────────────────

/// What to do once the SDK acknowledges a discovery cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterCancel {
    /// Start a fresh discovery.
    Restart,
    /// End the session as cancelled by the merchant.
    Finish(CancellationSource),
    /// End the session because the controller is shutting down.
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Event {
    GatewayChanged(Option<String>),
    KnownReaderChanged(KnownReaderState),
    ReadersDiscovered {
        generation: u64,
        readers: Vec<Reader>,
    },
    DiscoveryFailed {
        generation: u64,
        error: ReaderError,
    },
    DiscoveryCancelled {
        then: AfterCancel,
        result: Result<(), ReaderError>,
    },
    Update {
        attempt: u64,
        event: SoftwareUpdateEvent,
    },
    ConnectFinished {
        attempt: u64,
        result: Result<Reader, ReaderError>,
    },
    User(Intent),
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Effect {
    /// Start discovery; events are tagged with `generation`.
    StartDiscovery {
        generation: u64,
        params: DiscoveryParams,
    },
    /// Drop the discovery subscription without asking the SDK to cancel.
    StopDiscovery,
    /// Drop the discovery subscription and ask the SDK to cancel.
    CancelDiscovery { then: AfterCancel },
    /// Subscribe to software updates for connect attempt `attempt`.
    ObserveUpdates { attempt: u64 },
    Connect { attempt: u64, reader: Reader },
    /// Drop the in-flight connect and its update subscription.
    ReleaseConnectAttempt,
    CancelUpdate(UpdateCancelHandle),
    Remember(ReaderId),
    Present(UiState),
    Complete {
        outcome: Result<ConnectionResult, CoreError>,
        delay: Option<Duration>,
    },
}

// ── Session ─────────────────────────────────────────────────────────

#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Session {
    config: ControllerConfig,
    actions: ActionSink,
    state: ControllerState,

    found_readers: Vec<Reader>,
    known_reader: KnownReaderState,
    skipped_reader_ids: HashSet<ReaderId>,
    candidate_reader: Option<Reader>,
    sticky_list_mode: bool,
    auto_connect_attempted: bool,
    gateway_id: Option<String>,
    update_cancel: Option<UpdateCancelHandle>,

    discovery_generation: u64,
    discovery_active: bool,
    discovery_cancel_pending: bool,
    connect_attempt: u64,
    connect_in_flight: bool,
    shutting_down: bool,
    finished: bool,

    effects: Vec<Effect>,
}

impl Session {
    pub(crate) fn new(config: ControllerConfig, actions: ActionSink) -> Self {
        Self {
            config,
            actions,
            state: ControllerState::Idle,
            found_readers: Vec::new(),
            known_reader: KnownReaderState::Loading,
            skipped_reader_ids: HashSet::new(),
            candidate_reader: None,
            sticky_list_mode: false,
            auto_connect_attempted: false,
            gateway_id: None,
            update_cancel: None,
            discovery_generation: 0,
            discovery_active: false,
            discovery_cancel_pending: false,
            connect_attempt: 0,
            connect_in_flight: false,
            shutting_down: false,
            finished: false,
            effects: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> &ControllerState {
        &self.state
    }

    /// True once the session has produced its result.
    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn start(&mut self) -> Vec<Effect> {
        self.transition(ControllerState::Initializing);
        mem::take(&mut self.effects)
    }

    pub(crate) fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::GatewayChanged(gateway_id) => self.on_gateway_changed(gateway_id),
            Event::KnownReaderChanged(known) => self.on_known_reader_changed(known),
            Event::ReadersDiscovered {
                generation,
                readers,
            } => self.on_readers_discovered(generation, readers),
            Event::DiscoveryFailed { generation, error } => {
                self.on_discovery_failed(generation, error);
            }
            Event::DiscoveryCancelled { then, result } => self.on_discovery_cancelled(then, result),
            Event::Update { attempt, event } => self.on_update_event(attempt, event),
            Event::ConnectFinished { attempt, result } => {
                self.on_connect_finished(attempt, result);
            }
            Event::User(intent) => self.on_intent(intent),
            Event::Shutdown => self.on_shutdown(),
        }
        mem::take(&mut self.effects)
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Enter `next`, then keep following whatever its entry step asks for.
    fn transition(&mut self, next: ControllerState) {
        let mut next = Some(next);
        while let Some(state) = next.take() {
            debug!(from = self.state.name(), to = state.name(), state = ?state, "state transition");
            self.state = state;
            next = self.on_enter();
        }
    }

    fn on_enter(&mut self) -> Option<ControllerState> {
        match &self.state {
            ControllerState::Idle => None,
            ControllerState::Initializing => {
                if self.gateway_id.is_some() {
                    Some(ControllerState::PreparingForSearch)
                } else {
                    debug!("waiting for the payment gateway account");
                    None
                }
            }
            ControllerState::PreparingForSearch => {
                self.skipped_reader_ids.clear();
                self.candidate_reader = None;
                self.sticky_list_mode = false;
                match self.known_reader {
                    KnownReaderState::Loaded(_) => Some(ControllerState::BeginSearch),
                    KnownReaderState::Loading => {
                        debug!("waiting for the known reader store");
                        None
                    }
                }
            }
            ControllerState::BeginSearch => {
                self.discovery_generation += 1;
                self.discovery_active = true;
                self.found_readers.clear();
                self.auto_connect_attempted = false;
                self.effects.push(Effect::StartDiscovery {
                    generation: self.discovery_generation,
                    params: self.config.discovery_params(),
                });
                Some(ControllerState::Searching)
            }
            ControllerState::Searching => {
                let next = self.evaluate_found_readers();
                if next.is_none() {
                    self.present(UiState::ScanningForReader {
                        cancel: self.actions.cancel(CancellationSource::SearchingForReader),
                    });
                }
                next
            }
            ControllerState::FoundReader => match self.candidate_reader.clone() {
                Some(candidate) => {
                    self.present(UiState::FoundReader {
                        name: candidate.display_name().to_owned(),
                        reader_id: candidate.id,
                        connect: self.actions.action(Intent::ConnectCandidate),
                        continue_search: self.actions.action(Intent::SkipCandidate),
                        cancel_search: self.actions.cancel(CancellationSource::FoundReader),
                    });
                    None
                }
                None => Some(ControllerState::Searching),
            },
            ControllerState::FoundSeveralReaders => {
                self.present(UiState::FoundSeveralReaders {
                    readers: self.found_readers.clone(),
                    connect: self.actions.connect(),
                    cancel_search: self.actions.cancel(CancellationSource::FoundSeveralReaders),
                });
                None
            }
            ControllerState::ConnectToReader => self.begin_connect(),
            ControllerState::ConnectingFailed(error) => {
                let error = error.clone();
                self.on_connecting_failed(&error)
            }
            ControllerState::Updating { progress } => {
                let progress = *progress;
                self.present_update_progress(progress);
                None
            }
            ControllerState::Retry => {
                self.present(UiState::Dismissed);
                self.cancel_discovery(AfterCancel::Restart);
                None
            }
            ControllerState::Cancel(source) => {
                let source = *source;
                self.cancel_discovery(AfterCancel::Finish(source));
                None
            }
            ControllerState::DiscoveryFailed(error) => {
                let error = error.clone();
                let close = self.actions.action(Intent::CloseScanFailure);
                self.present(UiState::ScanningFailed { error, close });
                None
            }
        }
    }

    // ── Collaborator events ──────────────────────────────────────────

    fn on_gateway_changed(&mut self, gateway_id: Option<String>) {
        self.gateway_id = gateway_id;
        if self.state == ControllerState::Initializing && self.gateway_id.is_some() {
            self.transition(ControllerState::PreparingForSearch);
        }
    }

    fn on_known_reader_changed(&mut self, known: KnownReaderState) {
        let loaded = matches!(known, KnownReaderState::Loaded(_));
        self.known_reader = known;
        if loaded && self.state == ControllerState::PreparingForSearch {
            self.transition(ControllerState::BeginSearch);
        }
    }

    fn on_readers_discovered(&mut self, generation: u64, readers: Vec<Reader>) {
        if !self.is_current_discovery(generation) {
            debug!(generation, "readers from a superseded discovery ignored");
            return;
        }

        self.found_readers = readers;
        if self.found_readers.len() > 1 {
            self.sticky_list_mode = true;
        }
        self.prune_skipped_readers();

        match self.state {
            ControllerState::FoundSeveralReaders => {
                self.present(UiState::UpdateSeveralReadersList {
                    readers: self.found_readers.clone(),
                    connect: self.actions.connect(),
                    cancel_search: self.actions.cancel(CancellationSource::FoundSeveralReaders),
                });
            }
            ControllerState::Searching => {
                if let Some(next) = self.evaluate_found_readers() {
                    self.transition(next);
                }
            }
            _ => {}
        }
    }

    fn on_discovery_failed(&mut self, generation: u64, error: ReaderError) {
        if !self.is_current_discovery(generation) {
            debug!(generation, "failure from a superseded discovery ignored");
            return;
        }
        self.discovery_active = false;
        self.effects.push(Effect::StopDiscovery);

        if self.finished || self.shutting_down {
            return;
        }
        if self.connect_in_flight {
            warn!(attempt = self.connect_attempt, "discovery failed mid-connect; abandoning the attempt");
            self.release_connect_attempt();
        }
        warn!(%error, "card reader discovery failed");
        self.transition(ControllerState::DiscoveryFailed(error));
    }

    fn on_discovery_cancelled(&mut self, then: AfterCancel, result: Result<(), ReaderError>) {
        self.discovery_cancel_pending = false;
        if let Err(error) = result {
            warn!(%error, "cancelling discovery failed; carrying on");
        }
        if self.finished {
            return;
        }
        if self.shutting_down {
            self.finish(Err(CoreError::Shutdown), None);
            return;
        }

        match then {
            AfterCancel::Restart if self.state == ControllerState::Retry => {
                self.transition(ControllerState::BeginSearch);
            }
            AfterCancel::Finish(source) if self.state == ControllerState::Cancel(source) => {
                info!(%source, "card reader search cancelled");
                self.finish(Ok(ConnectionResult::Canceled(source)), None);
            }
            AfterCancel::Shutdown => self.finish(Err(CoreError::Shutdown), None),
            then => {
                debug!(?then, state = self.state.name(), "discovery cancel acknowledged in another state");
            }
        }
    }

    fn on_update_event(&mut self, attempt: u64, event: SoftwareUpdateEvent) {
        if !self.is_current_attempt(attempt) || !self.state.is_connecting() {
            debug!(attempt, "update event for a superseded connect attempt ignored");
            return;
        }

        match event {
            SoftwareUpdateEvent::Started { cancel } => {
                info!("mandatory reader software update started");
                self.update_cancel = Some(cancel);
                self.transition(ControllerState::Updating { progress: 0.0 });
            }
            SoftwareUpdateEvent::Installing { progress } => {
                let progress = progress.clamp(0.0, 1.0);
                if progress >= self.config.update_cancel_threshold {
                    self.update_cancel = None;
                }
                self.transition(ControllerState::Updating { progress });
            }
            SoftwareUpdateEvent::Completed => {
                info!("mandatory reader software update completed");
                self.update_cancel = None;
                self.transition(ControllerState::Updating { progress: 1.0 });
            }
            SoftwareUpdateEvent::Other => {}
        }
    }

    fn on_connect_finished(&mut self, attempt: u64, result: Result<Reader, ReaderError>) {
        if !self.is_current_attempt(attempt) {
            debug!(attempt, "result of a superseded connect attempt ignored");
            return;
        }
        self.release_connect_attempt();

        if self.finished || self.shutting_down || !self.state.is_connecting() {
            warn!(state = self.state.name(), "connect finished after the session moved on; ignoring");
            return;
        }

        match result {
            Ok(reader) => {
                info!(reader = %reader.id, "connected to card reader");
                self.effects.push(Effect::Remember(reader.id.clone()));
                let just_updated =
                    matches!(self.state, ControllerState::Updating { progress } if progress >= 1.0);
                let delay = just_updated.then_some(self.config.update_success_delay);
                self.finish(Ok(ConnectionResult::Connected(reader)), delay);
            }
            Err(error) => {
                warn!(%error, "connecting to card reader failed");
                self.transition(ControllerState::ConnectingFailed(error));
            }
        }
    }

    fn on_shutdown(&mut self) {
        if self.finished || self.shutting_down {
            return;
        }
        info!("shutting down card reader search");
        self.shutting_down = true;
        if self.connect_in_flight {
            self.release_connect_attempt();
        }
        if !self.discovery_cancel_pending {
            self.cancel_discovery(AfterCancel::Shutdown);
        }
    }

    // ── Merchant actions ─────────────────────────────────────────────

    fn on_intent(&mut self, intent: Intent) {
        if self.finished || self.shutting_down {
            debug!(?intent, "action after the search ended ignored");
            return;
        }

        match intent {
            Intent::ConnectCandidate if self.state == ControllerState::FoundReader => {
                self.transition(ControllerState::ConnectToReader);
            }
            Intent::SkipCandidate if self.state == ControllerState::FoundReader => {
                if let Some(candidate) = self.candidate_reader.take() {
                    debug!(reader = %candidate.id, "reader skipped for this search");
                    self.skipped_reader_ids.insert(candidate.id);
                }
                self.prune_skipped_readers();
                self.transition(ControllerState::Searching);
            }
            Intent::ConnectTo(reader_id) if self.state == ControllerState::FoundSeveralReaders => {
                match self.found_readers.iter().find(|r| r.id == reader_id) {
                    Some(reader) => {
                        self.candidate_reader = Some(reader.clone());
                        self.transition(ControllerState::ConnectToReader);
                    }
                    None => warn!(reader = %reader_id, "selected reader is no longer visible"),
                }
            }
            Intent::ContinueSearch if self.is_connecting_failed() => {
                self.transition(ControllerState::Searching);
            }
            Intent::Retry if self.is_connecting_failed() => {
                self.transition(ControllerState::Retry);
            }
            Intent::RefreshIncompleteAddress if self.is_connecting_failed() => {
                self.present(self.incomplete_address_prompt(None));
            }
            Intent::CancelUpdate if matches!(self.state, ControllerState::Updating { .. }) => {
                self.cancel_update();
            }
            Intent::CloseScanFailure => {
                if let ControllerState::DiscoveryFailed(error) = &self.state {
                    let error = error.clone();
                    self.finish(Err(CoreError::DiscoveryFailed(error)), None);
                } else {
                    self.ignore(&Intent::CloseScanFailure);
                }
            }
            Intent::Cancel(source) if self.accepts_cancel() => {
                self.transition(ControllerState::Cancel(source));
            }
            intent => self.ignore(&intent),
        }
    }

    fn ignore(&self, intent: &Intent) {
        warn!(?intent, state = self.state.name(), "action not valid in the current state ignored");
    }

    fn accepts_cancel(&self) -> bool {
        matches!(
            self.state,
            ControllerState::Searching
                | ControllerState::FoundReader
                | ControllerState::FoundSeveralReaders
                | ControllerState::ConnectingFailed(_)
        )
    }

    fn is_connecting_failed(&self) -> bool {
        matches!(self.state, ControllerState::ConnectingFailed(_))
    }

    fn cancel_update(&mut self) {
        let Some(handle) = self.update_cancel.take() else {
            debug!("update can no longer be cancelled");
            return;
        };
        info!("cancelling reader software update");
        self.effects.push(Effect::CancelUpdate(handle));
        if let ControllerState::Updating { progress } = self.state {
            self.present_update_progress(progress);
        }
    }

    // ── Reader selection ─────────────────────────────────────────────

    /// Where `searching` should go next given the readers in view, if anywhere.
    fn evaluate_found_readers(&mut self) -> Option<ControllerState> {
        if !self.auto_connect_attempted {
            if let Some(known) = self.found_known_reader() {
                info!(reader = %known.id, "known reader found; connecting automatically");
                self.auto_connect_attempted = true;
                self.candidate_reader = Some(known);
                return Some(ControllerState::ConnectToReader);
            }
        }

        if self.sticky_list_mode {
            return Some(ControllerState::FoundSeveralReaders);
        }

        if let [only] = self.found_readers.as_slice() {
            self.candidate_reader = Some(only.clone());
            return Some(ControllerState::FoundReader);
        }

        None
    }

    fn found_known_reader(&self) -> Option<Reader> {
        let known = self.known_reader.reader_id()?;
        self.found_readers.iter().find(|r| &r.id == known).cloned()
    }

    /// Hide skipped readers, unless the list view is in use.
    fn prune_skipped_readers(&mut self) {
        if self.sticky_list_mode {
            return;
        }
        let skipped = &self.skipped_reader_ids;
        self.found_readers.retain(|r| !skipped.contains(&r.id));
    }

    // ── Connecting ───────────────────────────────────────────────────

    fn begin_connect(&mut self) -> Option<ControllerState> {
        let Some(reader) = self.candidate_reader.clone() else {
            warn!("no candidate reader to connect to");
            return Some(ControllerState::Searching);
        };

        self.connect_attempt += 1;
        self.connect_in_flight = true;
        self.update_cancel = None;
        info!(reader = %reader.id, attempt = self.connect_attempt, "connecting to card reader");
        self.effects.push(Effect::ObserveUpdates {
            attempt: self.connect_attempt,
        });
        self.effects.push(Effect::Connect {
            attempt: self.connect_attempt,
            reader,
        });
        self.present(UiState::ConnectingToReader);
        None
    }

    fn on_connecting_failed(&mut self, error: &ReaderError) -> Option<ControllerState> {
        self.found_readers.clear();
        self.candidate_reader = None;

        let prompt = match error {
            ReaderError::SoftwareUpdate {
                error: SoftwareUpdateError::InterruptedByUser,
                ..
            } => {
                info!("software update was interrupted; resuming search");
                return Some(ControllerState::Searching);
            }
            ReaderError::SoftwareUpdate {
                error: SoftwareUpdateError::BatteryTooLow,
                battery_level,
            } => UiState::UpdatingFailedLowBattery {
                battery_level: *battery_level,
                close: self.actions.action(Intent::ContinueSearch),
            },
            ReaderError::SoftwareUpdate { .. } => UiState::UpdatingFailed {
                close: self.actions.action(Intent::ContinueSearch),
            },
            ReaderError::Connection(ConnectionError::IncompleteStoreAddress { admin_url }) => {
                self.incomplete_address_prompt(admin_url.clone())
            }
            ReaderError::Connection(ConnectionError::InvalidPostalCode) => {
                UiState::ConnectingFailedInvalidPostalCode {
                    retry_search: self.actions.action(Intent::Retry),
                    cancel_search: self.actions.cancel(CancellationSource::ConnectionError),
                }
            }
            ReaderError::Connection(ConnectionError::CriticallyLowBatteryBluetooth) => {
                UiState::ConnectingFailedCriticallyLowBattery {
                    retry_search: self.actions.action(Intent::Retry),
                    cancel_search: self.actions.cancel(CancellationSource::ConnectionError),
                }
            }
            ReaderError::Connection(ConnectionError::Other { .. }) | ReaderError::Discovery { .. } => {
                UiState::ConnectingFailed {
                    error: error.clone(),
                    continue_search: self.actions.action(Intent::ContinueSearch),
                    cancel_search: self.actions.cancel(CancellationSource::ConnectionError),
                }
            }
        };
        self.present(prompt);
        None
    }

    fn incomplete_address_prompt(&self, admin_url: Option<Url>) -> UiState {
        UiState::ConnectingFailedIncompleteAddress {
            admin_url,
            refresh: self.actions.action(Intent::RefreshIncompleteAddress),
            retry_search: self.actions.action(Intent::Retry),
            cancel_search: self.actions.cancel(CancellationSource::ConnectionError),
        }
    }

    fn present_update_progress(&mut self, progress: f32) {
        let cancel = self
            .update_cancel
            .as_ref()
            .map(|_| self.actions.action(Intent::CancelUpdate));
        self.present(UiState::UpdateInProgress {
            required_update: true,
            progress,
            cancel,
        });
    }

    fn release_connect_attempt(&mut self) {
        self.connect_in_flight = false;
        self.update_cancel = None;
        self.effects.push(Effect::ReleaseConnectAttempt);
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn is_current_discovery(&self, generation: u64) -> bool {
        self.discovery_active && generation == self.discovery_generation
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        self.connect_in_flight && attempt == self.connect_attempt
    }

    fn cancel_discovery(&mut self, then: AfterCancel) {
        self.discovery_active = false;
        self.discovery_cancel_pending = true;
        self.effects.push(Effect::CancelDiscovery { then });
    }

    fn present(&mut self, ui: UiState) {
        self.effects.push(Effect::Present(ui));
    }

    fn finish(&mut self, outcome: Result<ConnectionResult, CoreError>, delay: Option<Duration>) {
        if self.finished {
            warn!("search already produced a result; dropping the second one");
            return;
        }
        self.finished = true;
        if self.connect_in_flight {
            self.release_connect_attempt();
        }
        self.effects.push(Effect::Complete { outcome, delay });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::model::ReaderModel;

    // ── Harness ──────────────────────────────────────────────────────

    struct Harness {
        session: Session,
        intents: mpsc::UnboundedReceiver<Intent>,
        presented: Vec<UiState>,
        effects: Vec<Effect>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, intents) = mpsc::unbounded_channel();
            let session = Session::new(ControllerConfig::new(42), ActionSink::new(tx));
            let mut harness = Self {
                session,
                intents,
                presented: Vec::new(),
                effects: Vec::new(),
            };
            let effects = harness.session.start();
            harness.record(effects);
            harness
        }

        /// A session already searching, with `known` as the remembered reader.
        fn searching(known: Option<&str>) -> Self {
            let mut harness = Self::new();
            harness.send(Event::GatewayChanged(Some("acct_1".into())));
            harness.send(Event::KnownReaderChanged(KnownReaderState::Loaded(
                known.map(ReaderId::new),
            )));
            assert_eq!(harness.state(), &ControllerState::Searching);
            harness
        }

        fn send(&mut self, event: Event) {
            let effects = self.session.handle(event);
            self.record(effects);
        }

        fn discover(&mut self, ids: &[&str]) {
            let readers = ids
                .iter()
                .map(|id| Reader::new(*id, ReaderModel::Chipper2X))
                .collect();
            self.send(Event::ReadersDiscovered {
                generation: self.session.discovery_generation,
                readers,
            });
        }

        fn connect_result(&mut self, result: Result<Reader, ReaderError>) {
            self.send(Event::ConnectFinished {
                attempt: self.session.connect_attempt,
                result,
            });
        }

        fn update(&mut self, event: SoftwareUpdateEvent) {
            self.send(Event::Update {
                attempt: self.session.connect_attempt,
                event,
            });
        }

        /// Tap an action and feed the resulting intent back in.
        fn tap(&mut self, action: &crate::ui::UiAction) {
            action.invoke();
            let intent = self.intents.try_recv().unwrap();
            self.send(Event::User(intent));
        }

        fn pick(&mut self, reader_id: &str) {
            let connect = match self.last_ui() {
                Some(
                    UiState::FoundSeveralReaders { connect, .. }
                    | UiState::UpdateSeveralReadersList { connect, .. },
                ) => connect.clone(),
                other => panic!("list prompt not shown: {other:?}"),
            };
            connect.invoke(&ReaderId::new(reader_id));
            let intent = self.intents.try_recv().unwrap();
            self.send(Event::User(intent));
        }

        fn record(&mut self, effects: Vec<Effect>) {
            for effect in effects {
                if let Effect::Present(ui) = &effect {
                    self.presented.push(ui.clone());
                }
                self.effects.push(effect);
            }
        }

        fn state(&self) -> &ControllerState {
            self.session.state()
        }

        fn last_ui(&self) -> Option<&UiState> {
            self.presented.last()
        }

        fn shown(&self, name: &str) -> usize {
            self.presented.iter().filter(|ui| ui.name() == name).count()
        }

        fn connect_requests(&self) -> Vec<&str> {
            self.effects
                .iter()
                .filter_map(|e| match e {
                    Effect::Connect { reader, .. } => Some(reader.id.as_str()),
                    _ => None,
                })
                .collect()
        }

        fn completions(&self) -> Vec<&Effect> {
            self.effects
                .iter()
                .filter(|e| matches!(e, Effect::Complete { .. }))
                .collect()
        }

        fn discovery_starts(&self) -> usize {
            self.effects
                .iter()
                .filter(|e| matches!(e, Effect::StartDiscovery { .. }))
                .count()
        }
    }

    fn found_reader_actions(ui: Option<&UiState>) -> (crate::ui::UiAction, crate::ui::UiAction) {
        match ui {
            Some(UiState::FoundReader {
                connect,
                continue_search,
                ..
            }) => (connect.clone(), continue_search.clone()),
            other => panic!("expected found reader prompt, got {other:?}"),
        }
    }

    // ── Start-up gating ──────────────────────────────────────────────

    #[test]
    fn waits_for_gateway_before_anything_else() {
        let mut h = Harness::new();
        assert_eq!(h.state(), &ControllerState::Initializing);

        h.send(Event::KnownReaderChanged(KnownReaderState::Loaded(None)));
        assert_eq!(h.state(), &ControllerState::Initializing);
        assert_eq!(h.discovery_starts(), 0);

        h.send(Event::GatewayChanged(None));
        assert_eq!(h.state(), &ControllerState::Initializing);

        h.send(Event::GatewayChanged(Some("acct_1".into())));
        assert_eq!(h.state(), &ControllerState::Searching);
        assert_eq!(h.discovery_starts(), 1);
    }

    #[test]
    fn waits_for_known_reader_store_to_load() {
        let mut h = Harness::new();
        h.send(Event::GatewayChanged(Some("acct_1".into())));
        assert_eq!(h.state(), &ControllerState::PreparingForSearch);

        h.send(Event::KnownReaderChanged(KnownReaderState::Loading));
        assert_eq!(h.state(), &ControllerState::PreparingForSearch);

        h.send(Event::KnownReaderChanged(KnownReaderState::Loaded(None)));
        assert_eq!(h.state(), &ControllerState::Searching);
        assert_eq!(h.last_ui().map(UiState::name), Some("scanning_for_reader"));
    }

    #[test]
    fn discovery_uses_configured_site() {
        let h = Harness::searching(None);
        let params = h.effects.iter().find_map(|e| match e {
            Effect::StartDiscovery { params, .. } => Some(*params),
            _ => None,
        });
        assert_eq!(params.map(|p| p.site_id), Some(42));
    }

    // ── Disambiguation ───────────────────────────────────────────────

    #[test]
    fn single_unknown_reader_is_offered() {
        let mut h = Harness::searching(None);
        h.discover(&["A"]);

        assert_eq!(h.state(), &ControllerState::FoundReader);
        match h.last_ui() {
            Some(UiState::FoundReader { reader_id, name, .. }) => {
                assert_eq!(reader_id.as_str(), "A");
                assert_eq!(name, "A");
            }
            other => panic!("unexpected ui: {other:?}"),
        }
    }

    #[test]
    fn skipped_reader_is_not_offered_again_until_list_mode() {
        let mut h = Harness::searching(None);
        h.discover(&["A"]);
        let (_, keep_searching) = found_reader_actions(h.last_ui());
        h.tap(&keep_searching);

        assert_eq!(h.state(), &ControllerState::Searching);
        assert_eq!(h.last_ui().map(UiState::name), Some("scanning_for_reader"));

        h.discover(&["A"]);
        assert_eq!(h.state(), &ControllerState::Searching);
        assert_eq!(h.shown("found_reader"), 1);

        h.discover(&["A", "B"]);
        assert_eq!(h.state(), &ControllerState::FoundSeveralReaders);
        let ids: Vec<_> = h
            .last_ui()
            .and_then(UiState::listed_readers)
            .unwrap()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn list_mode_is_sticky_for_the_rest_of_the_session() {
        let mut h = Harness::searching(None);
        h.discover(&["A", "B"]);
        assert_eq!(h.state(), &ControllerState::FoundSeveralReaders);

        h.discover(&["A"]);
        h.discover(&[]);
        h.discover(&["B"]);
        assert_eq!(h.state(), &ControllerState::FoundSeveralReaders);
        assert_eq!(h.shown("found_reader"), 0);
        assert_eq!(h.shown("update_several_readers_list"), 3);

        // Failing a connect and going back to searching keeps the list view.
        h.pick("B");
        h.connect_result(Err(ConnectionError::other("timeout").into()));
        let Some(UiState::ConnectingFailed { continue_search, .. }) = h.last_ui().cloned() else {
            panic!("expected generic failure prompt");
        };
        h.tap(&continue_search);
        assert_eq!(h.state(), &ControllerState::FoundSeveralReaders);
        assert_eq!(h.shown("found_reader"), 0);
    }

    #[test]
    fn list_updates_do_not_reenter_the_list_state() {
        let mut h = Harness::searching(None);
        h.discover(&["A", "B"]);
        h.discover(&["A", "B", "C"]);

        assert_eq!(h.shown("found_several_readers"), 1);
        assert_eq!(
            h.last_ui().and_then(UiState::listed_readers).map(<[Reader]>::len),
            Some(3)
        );
    }

    #[test]
    fn picking_a_vanished_reader_is_ignored() {
        let mut h = Harness::searching(None);
        h.discover(&["A", "B"]);
        let Some(UiState::FoundSeveralReaders { connect, .. }) = h.last_ui().cloned() else {
            panic!("list not shown");
        };
        h.discover(&["A"]);

        connect.invoke(&ReaderId::new("B"));
        let intent = h.intents.try_recv().unwrap();
        h.send(Event::User(intent));

        assert_eq!(h.state(), &ControllerState::FoundSeveralReaders);
        assert!(h.connect_requests().is_empty());
    }

    // ── Auto-connect ─────────────────────────────────────────────────

    #[test]
    fn known_reader_connects_without_a_prompt() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);

        assert_eq!(h.state(), &ControllerState::ConnectToReader);
        assert_eq!(h.shown("found_reader"), 0);
        assert_eq!(h.connect_requests(), vec!["R1"]);
        assert_eq!(h.last_ui().map(UiState::name), Some("connecting_to_reader"));
    }

    #[test]
    fn known_reader_is_auto_connected_only_once() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.connect_result(Err(ConnectionError::other("bluetooth dropped").into()));

        let Some(UiState::ConnectingFailed { continue_search, .. }) = h.last_ui().cloned() else {
            panic!("expected generic failure prompt");
        };
        h.tap(&continue_search);
        h.discover(&["R1"]);

        assert_eq!(h.connect_requests(), vec!["R1"]);
        assert_eq!(h.state(), &ControllerState::FoundReader);
    }

    #[test]
    fn known_reader_seen_after_skipping_another_is_auto_connected() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["A"]);
        let (_, keep_searching) = found_reader_actions(h.last_ui());

        // R1 shows up while the prompt for A is on screen.
        h.discover(&["R1"]);
        assert_eq!(h.state(), &ControllerState::FoundReader);

        h.tap(&keep_searching);
        assert_eq!(h.connect_requests(), vec!["R1"]);
    }

    #[test]
    fn retry_allows_a_fresh_auto_connect() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.connect_result(Err(ConnectionError::InvalidPostalCode.into()));
        let Some(UiState::ConnectingFailedInvalidPostalCode { retry_search, .. }) =
            h.last_ui().cloned()
        else {
            panic!("expected postal code prompt");
        };

        h.tap(&retry_search);
        h.send(Event::DiscoveryCancelled {
            then: AfterCancel::Restart,
            result: Ok(()),
        });
        h.discover(&["R1"]);

        assert_eq!(h.connect_requests(), vec!["R1", "R1"]);
    }

    // ── Connect results ──────────────────────────────────────────────

    #[test]
    fn connect_success_remembers_and_completes_immediately() {
        let mut h = Harness::searching(None);
        h.discover(&["A"]);
        let (connect, _) = found_reader_actions(h.last_ui());
        h.tap(&connect);
        h.connect_result(Ok(Reader::new("A", ReaderModel::Chipper2X)));

        assert!(h.session.is_finished());
        assert!(
            h.effects
                .iter()
                .any(|e| matches!(e, Effect::Remember(id) if id.as_str() == "A"))
        );
        match h.completions().as_slice() {
            [Effect::Complete { outcome: Ok(ConnectionResult::Connected(reader)), delay: None }] => {
                assert_eq!(reader.id.as_str(), "A");
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn success_after_completed_update_is_delayed() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.update(SoftwareUpdateEvent::Installing { progress: 1.0 });
        h.update(SoftwareUpdateEvent::Completed);
        h.connect_result(Ok(Reader::new("R1", ReaderModel::WisePad3)));

        match h.completions().as_slice() {
            [Effect::Complete { outcome: Ok(_), delay }] => {
                assert_eq!(*delay, Some(ControllerConfig::DEFAULT_UPDATE_SUCCESS_DELAY));
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn failure_clears_found_readers_and_candidate() {
        let mut h = Harness::searching(None);
        h.discover(&["A"]);
        let (connect, _) = found_reader_actions(h.last_ui());
        h.tap(&connect);
        h.connect_result(Err(ConnectionError::other("nope").into()));

        assert!(h.session.found_readers.is_empty());
        assert!(h.session.candidate_reader.is_none());
    }

    #[test]
    fn stale_connect_result_is_ignored() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.send(Event::ConnectFinished {
            attempt: 99,
            result: Ok(Reader::new("R1", ReaderModel::Chipper2X)),
        });

        assert!(!h.session.is_finished());
        assert_eq!(h.state(), &ControllerState::ConnectToReader);
    }

    // ── Error classification ─────────────────────────────────────────

    fn fail_known_connect(error: ReaderError) -> Harness {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.connect_result(Err(error));
        h
    }

    #[test]
    fn interrupted_update_returns_to_searching() {
        let h = fail_known_connect(ReaderError::software_update(
            SoftwareUpdateError::InterruptedByUser,
        ));
        assert_eq!(h.state(), &ControllerState::Searching);
        assert_eq!(h.last_ui().map(UiState::name), Some("scanning_for_reader"));
    }

    #[test]
    fn low_battery_update_failure_reports_level() {
        let h = fail_known_connect(ReaderError::SoftwareUpdate {
            error: SoftwareUpdateError::BatteryTooLow,
            battery_level: Some(0.12),
        });
        match h.last_ui() {
            Some(UiState::UpdatingFailedLowBattery { battery_level, .. }) => {
                assert_eq!(*battery_level, Some(0.12));
            }
            other => panic!("unexpected ui: {other:?}"),
        }
    }

    #[test]
    fn error_kinds_map_to_their_prompts() {
        let cases: Vec<(ReaderError, &str)> = vec![
            (
                ReaderError::software_update(SoftwareUpdateError::Other {
                    message: "checksum".into(),
                }),
                "updating_failed",
            ),
            (
                ConnectionError::IncompleteStoreAddress { admin_url: None }.into(),
                "connecting_failed_incomplete_address",
            ),
            (
                ConnectionError::InvalidPostalCode.into(),
                "connecting_failed_invalid_postal_code",
            ),
            (
                ConnectionError::CriticallyLowBatteryBluetooth.into(),
                "connecting_failed_critically_low_battery",
            ),
            (ConnectionError::other("boom").into(), "connecting_failed"),
        ];

        for (error, expected) in cases {
            let h = fail_known_connect(error.clone());
            assert_eq!(h.last_ui().map(UiState::name), Some(expected), "for {error:?}");
        }
    }

    #[test]
    fn incomplete_address_refresh_drops_the_admin_url() {
        let admin_url = Url::parse("https://shop.example/wp-admin/settings").unwrap();
        let mut h = fail_known_connect(
            ConnectionError::IncompleteStoreAddress {
                admin_url: Some(admin_url.clone()),
            }
            .into(),
        );
        let Some(UiState::ConnectingFailedIncompleteAddress { admin_url: shown, refresh, .. }) =
            h.last_ui().cloned()
        else {
            panic!("expected incomplete address prompt");
        };
        assert_eq!(shown, Some(admin_url));

        h.tap(&refresh);
        match h.last_ui() {
            Some(UiState::ConnectingFailedIncompleteAddress { admin_url, .. }) => {
                assert!(admin_url.is_none());
            }
            other => panic!("unexpected ui: {other:?}"),
        }
    }

    #[test]
    fn incomplete_address_retry_restarts_discovery() {
        let mut h = fail_known_connect(
            ConnectionError::IncompleteStoreAddress { admin_url: None }.into(),
        );
        let Some(UiState::ConnectingFailedIncompleteAddress { retry_search, .. }) =
            h.last_ui().cloned()
        else {
            panic!("expected incomplete address prompt");
        };

        h.tap(&retry_search);
        assert_eq!(h.state(), &ControllerState::Retry);
        assert_eq!(h.last_ui().map(UiState::name), Some("dismissed"));
        assert!(matches!(
            h.effects.last(),
            Some(Effect::CancelDiscovery { then: AfterCancel::Restart })
        ));
        assert_eq!(h.discovery_starts(), 1);

        h.send(Event::DiscoveryCancelled {
            then: AfterCancel::Restart,
            result: Ok(()),
        });
        assert_eq!(h.discovery_starts(), 2);
        assert_eq!(h.state(), &ControllerState::Searching);
        assert!(h.session.found_readers.is_empty());
    }

    // ── Updates ──────────────────────────────────────────────────────

    struct NoopCancel;

    #[async_trait::async_trait]
    impl crate::service::CancelUpdate for NoopCancel {
        async fn cancel(&self) -> Result<(), ReaderError> {
            Ok(())
        }
    }

    #[test]
    fn update_cancel_is_offered_until_nearly_done() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.update(SoftwareUpdateEvent::Started {
            cancel: UpdateCancelHandle::new(NoopCancel),
        });
        assert!(matches!(
            h.last_ui(),
            Some(UiState::UpdateInProgress { progress, cancel: Some(_), .. }) if progress.abs() < f32::EPSILON
        ));

        h.update(SoftwareUpdateEvent::Installing { progress: 0.5 });
        assert!(matches!(h.last_ui(), Some(UiState::UpdateInProgress { cancel: Some(_), .. })));

        h.update(SoftwareUpdateEvent::Installing { progress: 0.996 });
        assert!(matches!(h.last_ui(), Some(UiState::UpdateInProgress { cancel: None, .. })));
    }

    #[test]
    fn cancelling_an_update_does_not_end_the_session() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.update(SoftwareUpdateEvent::Started {
            cancel: UpdateCancelHandle::new(NoopCancel),
        });
        let Some(UiState::UpdateInProgress { cancel: Some(cancel), .. }) = h.last_ui().cloned()
        else {
            panic!("expected cancellable update");
        };

        h.tap(&cancel);
        assert!(h.effects.iter().any(|e| matches!(e, Effect::CancelUpdate(_))));
        assert!(!h.session.is_finished());
        assert!(matches!(h.last_ui(), Some(UiState::UpdateInProgress { cancel: None, .. })));

        h.connect_result(Err(ReaderError::software_update(
            SoftwareUpdateError::InterruptedByUser,
        )));
        assert_eq!(h.state(), &ControllerState::Searching);
    }

    // ── Termination ──────────────────────────────────────────────────

    #[test]
    fn cancel_waits_for_discovery_acknowledgement() {
        let mut h = Harness::searching(None);
        let Some(UiState::ScanningForReader { cancel }) = h.last_ui().cloned() else {
            panic!("expected scanning prompt");
        };
        h.tap(&cancel);

        assert!(h.completions().is_empty());
        h.send(Event::DiscoveryCancelled {
            then: AfterCancel::Finish(CancellationSource::SearchingForReader),
            result: Err(ReaderError::discovery("already stopped")),
        });

        match h.completions().as_slice() {
            [Effect::Complete { outcome: Ok(ConnectionResult::Canceled(source)), .. }] => {
                assert_eq!(*source, CancellationSource::SearchingForReader);
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn cancel_from_an_earlier_prompt_does_not_abort_a_connect() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        assert_eq!(h.state(), &ControllerState::ConnectToReader);

        h.send(Event::User(Intent::Cancel(CancellationSource::SearchingForReader)));
        assert_eq!(h.state(), &ControllerState::ConnectToReader);
        h.connect_result(Ok(Reader::new("R1", ReaderModel::Chipper2X)));

        match h.completions().as_slice() {
            [Effect::Complete { outcome: Ok(ConnectionResult::Connected(reader)), .. }] => {
                assert_eq!(reader.id, ReaderId::new("R1"));
            }
            other => panic!("unexpected completion: {other:?}"),
        }
        assert!(h.effects.iter().any(|e| matches!(e, Effect::Remember(id) if id.as_str() == "R1")));
    }

    #[test]
    fn session_cancel_is_ignored_while_updating() {
        let mut h = Harness::searching(Some("R1"));
        h.discover(&["R1"]);
        h.update(SoftwareUpdateEvent::Installing { progress: 0.3 });
        assert!(matches!(h.state(), ControllerState::Updating { .. }));

        h.send(Event::User(Intent::Cancel(CancellationSource::FoundReader)));
        assert!(matches!(h.state(), ControllerState::Updating { .. }));
        assert!(!h.effects.iter().any(|e| matches!(e, Effect::CancelDiscovery { .. })));
    }

    #[test]
    fn discovery_failure_is_terminal_after_close() {
        let mut h = Harness::searching(None);
        h.send(Event::DiscoveryFailed {
            generation: 1,
            error: ReaderError::discovery("bluetooth off"),
        });
        let Some(UiState::ScanningFailed { close, .. }) = h.last_ui().cloned() else {
            panic!("expected scanning failed prompt");
        };
        assert!(h.completions().is_empty());

        h.tap(&close);
        match h.completions().as_slice() {
            [Effect::Complete { outcome: Err(CoreError::DiscoveryFailed(error)), .. }] => {
                assert_eq!(error, &ReaderError::discovery("bluetooth off"));
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn invalid_actions_are_ignored() {
        let mut h = Harness::searching(None);
        h.send(Event::User(Intent::ConnectCandidate));
        h.send(Event::User(Intent::Retry));
        h.send(Event::User(Intent::CloseScanFailure));

        assert_eq!(h.state(), &ControllerState::Searching);
        assert!(h.connect_requests().is_empty());
        assert!(h.completions().is_empty());
    }

    #[test]
    fn shutdown_cancels_discovery_then_completes() {
        let mut h = Harness::searching(None);
        h.send(Event::Shutdown);
        assert!(matches!(
            h.effects.last(),
            Some(Effect::CancelDiscovery { then: AfterCancel::Shutdown })
        ));

        h.send(Event::DiscoveryCancelled {
            then: AfterCancel::Shutdown,
            result: Ok(()),
        });
        assert!(matches!(
            h.completions().as_slice(),
            [Effect::Complete { outcome: Err(CoreError::Shutdown), .. }]
        ));
    }
}
