//! `readerlink simulate`: one search against the in-memory reader SDK.
//!
//! Renders every UI state the controller publishes and answers its
//! prompts, either interactively or with a fixed policy (`--auto`).

use std::future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dialoguer::Select;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::time;
use tracing::debug;

use readerlink_core::sim::{
    ConnectPlan, MemoryKnownReaders, SimHandle, SimulatedReaderService, StaticGateway,
};
use readerlink_core::{
    ConnectAction, ConnectionController, ConnectionError, ConnectionResult, CoreError, Reader,
    ReaderError, ReaderId, ReaderModel, SearchResult, SoftwareUpdateError, UiAction, UiState,
};

use crate::cli::{FailKind, GlobalOpts, ReaderArg, SimulateArgs};
use crate::error::CliError;
use crate::output::{self, Theme};

const SIM_GATEWAY_ID: &str = "sim-gateway";
const UPDATE_STEPS: [f32; 5] = [0.2, 0.4, 0.6, 0.8, 1.0];
const STORE_ADMIN_URL: &str = "https://store.example.com/admin/settings/general";

pub async fn handle(args: &SimulateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = super::load_config(global)?;
    let config = super::resolve_controller_config(global, &cfg, args.site)?;
    let theme = Theme::new(global.color);
    debug!(site_id = config.site_id, method = %config.discovery_method, "starting simulated search");

    let (service, sim) = SimulatedReaderService::new();
    stage(&sim, args);

    let known = MemoryKnownReaders::loaded(args.known.as_deref().map(ReaderId::new));
    let controller = ConnectionController::new(
        config,
        Arc::new(service),
        Arc::new(known),
        Arc::new(StaticGateway::new(SIM_GATEWAY_ID)),
    );

    let started = Instant::now();
    let outcome = drive(&controller, args, theme).await?;
    let rendered = output::render_result(&outcome, started.elapsed(), args.json, theme)?;
    output::print_output(&rendered);
    Ok(())
}

// ── Simulated world ──────────────────────────────────────────────────

fn stage(sim: &SimHandle, args: &SimulateArgs) {
    sim.set_visible(args.readers.iter().map(to_reader).collect());

    if let Some(message) = &args.fail_discovery {
        sim.fail_discovery(ReaderError::discovery(message.clone()));
    }
    if let Some(kind) = args.fail_connect {
        sim.push_plan(ConnectPlan::Fail(connect_failure(kind)));
    }
    if args.update {
        sim.push_plan(ConnectPlan::UpdateThenSucceed {
            steps: UPDATE_STEPS.to_vec(),
        });
    }

    if !args.later.is_empty() {
        let everyone: Vec<Reader> = args.readers.iter().chain(&args.later).map(to_reader).collect();
        let delay: Duration = args.later_after.into();
        let sim = sim.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            debug!(count = everyone.len(), "more readers came into range");
            sim.set_visible(everyone);
        });
    }
}

fn to_reader(arg: &ReaderArg) -> Reader {
    let reader = Reader::new(arg.id.as_str(), ReaderModel::Chipper2X);
    match &arg.name {
        Some(name) => reader.with_name(name.clone()),
        None => reader,
    }
}

fn connect_failure(kind: FailKind) -> ReaderError {
    match kind {
        FailKind::Generic => ConnectionError::other("the reader did not respond").into(),
        FailKind::IncompleteAddress => ConnectionError::IncompleteStoreAddress {
            admin_url: url::Url::parse(STORE_ADMIN_URL).ok(),
        }
        .into(),
        FailKind::PostalCode => ConnectionError::InvalidPostalCode.into(),
        FailKind::LowBattery => ConnectionError::CriticallyLowBatteryBluetooth.into(),
        FailKind::UpdateBattery => ReaderError::SoftwareUpdate {
            error: SoftwareUpdateError::BatteryTooLow,
            battery_level: Some(0.12),
        },
        FailKind::Update => ReaderError::software_update(SoftwareUpdateError::Other {
            message: "the reader rejected the firmware".into(),
        }),
    }
}

// ── Driving the search ───────────────────────────────────────────────

async fn drive(
    controller: &ConnectionController,
    args: &SimulateArgs,
    theme: Theme,
) -> Result<ConnectionResult, CliError> {
    let mut ui = controller.ui_state();
    let mut view = View::new(theme, args.auto);

    let limit: Option<Duration> = args.timeout.map(Into::into);
    let timeout = async {
        match limit {
            Some(limit) => time::sleep(limit).await,
            None => future::pending().await,
        }
    };
    let search = controller.connect();
    tokio::pin!(search, timeout);

    let mut timed_out = false;
    let mut interrupts = 0_u32;

    loop {
        tokio::select! {
            result = &mut search => {
                view.finish();
                return conclude(result, limit.filter(|_| timed_out));
            }
            changed = ui.changed() => {
                if changed.is_err() {
                    let result = (&mut search).await;
                    view.finish();
                    return conclude(result, None);
                }
                let state = ui.borrow_and_update().clone();
                view.show(&state).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                interrupt(controller, &ui, interrupts);
            }
            () = &mut timeout, if !timed_out => {
                debug!("search timed out; shutting down");
                timed_out = true;
                controller.shutdown();
            }
        }
    }
}

/// First Ctrl-C takes the on-screen way out; a second one shuts down.
fn interrupt(controller: &ConnectionController, ui: &watch::Receiver<UiState>, count: u32) {
    let state = ui.borrow().clone();
    match cancel_action(&state) {
        Some(action) if count == 1 => {
            debug!(state = state.name(), "interrupt: cancelling from the current prompt");
            action.invoke();
        }
        _ => controller.shutdown(),
    }
}

fn conclude(
    result: SearchResult,
    timed_out_after: Option<Duration>,
) -> Result<ConnectionResult, CliError> {
    match (result, timed_out_after) {
        (Err(CoreError::Shutdown), Some(after)) => Err(CliError::Timeout {
            after: humantime::format_duration(after).to_string(),
        }),
        (result, _) => Ok(result?),
    }
}

/// The action that backs out of `state`, if it offers one.
fn cancel_action(state: &UiState) -> Option<&UiAction> {
    match state {
        UiState::ScanningForReader { cancel } => Some(cancel),
        UiState::ConnectingFailed { cancel_search, .. }
        | UiState::ConnectingFailedIncompleteAddress { cancel_search, .. }
        | UiState::ConnectingFailedInvalidPostalCode { cancel_search, .. }
        | UiState::ConnectingFailedCriticallyLowBattery { cancel_search, .. }
        | UiState::FoundReader { cancel_search, .. }
        | UiState::FoundSeveralReaders { cancel_search, .. }
        | UiState::UpdateSeveralReadersList { cancel_search, .. } => Some(cancel_search),
        UiState::UpdateInProgress { cancel, .. } => cancel.as_ref(),
        UiState::UpdatingFailed { close }
        | UiState::UpdatingFailedLowBattery { close, .. }
        | UiState::ScanningFailed { close, .. } => Some(close),
        UiState::Idle | UiState::ConnectingToReader | UiState::Dismissed => None,
    }
}

// ── Rendering and answering prompts ──────────────────────────────────

struct View {
    theme: Theme,
    auto: bool,
    progress: Option<ProgressBar>,
}

impl View {
    fn new(theme: Theme, auto: bool) -> Self {
        Self {
            theme,
            auto,
            progress: None,
        }
    }

    async fn show(&mut self, state: &UiState) -> Result<(), CliError> {
        debug!(state = state.name(), "ui state");
        if !matches!(state, UiState::UpdateInProgress { .. }) {
            self.finish();
        }
        let t = self.theme;

        match state {
            UiState::Idle | UiState::Dismissed => {}
            UiState::ScanningForReader { .. } => {
                output::status(&format!("{} Scanning for card readers", t.accent("›")));
            }
            UiState::ConnectingToReader => {
                output::status(&format!("{} Connecting to reader", t.accent("›")));
            }
            UiState::FoundReader {
                name,
                connect,
                continue_search,
                cancel_search,
                ..
            } => {
                output::status(&format!("{} Found reader {}", t.accent("›"), t.accent(name)));
                let pick = self
                    .choose(
                        format!("Connect to {name}?"),
                        vec!["Connect".into(), "Keep searching".into(), "Cancel".into()],
                    )
                    .await?;
                [connect, continue_search, cancel_search]
                    .get(pick)
                    .copied()
                    .unwrap_or(cancel_search)
                    .invoke();
            }
            UiState::FoundSeveralReaders {
                readers,
                connect,
                cancel_search,
            }
            | UiState::UpdateSeveralReadersList {
                readers,
                connect,
                cancel_search,
            } => self.pick_reader(readers, connect, cancel_search).await?,
            UiState::UpdateInProgress {
                required_update,
                progress,
                cancel,
            } => self.show_progress(*required_update, *progress, cancel.is_some()),
            failure => self.show_failure(failure).await?,
        }
        Ok(())
    }

    async fn pick_reader(
        &self,
        readers: &[Reader],
        connect: &ConnectAction,
        cancel_search: &UiAction,
    ) -> Result<(), CliError> {
        let t = self.theme;
        output::status(&format!("{} Found {} readers", t.accent("›"), readers.len()));
        for reader in readers {
            output::status(&format!("    {}", t.reader(reader)));
        }

        let mut items: Vec<String> = readers.iter().map(|r| r.display_name().to_owned()).collect();
        items.push("Cancel".into());
        let pick = self.choose("Connect to which reader?".into(), items).await?;
        match readers.get(pick) {
            Some(reader) => connect.invoke(&reader.id),
            None => cancel_search.invoke(),
        }
        Ok(())
    }

    fn show_progress(&mut self, required: bool, progress: f32, cancellable: bool) {
        let bar = self.progress.get_or_insert_with(|| {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template("  {msg} [{bar:30.cyan/blue}] {pos:>3}%")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar
        });
        let label = if required {
            "Installing required update"
        } else {
            "Installing update"
        };
        if cancellable {
            bar.set_message(label);
        } else {
            bar.set_message(format!("{label} (finishing)"));
        }
        bar.set_position(percent(progress));
    }

    async fn show_failure(&self, state: &UiState) -> Result<(), CliError> {
        let t = self.theme;
        let mark = t.bad("✗");
        match state {
            UiState::ConnectingFailed {
                error,
                continue_search,
                cancel_search,
            } => {
                output::status(&format!("{mark} {error}"));
                let pick = self
                    .choose("Try again?".into(), vec!["Keep searching".into(), "Cancel".into()])
                    .await?;
                let action = if pick == 0 { continue_search } else { cancel_search };
                action.invoke();
            }
            UiState::ConnectingFailedIncompleteAddress {
                admin_url,
                refresh,
                retry_search,
                cancel_search,
            } => {
                output::status(&format!("{mark} The store address is incomplete"));
                let mut options: Vec<(&str, &UiAction)> = Vec::new();
                if let Some(url) = admin_url {
                    output::status(&format!("  Complete it at {}", t.accent(url.as_str())));
                    options.push(("I've updated the address", refresh));
                }
                options.push(("Retry", retry_search));
                options.push(("Cancel", cancel_search));
                let labels = options.iter().map(|(label, _)| (*label).to_owned()).collect();
                let pick = self.choose("Store address".into(), labels).await?;
                options
                    .get(pick)
                    .map_or(cancel_search, |(_, action)| *action)
                    .invoke();
            }
            UiState::ConnectingFailedInvalidPostalCode {
                retry_search,
                cancel_search,
            } => {
                output::status(&format!("{mark} The store postal code is invalid"));
                self.retry_or_cancel(retry_search, cancel_search).await?;
            }
            UiState::ConnectingFailedCriticallyLowBattery {
                retry_search,
                cancel_search,
            } => {
                output::status(&format!(
                    "{mark} The reader battery is critically low. Charge it and try again"
                ));
                self.retry_or_cancel(retry_search, cancel_search).await?;
            }
            UiState::UpdatingFailed { close } => {
                output::status(&format!("{mark} The reader software update failed"));
                self.acknowledge(close).await?;
            }
            UiState::UpdatingFailedLowBattery {
                battery_level,
                close,
            } => {
                let level = battery_level
                    .map(|level| format!(" ({}%)", percent(level)))
                    .unwrap_or_default();
                output::status(&format!(
                    "{mark} The reader battery is too low to update{level}"
                ));
                self.acknowledge(close).await?;
            }
            UiState::ScanningFailed { error, close } => {
                output::status(&format!("{mark} {error}"));
                self.acknowledge(close).await?;
            }
            other => debug!(state = other.name(), "nothing to render"),
        }
        Ok(())
    }

    async fn retry_or_cancel(&self, retry: &UiAction, cancel: &UiAction) -> Result<(), CliError> {
        let pick = self
            .choose("Try again?".into(), vec!["Retry".into(), "Cancel".into()])
            .await?;
        let action = if pick == 0 { retry } else { cancel };
        action.invoke();
        Ok(())
    }

    async fn acknowledge(&self, close: &UiAction) -> Result<(), CliError> {
        self.choose(String::new(), vec!["Close".into()]).await?;
        close.invoke();
        Ok(())
    }

    /// Index of the chosen item. `--auto` always takes the first.
    async fn choose(&self, prompt: String, items: Vec<String>) -> Result<usize, CliError> {
        if self.auto {
            debug!(choice = items.first().map(String::as_str), "auto-selected");
            return Ok(0);
        }
        tokio::task::spawn_blocking(move || {
            let mut select = Select::new().items(&items).default(0);
            if !prompt.is_empty() {
                select = select.with_prompt(prompt);
            }
            select.interact()
        })
        .await
        .map_err(|err| CliError::Prompt(err.to_string()))?
        .map_err(CliError::from)
    }

    fn finish(&mut self) {
        if let Some(bar) = self.progress.take() {
            bar.finish_and_clear();
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
fn percent(fraction: f32) -> u64 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped_and_rounded() {
        assert_eq!(percent(0.995), 100);
        assert_eq!(percent(0.124), 12);
        assert_eq!(percent(-1.0), 0);
        assert_eq!(percent(3.0), 100);
    }

    #[test]
    fn failures_map_to_their_reader_errors() {
        assert!(matches!(
            connect_failure(FailKind::IncompleteAddress),
            ReaderError::Connection(ConnectionError::IncompleteStoreAddress { admin_url: Some(_) })
        ));
        assert!(connect_failure(FailKind::Update).to_string().contains("firmware"));
        assert!(!connect_failure(FailKind::Update).is_update_interrupted());
    }

    #[test]
    fn timeout_turns_shutdown_into_a_timeout_error() {
        let err = conclude(Err(CoreError::Shutdown), Some(Duration::from_secs(2))).unwrap_err();
        assert!(matches!(err, CliError::Timeout { ref after } if after == "2s"));

        let err = conclude(Err(CoreError::Shutdown), None).unwrap_err();
        assert!(matches!(err, CliError::Interrupted));
    }
}
