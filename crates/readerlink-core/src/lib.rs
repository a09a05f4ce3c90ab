//! Connection workflow for Bluetooth card readers.
//!
//! Turns the asynchronous, repeatable events of a card reader SDK into one
//! ordered sequence of UI states and exactly one result per search:
//!
//! - **[`ConnectionController`]**: the entry point.
//!   [`search_and_connect()`](ConnectionController::search_and_connect)
//!   scans for readers, asks the merchant to pick one where needed, connects
//!   (auto-connecting once to the remembered reader), follows any mandatory
//!   software update, and reports a [`ConnectionResult`] or a [`CoreError`].
//!
//! - **[`UiState`]**: what the presentation layer should show right now,
//!   with [`UiAction`] handles for the merchant's choices. Observed through
//!   [`ConnectionController::ui_state()`].
//!
//! - **Collaborators** ([`service`]): the reader SDK
//!   ([`CardReaderService`]), the remembered-reader store
//!   ([`KnownReaderProvider`]) and the payment gateway
//!   ([`GatewayAccountProvider`]), supplied at construction.
//!
//! - **Simulator** ([`sim`]): in-memory collaborators for demos and tests.

pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod service;
pub mod sim;
pub mod ui;

mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ControllerConfig, DiscoveryMethod, DiscoveryParams};
pub use controller::{ConnectionController, SearchResult};
pub use error::{ConnectionError, CoreError, ReaderError, SoftwareUpdateError};
pub use model::{CancellationSource, ConnectionResult, Reader, ReaderId, ReaderModel};
pub use service::{
    CancelUpdate, CardReaderService, DiscoveryEvent, DiscoveryStream, GatewayAccountProvider,
    KnownReaderProvider, KnownReaderState, SoftwareUpdateEvent, SoftwareUpdateStream,
    UpdateCancelHandle,
};
pub use ui::{ConnectAction, UiAction, UiState};
