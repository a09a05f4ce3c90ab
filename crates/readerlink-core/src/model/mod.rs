// ── Domain model ──
//
// Readers as reported by the SDK, and the values a session hands back
// to its caller.

pub mod outcome;
pub mod reader;

// ── Re-exports ──────────────────────────────────────────────────────

pub use outcome::{CancellationSource, ConnectionResult};
pub use reader::{Reader, ReaderId, ReaderModel};
