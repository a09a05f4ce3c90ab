//! Terminal output: color decisions, state lines and the final result.
//!
//! Progress and prompts go to stderr; stdout only carries the result so
//! `--json` output stays machine-readable.

use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use owo_colors::OwoColorize;
use serde::Serialize;

use readerlink_core::{ConnectionResult, Reader};

use crate::cli::ColorMode;
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stderr().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Theme {
    color: bool,
}

impl Theme {
    pub fn new(mode: ColorMode) -> Self {
        Self {
            color: should_color(mode),
        }
    }

    pub fn accent(self, text: &str) -> String {
        if self.color {
            text.cyan().bold().to_string()
        } else {
            text.to_owned()
        }
    }

    pub fn good(self, text: &str) -> String {
        if self.color {
            text.green().bold().to_string()
        } else {
            text.to_owned()
        }
    }

    pub fn bad(self, text: &str) -> String {
        if self.color {
            text.red().bold().to_string()
        } else {
            text.to_owned()
        }
    }

    pub fn dim(self, text: &str) -> String {
        if self.color {
            text.dimmed().to_string()
        } else {
            text.to_owned()
        }
    }

    /// `Name (ID)` for named readers, the bare ID otherwise.
    pub fn reader(self, reader: &Reader) -> String {
        match reader.name.as_deref() {
            Some(_) => format!(
                "{} {}",
                self.accent(reader.display_name()),
                self.dim(&format!("({})", reader.id))
            ),
            None => self.accent(reader.id.as_str()),
        }
    }
}

// ── Status lines (stderr) ────────────────────────────────────────────

pub fn status(line: &str) {
    let _ = writeln!(io::stderr().lock(), "{line}");
}

// ── Result (stdout) ──────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    result: &'a ConnectionResult,
    elapsed_ms: u64,
}

pub fn render_result(
    result: &ConnectionResult,
    elapsed: Duration,
    json: bool,
    theme: Theme,
) -> Result<String, CliError> {
    if json {
        let report = JsonReport {
            result,
            elapsed_ms: millis(elapsed),
        };
        return Ok(serde_json::to_string_pretty(&report)?);
    }

    let took = humantime::format_duration(round_to_millis(elapsed));
    Ok(match result {
        ConnectionResult::Connected(reader) => format!(
            "{} {} {}",
            theme.good("Connected to"),
            theme.reader(reader),
            theme.dim(&format!("in {took}"))
        ),
        ConnectionResult::Canceled(source) => format!(
            "{} {}",
            theme.bad("Canceled"),
            theme.dim(&format!("from {source} after {took}"))
        ),
    })
}

pub fn print_output(output: &str) {
    if output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn round_to_millis(elapsed: Duration) -> Duration {
    Duration::from_millis(millis(elapsed))
}
