//! Clap derive structures for the `readerlink` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// readerlink -- drive the card reader connection workflow
#[derive(Debug, Parser)]
#[command(
    name = "readerlink",
    version,
    about = "Search for and connect Bluetooth card readers",
    long_about = "Runs the card reader connection workflow: discovery, reader selection,\n\
        connect, and mandatory software updates.\n\n\
        The `simulate` command drives a full search against an in-memory reader SDK.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Store profile to use
    #[arg(long, short = 'p', env = "READERLINK_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Config file to read instead of the default location
    #[arg(long, env = "READERLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one search against a simulated reader SDK
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Inspect the configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SIMULATE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Reader in range when the search starts, as ID or ID:NAME (repeatable)
    #[arg(long = "reader", short = 'r', value_name = "ID[:NAME]", value_parser = parse_reader_arg)]
    pub readers: Vec<ReaderArg>,

    /// Reader that comes into range after `--later-after` (repeatable)
    #[arg(long = "later", value_name = "ID[:NAME]", value_parser = parse_reader_arg)]
    pub later: Vec<ReaderArg>,

    /// Delay before the `--later` readers appear
    #[arg(long, value_name = "DURATION", default_value = "1500ms")]
    pub later_after: humantime::Duration,

    /// Reader remembered from an earlier session
    #[arg(long, value_name = "ID")]
    pub known: Option<String>,

    /// Make the first connect attempt fail
    #[arg(long, value_name = "KIND")]
    pub fail_connect: Option<FailKind>,

    /// Make discovery fail with this message
    #[arg(long, value_name = "MESSAGE")]
    pub fail_discovery: Option<String>,

    /// Require a software update before the connect completes
    #[arg(long)]
    pub update: bool,

    /// Answer every prompt with a fixed policy instead of asking
    #[arg(long)]
    pub auto: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Store to search for (overrides the profile)
    #[arg(long, value_name = "ID")]
    pub site: Option<i64>,

    /// Give up after this long
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<humantime::Duration>,
}

/// A simulated reader given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderArg {
    pub id: String,
    pub name: Option<String>,
}

fn parse_reader_arg(raw: &str) -> Result<ReaderArg, String> {
    let (id, name) = match raw.split_once(':') {
        Some((id, name)) => (id.trim(), Some(name.trim())),
        None => (raw.trim(), None),
    };
    if id.is_empty() {
        return Err("reader ID cannot be empty".into());
    }
    Ok(ReaderArg {
        id: id.to_owned(),
        name: name.filter(|n| !n.is_empty()).map(str::to_owned),
    })
}

/// Ways the first simulated connect can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FailKind {
    /// Connect fails for an unspecific reason
    Generic,
    /// The store address is incomplete
    IncompleteAddress,
    /// The store postal code is invalid
    PostalCode,
    /// The reader battery is critically low
    LowBattery,
    /// The mandatory update fails on a low battery
    UpdateBattery,
    /// The mandatory update fails
    Update,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONFIG
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved configuration
    Show,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  COMPLETIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
