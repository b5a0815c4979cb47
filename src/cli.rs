//! Command-line interface for isomer.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Local Bitcoin regtest stack orchestrator.
#[derive(Parser, Debug)]
#[command(name = "isomer", version)]
#[command(about = "Runs a local Bitcoin regtest stack and its indexers", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Data root (defaults to `~/.local/share/isomer`).
    #[arg(long, value_name = "DIR", global = true)]
    pub root: Option<PathBuf>,

    /// Settings file (defaults to `<root>/isomer.yaml`, created on first use).
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Service manifest replacing the built-in stack.
    #[arg(long, value_name = "FILE", global = true)]
    pub manifest: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Start every service and serve the control socket until Ctrl-C or `down`.
    Up,

    /// Stop a running `isomer up`.
    Down,

    /// Show service states, health and chain height.
    Status {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show recent service output.
    Logs {
        /// Only show lines of this service.
        #[arg(short, long)]
        service: Option<String>,

        /// Number of lines to show (default: 500).
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Drop the in-memory log buffer of a running engine.
    ClearLogs,

    /// Stop everything and wipe chain data. Binaries and settings are kept.
    Reset {
        /// Confirm the wipe.
        #[arg(long)]
        yes: bool,
    },

    /// Mine blocks on the regtest chain.
    Mine {
        /// Number of blocks to mine.
        count: u32,

        /// Coinbase address (defaults to a fresh dev wallet address).
        #[arg(long)]
        address: Option<String>,
    },

    /// Send BTC from the dev wallet.
    Faucet {
        address: String,

        /// Amount in BTC (default: 1).
        #[arg(long, default_value_t = 0.0)]
        amount: f64,
    },

    /// Probe one service now.
    Health { service: String },

    /// Inspect or install service binaries.
    Binaries {
        #[command(subcommand)]
        action: BinariesCommand,
    },

    /// Show or replace the settings file.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigCommand {
    /// Print the settings in effect.
    Show {
        /// Emit JSON instead of YAML.
        #[arg(long)]
        json: bool,
    },
    /// Validate a settings file and make it the active one.
    /// Refused while any service is running.
    Apply {
        /// YAML settings file; `${VAR}` references are expanded.
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum BinariesCommand {
    /// Report install status of every service.
    Check {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Download missing or outdated binaries. Services that are running
    /// keep their current install.
    Download {
        /// Only download this service.
        service: Option<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
