//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod execution;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use stepwise_observe::tracing_setup::LogFormat;

/// Run JSON step-function workflows locally.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for run/state events, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format on stderr.
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormatArg,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Directory holding `config.toml` (defaults to ~/.stepwise).
    #[arg(long, env = "STEPWISE_DIR", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Run timeout in seconds for definitions without `TimeoutSeconds`.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow definition and print its output.
    StartExecution {
        /// Path to the workflow definition (JSON).
        #[arg(long)]
        asl: PathBuf,

        /// Path to the input document. Read from stdin when piped, `{}` otherwise.
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Load and validate a workflow definition without running it.
    Validate {
        /// Path to the workflow definition (JSON).
        #[arg(long)]
        asl: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Default log filter for the verbosity flags; `RUST_LOG` overrides it.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,stepwise_core=debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_execution_args() {
        let cli = Cli::try_parse_from([
            "stepwise",
            "start-execution",
            "--asl",
            "workflow.json",
            "--input",
            "input.json",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.log_filter(), "info,stepwise_core=debug");
        match cli.command {
            Commands::StartExecution { asl, input } => {
                assert_eq!(asl, PathBuf::from("workflow.json"));
                assert_eq!(input, Some(PathBuf::from("input.json")));
            }
            _ => panic!("expected start-execution"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stepwise",
            "validate",
            "--asl",
            "w.json",
            "--quiet",
            "--log-format",
            "json",
            "--timeout",
            "30",
        ])
        .unwrap();
        assert!(cli.quiet);
        assert_eq!(cli.log_filter(), "error");
        assert!(matches!(cli.log_format, LogFormatArg::Json));
        assert_eq!(cli.timeout, Some(30));
    }

    #[test]
    fn test_asl_is_required() {
        assert!(Cli::try_parse_from(["stepwise", "start-execution"]).is_err());
    }
}
