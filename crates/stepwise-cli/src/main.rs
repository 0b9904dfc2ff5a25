//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, sets up tracing, loads the engine configuration,
//! then dispatches to the command handler.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use stepwise_infra::config::{default_data_dir, load_engine_config};
use stepwise_observe::tracing_setup::{init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(cli.log_format.into(), cli.log_filter(), cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let data_dir = cli.config_dir.clone().unwrap_or_else(default_data_dir);
    let mut config = load_engine_config(&data_dir).await;
    if let Some(timeout) = cli.timeout {
        config.default_timeout_secs = timeout;
    }

    let result = match &cli.command {
        Commands::StartExecution { asl, input } => {
            cli::execution::start_execution(config, asl, input.as_deref(), cli.json).await
        }
        Commands::Validate { asl } => cli::execution::validate(asl, cli.json)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    result
}
