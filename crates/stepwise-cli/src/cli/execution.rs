//! Workflow execution subcommands: `start-execution` and `validate`.

use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use stepwise_core::workflow::definition::load_workflow_file;
use stepwise_core::workflow::executor::{ExecutionError, Executor};
use stepwise_infra::workflow::process_invoker::ProcessInvoker;
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::{StateKind, StateMachine};

/// Exit status for runs stopped by Ctrl-C or the run timeout.
const EXIT_CANCELLED: u8 = 130;

/// Run a workflow definition and print its output to stdout.
pub async fn start_execution(
    config: EngineConfig,
    asl: &Path,
    input: Option<&Path>,
    json: bool,
) -> Result<ExitCode> {
    let workflow = load_workflow_file(asl)
        .with_context(|| format!("Failed to load workflow {}", asl.display()))?;
    let input = read_input(input).await?;

    let executor = Executor::new(ProcessInvoker::new(&config), config);
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the run; the executor stops branches and scripts.
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling execution");
            interrupt.cancel();
        }
    });

    match executor.execute(cancel, Arc::new(workflow), &input).await {
        Ok(output) => {
            let output = String::from_utf8(output).context("Workflow output is not valid UTF-8")?;
            println!("{output}");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            report_failure(&err, json)?;
            if err.is_cancellation() {
                Ok(ExitCode::from(EXIT_CANCELLED))
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// Load and validate a definition, reporting its shape.
pub async fn validate(asl: &Path, json: bool) -> Result<()> {
    let workflow = load_workflow_file(asl)
        .with_context(|| format!("Invalid workflow {}", asl.display()))?;
    let total = count_states(&workflow);

    if json {
        let summary = json!({
            "valid": true,
            "start_at": workflow.start_at,
            "states": workflow.states.len(),
            "total_states": total,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} is valid",
        style("✓").green().bold(),
        style(asl.display()).cyan()
    );
    println!(
        "  {} states ({} including branches), starts at {}",
        workflow.states.len(),
        total,
        style(&workflow.start_at).bold()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Input from `--input`, else stdin when it is piped, else `{}`.
async fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read input {}", path.display())),
        None if !std::io::stdin().is_terminal() => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read input from stdin")?;
            Ok(buf)
        }
        None => Ok(b"{}".to_vec()),
    }
}

fn report_failure(err: &ExecutionError, json: bool) -> Result<()> {
    if json {
        let report = error_report(err);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        eprintln!(
            "{} {}",
            style("✗ Execution failed:").red().bold(),
            err
        );
    }
    Ok(())
}

/// Machine-readable form of a run failure.
fn error_report(err: &ExecutionError) -> Value {
    let (error, cause, state) = match err {
        ExecutionError::Failed { state, error, cause } => {
            (error.clone(), cause.clone(), Some(state.clone()))
        }
        ExecutionError::State { state, error } => {
            (error.error.clone(), error.cause.clone(), Some(state.clone()))
        }
        ExecutionError::Cancelled => ("Cancelled".to_string(), err.to_string(), None),
        ExecutionError::Timeout => ("Timeout".to_string(), err.to_string(), None),
        other => ("ExecutionError".to_string(), other.to_string(), None),
    };
    json!({
        "status": if err.is_cancellation() { "ABORTED" } else { "FAILED" },
        "error": error,
        "cause": cause,
        "state": state,
    })
}

/// Number of states including every Parallel branch and Map iterator.
fn count_states(machine: &StateMachine) -> usize {
    machine
        .states
        .values()
        .map(|state| {
            1 + match &state.kind {
                StateKind::Parallel(parallel) => {
                    parallel.branches.iter().map(|b| count_states(b)).sum()
                }
                StateKind::Map(map) => count_states(&map.iterator),
                _ => 0,
            }
        })
        .sum()
}
