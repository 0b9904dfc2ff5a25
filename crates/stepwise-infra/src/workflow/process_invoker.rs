//! Subprocess-backed resource invoker.
//!
//! [`ProcessInvoker`] implements the [`ResourceInvoker`] port from
//! stepwise-core. A `script:<name>` resource resolves `<name>` on `PATH`,
//! runs it with the task input's `args` array as its arguments, and returns
//! `{"result": "<stdout>"}`. Stderr and the exit status go into the failure
//! cause when the script exits non-zero.
//!
//! `command` and `curl` resources are recognised but not implemented.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value, json};
use stepwise_core::workflow::step_runner::{ResourceError, ResourceInvoker};
use stepwise_types::config::EngineConfig;
use stepwise_types::resource::{ResourceScheme, TaskResource};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Runs `script:` resources as child processes.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    kill_grace: Duration,
}

impl ProcessInvoker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }

    async fn run_script(
        &self,
        name: &str,
        args: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<Value, ResourceError> {
        let exe = resolve_executable(name)?;

        let mut child = Command::new(&exe)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResourceError::Failed(format!("failed to spawn {}: {e}", exe.display())))?;

        tracing::debug!(script = name, pid = ?child.id(), args = args.len(), "script started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = {
            let run = async {
                tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = run => Some(result),
            }
        };

        let Some(finished) = finished else {
            self.kill(&mut child, name).await;
            return Err(ResourceError::Cancelled);
        };

        let (status, out, err) = finished
            .map_err(|e| ResourceError::Failed(format!("failed to wait for '{name}': {e}")))?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&err);
            return Err(ResourceError::Failed(format!(
                "'{name}' exited with {status}: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(out)
            .map_err(|_| ResourceError::Failed(format!("'{name}' output is not valid UTF-8")))?;

        Ok(json!({ "result": stdout }))
    }

    /// Kill a cancelled script and give it `kill_grace` to be reaped.
    async fn kill(&self, child: &mut Child, name: &str) {
        if let Err(e) = child.start_kill() {
            tracing::warn!(script = name, error = %e, "failed to kill cancelled script");
            return;
        }
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(_) => tracing::debug!(script = name, "cancelled script killed"),
            Err(_) => tracing::warn!(
                script = name,
                grace_ms = self.kill_grace.as_millis() as u64,
                "cancelled script not reaped within grace period"
            ),
        }
    }
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl ResourceInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        resource: &TaskResource,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ResourceError> {
        match resource.scheme {
            ResourceScheme::Script => {
                let args = script_args(&input)?;
                self.run_script(&resource.name, args, cancel).await
            }
            ResourceScheme::Command | ResourceScheme::Curl => {
                Err(ResourceError::NotImplemented(resource.scheme))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract the argument list: the input must be an object whose optional
/// `args` member is an array of strings.
fn script_args(input: &Value) -> Result<Vec<String>, ResourceError> {
    let Some(object) = input.as_object() else {
        return Err(ResourceError::InvalidInput(
            "script input must be a JSON object".to_string(),
        ));
    };

    let Some(args) = object.get("args") else {
        return Ok(Vec::new());
    };

    let Some(args) = args.as_array() else {
        return Err(ResourceError::InvalidInput("'args' must be an array".to_string()));
    };

    args.iter()
        .map(|arg| {
            arg.as_str().map(str::to_owned).ok_or_else(|| {
                ResourceError::InvalidInput(format!("'args' entries must be strings, got {arg}"))
            })
        })
        .collect()
}

/// Resolve `name` to an executable: names with a path separator are used
/// as-is, bare names are searched for on `PATH`.
fn resolve_executable(name: &str) -> Result<PathBuf, ResourceError> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return if is_executable(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(ResourceError::Failed(format!("'{name}' is not an executable file")))
        };
    }

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
        .ok_or_else(|| ResourceError::Failed(format!("executable '{name}' not found in PATH")))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
