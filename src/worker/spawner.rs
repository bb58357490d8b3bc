//! Worker process spawner.
//!
//! Spawns one worker per caller with:
//! - `kill_on_drop(true)` so an abandoned child does not outlive the broker.
//! - `env_clear()` plus an allowlist, so none of the broker's environment
//!   leaks into untrusted sdk code.
//! - A startup timeout: the worker must print one ready line on stdout
//!   before it is handed to the client.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::models::identity::CallingIdentity;
use crate::{AppError, Result};

/// Environment variables inherited by the worker.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "RUST_LOG", "TMPDIR", "LANG"];

/// Caller uid handed to the worker.
pub const ENV_CALLER_UID: &str = "SANDBOX_CALLER_UID";

/// Caller package handed to the worker.
pub const ENV_CALLER_PACKAGE: &str = "SANDBOX_CALLER_PACKAGE";

/// Worker process name handed to the worker.
pub const ENV_PROCESS_NAME: &str = "SANDBOX_PROCESS_NAME";

/// Freshly started worker that has emitted its ready line.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// Child handle; dropping it kills the process.
    pub child: Child,
    /// Worker stdin.
    pub stdin: ChildStdin,
    /// Worker stdout, positioned after the ready line.
    pub stdout: BufReader<ChildStdout>,
}

/// Spawn the worker for `caller` and wait for its ready line.
///
/// # Errors
///
/// Returns `AppError::ProcessUnavailable` if the process cannot be spawned,
/// exits before the ready line, or misses the startup timeout (the child is
/// killed first).
pub async fn spawn_worker(config: &WorkerConfig, caller: &CallingIdentity) -> Result<SpawnedWorker> {
    let process_name = caller.sandbox_process_name(&config.process_name_suffix);

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.env(ENV_CALLER_UID, caller.uid().to_string())
        .env(ENV_CALLER_PACKAGE, caller.package_name())
        .env(ENV_PROCESS_NAME, &process_name);

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::ProcessUnavailable(format!("failed to spawn worker: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::ProcessUnavailable("failed to capture worker stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::ProcessUnavailable("failed to capture worker stdout".into()))?;

    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    match tokio::time::timeout(config.startup_timeout(), reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {
            info!(
                uid = caller.uid(),
                process_name,
                pid = child.id(),
                ready_line = line.trim(),
                "worker emitted ready signal"
            );
        }
        Ok(Ok(_)) => {
            return Err(AppError::ProcessUnavailable(
                "worker exited before ready signal".into(),
            ));
        }
        Ok(Err(err)) => {
            return Err(AppError::ProcessUnavailable(format!(
                "failed to read worker ready signal: {err}"
            )));
        }
        Err(_elapsed) => {
            child.kill().await.ok();
            return Err(AppError::ProcessUnavailable(format!(
                "startup timeout: worker did not emit ready signal within {:?}",
                config.startup_timeout()
            )));
        }
    }

    Ok(SpawnedWorker {
        child,
        stdin,
        stdout: reader,
    })
}

/// Own `child` until it exits, then cancel `exited`.
///
/// Cancelling `kill` kills the child first.
#[must_use]
pub fn monitor_exit(
    label: String,
    mut child: Child,
    exited: CancellationToken,
    kill: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => match result {
                Ok(status) => info!(worker = %label, %status, "worker exited"),
                Err(err) => warn!(worker = %label, %err, "error waiting for worker"),
            },
            () = kill.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(worker = %label, %err, "failed to kill worker");
                }
                info!(worker = %label, "worker stopped");
            }
        }
        exited.cancel();
    })
}
