//! Child-process [`ProcessSupervisor`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::models::identity::CallingIdentity;
use crate::sandbox::{BoxFuture, ProcessSupervisor, SandboxLink, WorkerLiveness};
use crate::worker::client::{WorkerClient, WorkerConnection};
use crate::worker::spawner::{monitor_exit, spawn_worker};
use crate::Result;

struct RunningWorker {
    link: SandboxLink,
    kill: CancellationToken,
}

impl RunningWorker {
    fn is_alive(&self) -> bool {
        !self.link.liveness.exited.is_cancelled() && !self.link.liveness.disconnected.is_cancelled()
    }
}

/// Runs each caller's worker as a child process speaking NDJSON on stdio.
pub struct ChildProcessSupervisor {
    config: WorkerConfig,
    workers: Mutex<HashMap<CallingIdentity, RunningWorker>>,
}

impl ChildProcessSupervisor {
    /// Supervisor launching workers per `config`.
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of workers currently tracked.
    pub async fn running_workers(&self) -> usize {
        self.workers.lock().await.len()
    }

    async fn start(&self, caller: &CallingIdentity) -> Result<SandboxLink> {
        {
            let mut workers = self.workers.lock().await;
            match workers.get(caller) {
                Some(running) if running.is_alive() => {
                    debug!(uid = caller.uid(), "reusing running worker");
                    return Ok(running.link.clone());
                }
                Some(_) => {
                    if let Some(stale) = workers.remove(caller) {
                        stale.kill.cancel();
                    }
                }
                None => {}
            }
        }

        let spawned = spawn_worker(&self.config, caller).await?;
        let label = caller.sandbox_process_name(&self.config.process_name_suffix);
        let liveness = WorkerLiveness::default();
        let kill = CancellationToken::new();

        let client = WorkerClient::start(
            label.clone(),
            spawned.stdout,
            spawned.stdin,
            liveness.disconnected.clone(),
        );
        drop(monitor_exit(
            label,
            spawned.child,
            liveness.exited.clone(),
            kill.clone(),
        ));

        let link = SandboxLink {
            connection: Arc::new(WorkerConnection::new(client)),
            liveness,
        };

        if let Some(replaced) = self.workers.lock().await.insert(
            caller.clone(),
            RunningWorker {
                link: link.clone(),
                kill,
            },
        ) {
            replaced.kill.cancel();
        }
        Ok(link)
    }
}

impl ProcessSupervisor for ChildProcessSupervisor {
    fn start_and_connect(&self, caller: &CallingIdentity) -> BoxFuture<'_, Result<SandboxLink>> {
        let caller = caller.clone();
        Box::pin(async move { self.start(&caller).await })
    }

    fn stop(&self, caller: &CallingIdentity) -> BoxFuture<'_, ()> {
        let caller = caller.clone();
        Box::pin(async move {
            if let Some(running) = self.workers.lock().await.remove(&caller) {
                info!(uid = caller.uid(), package = caller.package_name(), "killing worker");
                running.kill.cancel();
            }
        })
    }

    fn unbind(&self, caller: &CallingIdentity) -> BoxFuture<'_, ()> {
        let uid = caller.uid();
        Box::pin(async move {
            debug!(uid, "worker binding released");
        })
    }

    fn kill_caller(&self, caller: &CallingIdentity) -> BoxFuture<'_, ()> {
        let caller = caller.clone();
        Box::pin(async move {
            let Some(token) = caller.process_token() else {
                warn!(uid = caller.uid(), "no process token; cannot kill caller");
                return;
            };
            kill_process(token.pid);
        })
    }
}

#[cfg(unix)]
fn kill_process(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range; not killing caller");
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => info!(pid, "caller killed"),
        Err(err) => warn!(pid, %err, "failed to kill caller"),
    }
}

#[cfg(not(unix))]
fn kill_process(pid: u32) {
    warn!(pid, "killing callers is not supported on this platform");
}
