//! Per-server lifecycle state machines and their fan-out

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use async_runtime_compat::poll::{PollError, Probe};
use command_executor::{Command, Shell, shell_escape};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::policy::CoordinatorPolicy;
use crate::procfs;
use crate::report::CoordinatorReport;
use crate::spec::ProcessTarget;
use crate::{Error, Result};

/// A daemon known to run on a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteProcessHandle {
    /// Server name
    pub server: String,
    /// Server address
    pub ip: String,
    /// Discovered PID
    pub pid: u32,
    /// Where the PID is recorded on the server
    pub pid_file: String,
    /// Declared ports
    pub ports: Vec<u16>,
    /// The process was already running and was left alone
    pub reused: bool,
}

/// Result of a stop on one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The process was killed and released its ports
    Stopped {
        /// PID that was killed
        pid: u32,
    },
    /// Nothing was running
    AlreadyStopped,
}

/// Observed state of a daemon on one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    /// PID from the PID file
    pub pid: Option<u32>,
    /// Whether that PID is alive
    pub running: bool,
    /// Declared ports the PID is listening on
    pub listening: Vec<u16>,
}

/// Runs start, stop and health checks across servers
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    policy: CoordinatorPolicy,
}

impl Coordinator {
    /// Create a coordinator with the given bounds
    pub fn new(policy: CoordinatorPolicy) -> Self {
        Self { policy }
    }

    /// The bounds in use
    pub fn policy(&self) -> &CoordinatorPolicy {
        &self.policy
    }

    /// Start the daemon on one server unless it already runs
    pub async fn start(&self, target: &ProcessTarget) -> Result<RemoteProcessHandle> {
        let shell = target.server.shell.as_ref();
        let spec = &target.spec;
        let pid_file = target.pid_file();
        let handle = |pid, reused| RemoteProcessHandle {
            server: target.server.name.clone(),
            ip: target.server.ip.clone(),
            pid,
            pid_file: pid_file.clone(),
            ports: spec.ports.clone(),
            reused,
        };

        if let Some(pid) = procfs::read_pid_file(shell, &pid_file).await? {
            if procfs::pid_alive(shell, pid).await? {
                info!(component = %spec.component, server = %target.server.name, pid, "already running");
                return Ok(handle(pid, true));
            }
            debug!(component = %spec.component, server = %target.server.name, pid, "stale pid file");
        }

        let home = shell_escape(&spec.home_path);
        let launch = format!(
            "mkdir -p {home}/run {home}/log && cd {home} && nohup {} > {} 2>&1 &",
            spec.command,
            shell_escape(&spec.log_file()),
        );
        let launch_failed = |reason: String| Error::LaunchFailed {
            component: spec.component.clone(),
            server: target.server.name.clone(),
            reason,
        };
        let result = shell
            .run(Command::shell(launch))
            .await
            .map_err(|e| launch_failed(e.to_string()))?;
        if !result.success() {
            return Err(launch_failed(result.stderr.trim().to_string()));
        }

        let command = spec.command.as_str();
        let pid = self
            .policy
            .start
            .poller(self.policy.deadline())
            .run(|_| async move {
                match shell.run(Command::shell("ps -eo pid=,args=")).await {
                    Ok(listing) => match procfs::find_pid(&listing.stdout, command) {
                        Some(pid) => Probe::Ready(pid),
                        None => Probe::Pending,
                    },
                    Err(e) => Probe::Fatal(Error::from(e)),
                }
            })
            .await
            .map_err(|e| match e {
                PollError::Exhausted { .. } => Error::StartTimeout {
                    component: spec.component.clone(),
                    server: target.server.name.clone(),
                    seconds: self.policy.start.budget().as_secs(),
                },
                PollError::DeadlineExceeded { .. } => self.deadline_error(target, "start"),
                PollError::Fatal(e) => e,
            })?;

        shell
            .run_checked(Command::shell(format!(
                "echo {pid} > {}",
                shell_escape(&pid_file)
            )))
            .await?;

        info!(component = %spec.component, server = %target.server.name, pid, "started");
        Ok(handle(pid, false))
    }

    /// Wait until `pid` listens on every declared port
    ///
    /// A PID that disappears fails the check immediately.
    pub async fn health_check(&self, target: &ProcessTarget, pid: u32) -> Result<()> {
        let shell = target.server.shell.as_ref();
        let spec = &target.spec;
        let ports = spec.ports.as_slice();
        let missing = Mutex::new(spec.ports.clone());
        let missing_ref = &missing;

        let outcome = self
            .policy
            .health
            .poller(self.policy.deadline())
            .run(|_| async move {
                match procfs::pid_alive(shell, pid).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return Probe::Fatal(Error::ProcessDied {
                            component: spec.component.clone(),
                            server: target.server.name.clone(),
                            pid,
                        });
                    }
                    Err(e) => return Probe::Fatal(e),
                }

                match procfs::ports_bound_by(shell, pid, ports).await {
                    Ok(bound) => {
                        let unbound: Vec<u16> =
                            ports.iter().copied().filter(|p| !bound.contains(p)).collect();
                        let ready = unbound.is_empty();
                        if let Ok(mut guard) = missing_ref.lock() {
                            *guard = unbound;
                        }
                        if ready { Probe::Ready(()) } else { Probe::Pending }
                    }
                    Err(e) => Probe::Fatal(e),
                }
            })
            .await;

        match outcome {
            Ok(()) => {
                debug!(component = %spec.component, server = %target.server.name, pid, "healthy");
                Ok(())
            }
            Err(PollError::Exhausted { attempts }) => Err(Error::HealthCheckTimeout {
                component: spec.component.clone(),
                server: target.server.name.clone(),
                ports: missing.into_inner().unwrap_or_default(),
                attempts,
            }),
            Err(PollError::DeadlineExceeded { .. }) => Err(self.deadline_error(target, "health check")),
            Err(PollError::Fatal(e)) => Err(e),
        }
    }

    /// Start and then health-check the daemon on one server
    pub async fn start_confirmed(&self, target: &ProcessTarget) -> Result<RemoteProcessHandle> {
        let handle = self.start(target).await?;
        self.health_check(target, handle.pid).await?;
        Ok(handle)
    }

    /// Kill the daemon on one server and wait for its ports to be released
    pub async fn stop(&self, target: &ProcessTarget) -> Result<StopOutcome> {
        let shell = target.server.shell.as_ref();
        let spec = &target.spec;
        let pid_file = target.pid_file();

        let live = match procfs::read_pid_file(shell, &pid_file).await? {
            Some(pid) if procfs::pid_alive(shell, pid).await? => Some(pid),
            _ => None,
        };
        let Some(pid) = live else {
            remove_file(shell, &pid_file).await?;
            debug!(component = %spec.component, server = %target.server.name, "already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        };

        let kill = if spec.kill_group {
            format!(
                "pgid=$(ps -o pgid= -p {pid} | tr -d ' '); kill -9 {pid} 2>/dev/null; \
                 [ -n \"$pgid\" ] && kill -9 -- -$pgid 2>/dev/null; true"
            )
        } else {
            format!("kill -9 {pid} 2>/dev/null; true")
        };
        shell.run_checked(Command::shell(kill)).await?;

        let ports = spec.ports.as_slice();
        let held = Mutex::new(Vec::new());
        let held_ref = &held;

        let outcome = self
            .policy
            .stop
            .poller(self.policy.deadline())
            .run(|_| async move {
                match procfs::ports_bound_by(shell, pid, ports).await {
                    Ok(bound) if bound.is_empty() => Probe::Ready(()),
                    Ok(bound) => {
                        if let Ok(mut guard) = held_ref.lock() {
                            *guard = bound.into_iter().collect();
                        }
                        Probe::Pending
                    }
                    Err(e) => Probe::Fatal(e),
                }
            })
            .await;

        match outcome {
            Ok(()) => {}
            Err(PollError::Exhausted { .. }) => {
                let ports = held.into_inner().unwrap_or_default();
                warn!(
                    component = %spec.component,
                    server = %target.server.name,
                    pid,
                    ?ports,
                    "port not released"
                );
                return Err(Error::PortNotReleased {
                    component: spec.component.clone(),
                    server: target.server.name.clone(),
                    pid,
                    ports,
                });
            }
            Err(PollError::DeadlineExceeded { .. }) => return Err(self.deadline_error(target, "stop")),
            Err(PollError::Fatal(e)) => return Err(e),
        }

        remove_file(shell, &pid_file).await?;
        info!(component = %spec.component, server = %target.server.name, pid, "stopped");
        Ok(StopOutcome::Stopped { pid })
    }

    /// Inspect the daemon on one server without changing anything
    pub async fn status(&self, target: &ProcessTarget) -> Result<ProcessStatus> {
        let shell = target.server.shell.as_ref();
        let Some(pid) = procfs::read_pid_file(shell, &target.pid_file()).await? else {
            return Ok(ProcessStatus {
                pid: None,
                running: false,
                listening: Vec::new(),
            });
        };

        let running = procfs::pid_alive(shell, pid).await?;
        let listening = if running {
            procfs::ports_bound_by(shell, pid, &target.spec.ports)
                .await?
                .into_iter()
                .collect()
        } else {
            Vec::new()
        };

        Ok(ProcessStatus {
            pid: Some(pid),
            running,
            listening,
        })
    }

    /// Start and health-check every target
    pub async fn start_all(&self, targets: &[ProcessTarget]) -> CoordinatorReport<RemoteProcessHandle> {
        let ops = targets
            .iter()
            .map(|t| (t.server.name.clone(), self.start_confirmed(t).boxed()))
            .collect();
        self.fan_out(ops).await
    }

    /// Health-check the daemon using the PID recorded in its PID file
    pub async fn health_check_recorded(&self, target: &ProcessTarget) -> Result<()> {
        let shell = target.server.shell.as_ref();
        match procfs::read_pid_file(shell, &target.pid_file()).await? {
            Some(pid) => self.health_check(target, pid).await,
            None => Err(Error::ProcessDied {
                component: target.spec.component.clone(),
                server: target.server.name.clone(),
                pid: 0,
            }),
        }
    }

    /// Health-check every target using its recorded PID
    pub async fn health_check_all(&self, targets: &[ProcessTarget]) -> CoordinatorReport<()> {
        let ops = targets
            .iter()
            .map(|t| (t.server.name.clone(), self.health_check_recorded(t).boxed()))
            .collect();
        self.fan_out(ops).await
    }

    /// Stop every target
    pub async fn stop_all(&self, targets: &[ProcessTarget]) -> CoordinatorReport<StopOutcome> {
        let ops = targets
            .iter()
            .map(|t| (t.server.name.clone(), self.stop(t).boxed()))
            .collect();
        self.fan_out(ops).await
    }

    /// Inspect every target
    pub async fn status_all(&self, targets: &[ProcessTarget]) -> CoordinatorReport<ProcessStatus> {
        let ops = targets
            .iter()
            .map(|t| (t.server.name.clone(), self.status(t).boxed()))
            .collect();
        self.fan_out(ops).await
    }

    /// Run per-server operations with bounded concurrency
    ///
    /// A panicking operation is reported as that server's failure.
    async fn fan_out<T>(&self, ops: Vec<(String, BoxFuture<'_, Result<T>>)>) -> CoordinatorReport<T> {
        let results: Vec<(String, Result<T>)> = stream::iter(ops)
            .map(run_guarded)
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        let mut report = CoordinatorReport::default();
        for (server, result) in results {
            if let Err(e) = &result {
                warn!(server = %server, error = %e, "server operation failed");
            }
            report.push(server, result);
        }
        report
    }

    fn deadline_error(&self, target: &ProcessTarget, operation: &'static str) -> Error {
        Error::DeadlineExceeded {
            component: target.spec.component.clone(),
            server: target.server.name.clone(),
            operation,
        }
    }
}

async fn run_guarded<T>((server, fut): (String, BoxFuture<'_, Result<T>>)) -> (String, Result<T>) {
    let result = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(Error::Panicked {
            server: server.clone(),
        }),
    };
    (server, result)
}

async fn remove_file(shell: &dyn Shell, path: &str) -> Result<()> {
    shell
        .run_checked(Command::shell(format!("rm -f {}", shell_escape(path))))
        .await?;
    Ok(())
}
