//! Process manager for MCP server subprocesses.
//!
//! Spawns stdio servers with piped stdin/stdout/stderr, stops them
//! gracefully (SIGTERM, then SIGKILL after a grace period), and performs
//! non-blocking liveness checks that collect a stderr postmortem when a
//! child has died. The manager owns the child-process table; the supervisor
//! takes the stdio pipes from here to attach a bridge.

use chrono::Utc;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::registry::{
    EnvValue, ProcessInfo, ProcessUpdate, ServerConfig, ServerRegistry, ServerStatus,
};

pub mod credentials;

pub use credentials::{CredentialStore, EnvCredentials, NullCredentials};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_POSTMORTEM_BYTES: usize = 1024;
const STDERR_POSTMORTEM_DEADLINE: Duration = Duration::from_millis(100);

struct ManagedProcess {
    child: Child,
    /// stdin/stdout, held until the supervisor takes them for a bridge
    io: Option<(ChildStdin, ChildStdout)>,
}

/// Manages subprocess lifecycle for stdio MCP servers.
pub struct ProcessManager {
    registry: Arc<ServerRegistry>,
    credentials: Arc<dyn CredentialStore>,
    processes: Mutex<HashMap<String, ManagedProcess>>,
}

impl ProcessManager {
    pub fn new(registry: Arc<ServerRegistry>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            registry,
            credentials,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Start a server process.
    ///
    /// Rejects servers that are already alive. On spawn failure the server
    /// transitions to FAILED with `last_error` populated and the call fails
    /// with [`Error::SpawnFailure`].
    pub async fn start(&self, name: &str) -> Result<ProcessInfo> {
        let config = self
            .registry
            .get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        {
            let mut processes = self.processes.lock().await;
            if let Some(managed) = processes.get_mut(name) {
                if matches!(managed.child.try_wait(), Ok(None)) {
                    return Err(Error::Conflict(format!(
                        "Server {} is already running",
                        name
                    )));
                }
                processes.remove(name);
            }
        }

        self.registry
            .update_process_info(name, ProcessUpdate::new().status(ServerStatus::Starting))?;

        match self.spawn(&config).await {
            Ok((child, io, pid)) => {
                self.processes
                    .lock()
                    .await
                    .insert(name.to_string(), ManagedProcess { child, io });

                // Manual start re-arms the restart budget
                let info = self.registry.update_process_info(
                    name,
                    ProcessUpdate::new()
                        .pid(Some(pid))
                        .status(ServerStatus::Running)
                        .started_at(Some(Utc::now()))
                        .restart_count(0)
                        .last_error(None),
                )?;

                info!("Started server {} with PID {}", name, pid);
                Ok(info)
            },
            Err(e) => {
                let message = e.to_string();
                error!("Failed to start server {}: {}", name, message);
                self.registry.update_process_info(
                    name,
                    ProcessUpdate::new()
                        .status(ServerStatus::Failed)
                        .last_error(Some(message.clone())),
                )?;
                Err(Error::SpawnFailure {
                    name: name.to_string(),
                    message,
                })
            },
        }
    }

    async fn spawn(
        &self,
        config: &ServerConfig,
    ) -> Result<(Child, Option<(ChildStdin, ChildStdout)>, u32)> {
        let argv = config.full_command()?;
        info!("Starting server {}: {}", config.name, argv.join(" "));

        let resolved = credentials::resolve_env(&config.env, self.credentials.as_ref());
        let reference_count = config
            .env
            .values()
            .filter(|v| matches!(v, EnvValue::Credential { .. }))
            .count();
        if reference_count > 0 {
            info!(
                "Server {}: resolved credentials for {} reference(s)",
                config.name, reference_count
            );
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &resolved {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Server("No stdin available".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Server("No stdout available".to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Server("Process exited before startup completed".to_string()))?;

        Ok((child, Some((stdin, stdout)), pid))
    }

    /// Stop a server process. Graceful mode sends SIGTERM and waits up to
    /// the shutdown grace period before force-killing; `force` kills
    /// immediately. Stopping an already-stopped server is a no-op.
    pub async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let managed = {
            let mut processes = self.processes.lock().await;
            processes.remove(name)
        };

        let Some(mut managed) = managed else {
            let info = self.registry.get_process_info(name);
            if matches!(&info, Some(i) if i.status == ServerStatus::Stopped) {
                return Ok(());
            }
            return Err(Error::Conflict(format!("Server {} is not running", name)));
        };

        self.registry
            .update_process_info(name, ProcessUpdate::new().status(ServerStatus::Stopping))?;

        if force {
            warn!("Force killing server {}", name);
            managed.child.kill().await?;
        } else {
            info!("Stopping server {} gracefully", name);
            terminate(&mut managed.child);

            match tokio::time::timeout(SHUTDOWN_TIMEOUT, managed.child.wait()).await {
                Ok(result) => {
                    let _ = result?;
                },
                Err(_) => {
                    warn!("Server {} did not stop gracefully, force killing", name);
                    managed.child.kill().await?;
                },
            }
        }

        self.registry.update_process_info(
            name,
            ProcessUpdate::new().pid(None).status(ServerStatus::Stopped),
        )?;

        info!("Stopped server {}", name);
        Ok(())
    }

    /// Restart a server process.
    pub async fn restart(&self, name: &str) -> Result<ProcessInfo> {
        if self.is_running(name).await {
            self.stop(name, false).await?;
        }
        self.start(name).await
    }

    /// Whether a server process is currently alive.
    pub async fn is_running(&self, name: &str) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(name) {
            Some(managed) => matches!(managed.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Take the child's stdio pipes for bridge attachment. Returns `None`
    /// once taken or when the process is not tracked.
    pub async fn take_io(&self, name: &str) -> Option<(ChildStdin, ChildStdout)> {
        let mut processes = self.processes.lock().await;
        processes.get_mut(name).and_then(|managed| managed.io.take())
    }

    /// Non-blocking liveness check. If the child has exited, a stderr
    /// postmortem (up to 1 KiB, 100 ms deadline) is folded into
    /// `last_error`, the server transitions to STOPPED, and the handle is
    /// dropped. Returns whether the process is alive.
    pub async fn check_process(&self, name: &str) -> bool {
        let exited = {
            let mut processes = self.processes.lock().await;
            let Some(managed) = processes.get_mut(name) else {
                return false;
            };

            match managed.child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => {
                    let managed = processes.remove(name).expect("entry exists");
                    Some((status, managed))
                },
                Err(e) => {
                    error!("Failed to check process status for {}: {}", name, e);
                    return false;
                },
            }
        };

        let Some((status, mut managed)) = exited else {
            return false;
        };

        let stderr_output = read_stderr_postmortem(&mut managed.child).await;
        let mut error_msg = match status.code() {
            Some(code) => format!("Process exited with code {}", code),
            None => "Process terminated by signal".to_string(),
        };
        if !stderr_output.is_empty() {
            let tail: String = stderr_output.chars().take(200).collect();
            error_msg.push_str(&format!(": {}", tail));
        }

        warn!("Server {} process died: {}", name, error_msg);

        let _ = self.registry.update_process_info(
            name,
            ProcessUpdate::new()
                .pid(None)
                .status(ServerStatus::Stopped)
                .last_error(Some(error_msg)),
        );

        false
    }

    /// Best-effort stop of every tracked process, continuing past
    /// individual failures.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name, false).await {
                error!("Error stopping {}: {}", name, e);
            }
        }
    }

    /// Names of all servers with a live child process.
    pub async fn get_running_servers(&self) -> Vec<String> {
        let mut processes = self.processes.lock().await;
        let mut names: Vec<String> = Vec::new();
        for (name, managed) in processes.iter_mut() {
            if matches!(managed.child.try_wait(), Ok(None)) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to pid {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    // No SIGTERM equivalent; the grace period degrades to an immediate kill
    let _ = child.start_kill();
}

async fn read_stderr_postmortem(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };

    let mut buf = vec![0u8; STDERR_POSTMORTEM_BYTES];
    match tokio::time::timeout(STDERR_POSTMORTEM_DEADLINE, stderr.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => String::from_utf8_lossy(&buf[..n]).trim().to_string(),
        _ => String::new(),
    }
}
