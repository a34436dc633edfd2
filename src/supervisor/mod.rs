//! Supervisor for MCP server lifecycle and auto-restart.
//!
//! Composes the registry, the process manager, and the stdio bridges. A
//! background liveness loop reaps dead children and restarts them while
//! `restart_on_failure` is set and the restart budget is not exhausted;
//! crossing `max_restarts` latches FAILED until a manual start.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::StdioBridge;
use crate::error::{Error, Result};
use crate::process::ProcessManager;
use crate::registry::{ProcessUpdate, ServerRegistry, ServerStatus, ServerTransport};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Point-in-time summary of every managed server.
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub failed: usize,
    pub servers: HashMap<String, ServerSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ServerSnapshot {
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
}

/// Monitors server health and handles auto-restart.
pub struct Supervisor {
    registry: Arc<ServerRegistry>,
    process_manager: Arc<ProcessManager>,
    check_interval: Duration,
    bridges: DashMap<String, Arc<StdioBridge>>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        process_manager: Arc<ProcessManager>,
        check_interval: Duration,
    ) -> Self {
        Self {
            registry,
            process_manager,
            check_interval,
            bridges: DashMap::new(),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    /// Start auto-start servers and launch the liveness loop.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Supervisor is already running");
            return;
        }

        info!("Starting supervisor");
        self.start_auto_servers().await;

        let token = CancellationToken::new();
        *self.cancel.lock().await = token.clone();
        *task = Some(tokio::spawn(self.clone().run_liveness_loop(token)));
    }

    /// Start all servers configured with `auto_start`.
    pub async fn start_auto_servers(&self) {
        let configs = self.registry.get_auto_start_servers();
        if configs.is_empty() {
            info!("No servers configured for auto-start");
            return;
        }

        info!("Auto-starting {} servers", configs.len());
        for config in configs {
            if let Err(e) = self.start_server(&config.name).await {
                error!("Failed to auto-start {}: {}", config.name, e);
            }
        }
    }

    /// Start a server and, for stdio transports, attach and initialize its
    /// bridge. Initialize failures are logged and tolerated; not every
    /// server implements the handshake.
    pub async fn start_server(&self, name: &str) -> Result<()> {
        let config = self
            .registry
            .get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        self.process_manager.start(name).await?;

        if config.transport == ServerTransport::Stdio {
            if let Some((stdin, stdout)) = self.process_manager.take_io(name).await {
                let bridge = Arc::new(StdioBridge::new(name, stdin, stdout));

                match bridge.initialize().await {
                    Ok(capabilities) => {
                        info!("Initialized {}, capabilities: {}", name, capabilities)
                    },
                    Err(e) => warn!("Failed to initialize {}: {}", name, e),
                }

                self.bridges.insert(name.to_string(), bridge);
            }
        }

        Ok(())
    }

    /// Stop a server, closing its bridge first so pending requests observe
    /// a closed bridge rather than lost futures. Resets the restart budget.
    pub async fn stop_server(&self, name: &str) -> Result<()> {
        if let Some((_, bridge)) = self.bridges.remove(name) {
            bridge.close().await;
        }

        self.process_manager.stop(name, false).await?;
        self.registry
            .update_process_info(name, ProcessUpdate::new().restart_count(0))?;
        Ok(())
    }

    pub async fn restart_server(&self, name: &str) -> Result<()> {
        self.stop_server(name).await?;
        self.start_server(name).await
    }

    /// The stdio bridge for a running server, for dispatcher use.
    pub fn get_bridge(&self, name: &str) -> Option<Arc<StdioBridge>> {
        self.bridges.get(name).map(|entry| entry.value().clone())
    }

    /// Cancel the liveness loop, close all bridges, and stop every process.
    pub async fn stop(&self) {
        info!("Stopping supervisor");
        self.cancel.lock().await.cancel();

        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }

        let names: Vec<String> = self.bridges.iter().map(|e| e.key().clone()).collect();
        let closing: Vec<_> = names
            .into_iter()
            .filter_map(|name| self.bridges.remove(&name))
            .map(|(_, bridge)| async move { bridge.close().await })
            .collect();
        futures::future::join_all(closing).await;

        self.process_manager.stop_all().await;
        info!("Supervisor stopped");
    }

    pub fn get_status_summary(&self) -> StatusSummary {
        let states = self.registry.list_all();
        let mut summary = StatusSummary {
            total: states.len(),
            running: 0,
            stopped: 0,
            failed: 0,
            servers: HashMap::new(),
        };

        for state in states {
            match state.process.status {
                ServerStatus::Running => summary.running += 1,
                ServerStatus::Failed => summary.failed += 1,
                _ => summary.stopped += 1,
            }

            summary.servers.insert(
                state.config.name.clone(),
                ServerSnapshot {
                    status: state.process.status,
                    pid: state.process.pid,
                    restart_count: state.process.restart_count,
                },
            );
        }

        summary
    }

    async fn run_liveness_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting liveness loop (interval: {:?})", self.check_interval);

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it so checks start one
        // full period after startup
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Liveness loop cancelled");
                    break;
                },
                _ = ticker.tick() => {
                    self.check_all_servers().await;
                },
            }
        }
    }

    async fn check_all_servers(&self) {
        for state in self.registry.list_all() {
            if state.process.status == ServerStatus::Running {
                if let Err(e) = self.check_server(&state.config.name).await {
                    error!("Error checking server {}: {}", state.config.name, e);
                }
            }
        }
    }

    /// Check one server; if its process died, drop the bridge and apply the
    /// restart policy.
    async fn check_server(&self, name: &str) -> Result<()> {
        let Some(config) = self.registry.get(name) else {
            return Ok(());
        };
        let Some(process_info) = self.registry.get_process_info(name) else {
            return Ok(());
        };

        if self.process_manager.check_process(name).await {
            return Ok(());
        }

        warn!("Server {} has died", name);

        if let Some((_, bridge)) = self.bridges.remove(name) {
            bridge.close().await;
        }

        if !config.restart_on_failure {
            // check_process already recorded STOPPED and the exit postmortem
            info!("Server {} restart disabled, leaving stopped", name);
            return Ok(());
        }

        let current_restarts = process_info.restart_count;
        if current_restarts >= config.max_restarts {
            error!(
                "Server {} exceeded max restarts ({}), marking as failed",
                name, config.max_restarts
            );
            self.registry
                .update_process_info(name, ProcessUpdate::new().status(ServerStatus::Failed))?;
            return Ok(());
        }

        let attempt = current_restarts + 1;
        info!(
            "Restarting server {} (attempt {}/{})",
            name, attempt, config.max_restarts
        );

        match self.start_server(name).await {
            Ok(()) => {
                self.registry
                    .update_process_info(name, ProcessUpdate::new().restart_count(attempt))?;
            },
            Err(e) => {
                error!("Failed to restart {}: {}", name, e);
                self.registry.update_process_info(
                    name,
                    ProcessUpdate::new()
                        .status(ServerStatus::Failed)
                        .last_error(Some(e.to_string()))
                        .restart_count(attempt),
                )?;
            },
        }

        Ok(())
    }
}
