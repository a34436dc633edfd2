//! Data models for MCP server configuration and runtime state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Transport protocol for MCP server communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    /// Communicate via the child's stdin/stdout
    Stdio,
    /// Communicate via HTTP
    Http,
}

/// Runtime status of an MCP server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Crashed past its restart budget; stays failed until a manual start
    Failed,
}

impl ServerStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ServerStatus::Running | ServerStatus::Starting)
    }
}

/// An environment variable value: either a literal string or a tagged
/// reference into the external credential store, kept in its on-disk form
/// until spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    Credential {
        source: String,
        service: String,
        key: String,
    },
}

/// Configuration for a single MCP server.
///
/// Stdio transport requires `command` (plus optional `args`); http transport
/// requires `url`. The other family's fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique identifier; injected from the map key on load
    #[serde(default, skip_serializing)]
    pub name: String,

    /// Package the server ships as (npm name or similar)
    #[serde(default)]
    pub package: String,

    pub transport: ServerTransport,

    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, EnvValue>,

    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,

    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    #[serde(default)]
    pub description: String,
}

impl ServerConfig {
    /// Full argv for spawning, `[command, args...]`.
    pub fn full_command(&self) -> Result<Vec<String>> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| Error::Config(format!("Server {} has no command configured", self.name)))?;

        let mut cmd = vec![command.clone()];
        cmd.extend(self.args.iter().cloned());
        Ok(cmd)
    }
}

/// Runtime information about a server process. Ephemeral, never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: ServerStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Consecutive automatic restarts since the last manual start/stop
    #[serde(default)]
    pub restart_count: u32,
    pub last_error: Option<String>,
}

impl ProcessInfo {
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}

/// Combined configuration and runtime state, for read APIs.
#[derive(Debug, Clone, Serialize)]
pub struct ServerState {
    pub config: ServerConfig,
    pub process: ProcessInfo,
}

impl ServerState {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn status(&self) -> ServerStatus {
        self.process.status
    }
}

/// Partial update for [`ProcessInfo`]; only the fields given are applied.
#[derive(Debug, Default)]
pub struct ProcessUpdate {
    pid: Option<Option<u32>>,
    status: Option<ServerStatus>,
    started_at: Option<Option<DateTime<Utc>>>,
    restart_count: Option<u32>,
    last_error: Option<Option<String>>,
}

impl ProcessUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn status(mut self, status: ServerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn restart_count(mut self, count: u32) -> Self {
        self.restart_count = Some(count);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub(crate) fn apply(self, info: &mut ProcessInfo) {
        if let Some(pid) = self.pid {
            info.pid = pid;
        }
        if let Some(status) = self.status {
            info.status = status;
        }
        if let Some(at) = self.started_at {
            info.started_at = at;
        }
        if let Some(count) = self.restart_count {
            info.restart_count = count;
        }
        if let Some(error) = self.last_error {
            info.last_error = error;
        }
    }
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_health_check_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn env_value_forms() {
        let env: HashMap<String, EnvValue> = serde_json::from_value(json!({
            "PLAIN": "value",
            "SECRET": {"source": "keyring", "service": "router", "key": "api_key"},
        }))
        .unwrap();

        assert_eq!(env["PLAIN"], EnvValue::Literal("value".into()));
        assert_eq!(
            env["SECRET"],
            EnvValue::Credential {
                source: "keyring".into(),
                service: "router".into(),
                key: "api_key".into(),
            }
        );
    }

    #[test]
    fn config_defaults() {
        let config: ServerConfig = serde_json::from_value(json!({
            "package": "@example/server",
            "transport": "stdio",
            "command": "npx",
        }))
        .unwrap();

        assert!(!config.auto_start);
        assert!(config.restart_on_failure);
        assert_eq!(config.max_restarts, 3);
        assert_eq!(config.health_endpoint, "/health");
        assert_eq!(config.full_command().unwrap(), vec!["npx".to_string()]);
    }

    #[test]
    fn unknown_fields_ignored() {
        let config: std::result::Result<ServerConfig, _> = serde_json::from_value(json!({
            "package": "pkg",
            "transport": "http",
            "url": "http://localhost:9000",
            "some_future_field": true,
        }));
        assert!(config.is_ok());
    }

    #[test]
    fn partial_update_applies_only_given_fields() {
        let mut info = ProcessInfo {
            pid: Some(42),
            status: ServerStatus::Running,
            restart_count: 2,
            ..Default::default()
        };

        ProcessUpdate::new()
            .status(ServerStatus::Stopped)
            .pid(None)
            .apply(&mut info);

        assert_eq!(info.status, ServerStatus::Stopped);
        assert_eq!(info.pid, None);
        assert_eq!(info.restart_count, 2);
    }
}
