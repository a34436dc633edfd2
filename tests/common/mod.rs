//! Common test utilities for integration tests

use mcp_router::process::{NullCredentials, ProcessManager};
use mcp_router::registry::{ServerConfig, ServerRegistry};
use mcp_router::supervisor::Supervisor;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestHarness {
    /// Keeps the config directory alive for the test's duration
    pub _dir: TempDir,
    pub registry: Arc<ServerRegistry>,
    #[allow(dead_code)]
    pub process_manager: Arc<ProcessManager>,
    pub supervisor: Arc<Supervisor>,
}

/// Registry + process manager + supervisor over a temp config file.
pub fn harness(check_interval: Duration) -> TestHarness {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ServerRegistry::new(dir.path().join("servers.json")));
    registry.load().unwrap();

    let process_manager = Arc::new(ProcessManager::new(
        registry.clone(),
        Arc::new(NullCredentials),
    ));
    let supervisor = Arc::new(Supervisor::new(
        registry.clone(),
        process_manager.clone(),
        check_interval,
    ));

    TestHarness {
        _dir: dir,
        registry,
        process_manager,
        supervisor,
    }
}

pub fn server_config(name: &str, value: serde_json::Value) -> ServerConfig {
    let mut config: ServerConfig = serde_json::from_value(value).unwrap();
    config.name = name.to_string();
    config
}

/// A server that stays up and echoes stdin to stdout.
#[allow(dead_code)]
pub fn cat_server(name: &str, auto_start: bool) -> ServerConfig {
    server_config(
        name,
        json!({
            "package": "test/cat",
            "transport": "stdio",
            "command": "cat",
            "auto_start": auto_start,
        }),
    )
}

/// A server that exits with code 1 as soon as it starts.
#[allow(dead_code)]
pub fn crashing_server(name: &str, max_restarts: u32, restart_on_failure: bool) -> ServerConfig {
    server_config(
        name,
        json!({
            "package": "test/crasher",
            "transport": "stdio",
            "command": "sh",
            "args": ["-c", "exit 1"],
            "restart_on_failure": restart_on_failure,
            "max_restarts": max_restarts,
        }),
    )
}
