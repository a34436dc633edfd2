//! Server registry: persistent configurations plus in-memory runtime state.
//!
//! Configurations live in a JSON document `{"servers": {name: config}}` and
//! are rewritten on every mutation. Runtime state (`ProcessInfo`) is kept in
//! memory only. The registry never spawns anything; it is the single source
//! of truth for declared servers.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

pub mod models;

pub use models::{
    EnvValue, ProcessInfo, ProcessUpdate, ServerConfig, ServerState, ServerStatus, ServerTransport,
};

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    servers: HashMap<String, serde_json::Value>,
}

struct Inner {
    servers: HashMap<String, ServerConfig>,
    processes: HashMap<String, ProcessInfo>,
}

/// Manages server configurations and runtime state.
pub struct ServerRegistry {
    config_path: PathBuf,
    inner: Mutex<Inner>,
}

impl ServerRegistry {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            inner: Mutex::new(Inner {
                servers: HashMap::new(),
                processes: HashMap::new(),
            }),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load server configurations from the JSON file.
    ///
    /// A missing file is created empty. Invalid entries are logged and
    /// skipped; an unparseable document is a [`Error::Config`].
    pub fn load(&self) -> Result<()> {
        if !self.config_path.exists() {
            warn!(
                "Config file not found: {}, creating empty",
                self.config_path.display()
            );
            if let Some(parent) = self.config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            return self.save();
        }

        let content = std::fs::read_to_string(&self.config_path)?;
        let doc: ConfigFile = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Invalid JSON in {}: {}",
                self.config_path.display(),
                e
            ))
        })?;

        let mut inner = self.inner.lock();
        for (name, raw) in doc.servers {
            match serde_json::from_value::<ServerConfig>(raw) {
                Ok(mut config) => {
                    config.name = name.clone();
                    inner.processes.insert(name.clone(), ProcessInfo::default());
                    inner.servers.insert(name.clone(), config);
                    info!("Loaded server config: {}", name);
                },
                Err(e) => {
                    error!("Failed to load server {}: {}", name, e);
                },
            }
        }

        info!("Loaded {} server configurations", inner.servers.len());
        Ok(())
    }

    /// Save all server configurations to the JSON file.
    pub fn save(&self) -> Result<()> {
        let inner = self.inner.lock();
        self.save_locked(&inner)
    }

    fn save_locked(&self, inner: &Inner) -> Result<()> {
        let servers: serde_json::Map<String, serde_json::Value> = inner
            .servers
            .iter()
            .map(|(name, config)| Ok((name.clone(), serde_json::to_value(config)?)))
            .collect::<Result<_>>()?;

        let doc = serde_json::json!({ "servers": servers });
        std::fs::write(&self.config_path, serde_json::to_string_pretty(&doc)?)?;
        info!("Saved {} server configurations", inner.servers.len());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ServerConfig> {
        self.inner.lock().servers.get(name).cloned()
    }

    pub fn get_process_info(&self, name: &str) -> Option<ProcessInfo> {
        self.inner.lock().processes.get(name).cloned()
    }

    /// Combined config and process info for a server.
    pub fn get_state(&self, name: &str) -> Option<ServerState> {
        let inner = self.inner.lock();
        let config = inner.servers.get(name)?.clone();
        let process = inner.processes.get(name).cloned().unwrap_or_default();
        Some(ServerState { config, process })
    }

    pub fn list_all(&self) -> Vec<ServerState> {
        let inner = self.inner.lock();
        let mut states: Vec<ServerState> = inner
            .servers
            .values()
            .map(|config| ServerState {
                config: config.clone(),
                process: inner.processes.get(&config.name).cloned().unwrap_or_default(),
            })
            .collect();
        states.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        states
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Add a new server configuration and persist.
    pub fn add(&self, config: ServerConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.servers.contains_key(&config.name) {
            return Err(Error::Conflict(format!(
                "Server {} already exists",
                config.name
            )));
        }

        let name = config.name.clone();
        inner.processes.insert(name.clone(), ProcessInfo::default());
        inner.servers.insert(name.clone(), config);
        self.save_locked(&inner)?;
        info!("Added server: {}", name);
        Ok(())
    }

    /// Remove a server configuration and persist. Running servers must be
    /// stopped first.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.servers.contains_key(name) {
            return Err(Error::ServerNotFound(name.to_string()));
        }

        if inner.processes.get(name).is_some_and(|p| p.is_running()) {
            return Err(Error::Conflict(format!(
                "Cannot remove running server {}, stop it first",
                name
            )));
        }

        inner.servers.remove(name);
        inner.processes.remove(name);
        self.save_locked(&inner)?;
        info!("Removed server: {}", name);
        Ok(())
    }

    /// Apply a partial update to a server's runtime process info.
    pub fn update_process_info(&self, name: &str, update: ProcessUpdate) -> Result<ProcessInfo> {
        let mut inner = self.inner.lock();
        if !inner.servers.contains_key(name) {
            return Err(Error::ServerNotFound(name.to_string()));
        }

        let info = inner.processes.entry(name.to_string()).or_default();
        update.apply(info);
        Ok(info.clone())
    }

    /// Reset a server's process info to the stopped state.
    pub fn reset_process_info(&self, name: &str) -> Result<ProcessInfo> {
        let mut inner = self.inner.lock();
        if !inner.servers.contains_key(name) {
            return Err(Error::ServerNotFound(name.to_string()));
        }

        let info = ProcessInfo::default();
        inner.processes.insert(name.to_string(), info.clone());
        Ok(info)
    }

    pub fn get_auto_start_servers(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<ServerConfig> = self
            .inner
            .lock()
            .servers
            .values()
            .filter(|c| c.auto_start)
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn get_stdio_servers(&self) -> Vec<ServerConfig> {
        self.inner
            .lock()
            .servers
            .values()
            .filter(|c| c.transport == ServerTransport::Stdio)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn stdio_config(name: &str) -> ServerConfig {
        let mut config: ServerConfig = serde_json::from_value(json!({
            "package": format!("@example/{name}"),
            "transport": "stdio",
            "command": "cat",
            "auto_start": true,
        }))
        .unwrap();
        config.name = name.to_string();
        config
    }

    #[test]
    fn creates_missing_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("servers.json");

        let registry = ServerRegistry::new(&path);
        registry.load().unwrap();

        assert!(path.exists());
        assert!(registry.list_names().is_empty());
    }

    #[test]
    fn add_save_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");

        let registry = ServerRegistry::new(&path);
        registry.load().unwrap();
        registry.add(stdio_config("echo")).unwrap();

        let reloaded = ServerRegistry::new(&path);
        reloaded.load().unwrap();

        let config = reloaded.get("echo").unwrap();
        assert_eq!(config.name, "echo");
        assert_eq!(config.command.as_deref(), Some("cat"));
        assert!(config.auto_start);
        assert_eq!(config.max_restarts, 3);
        assert_eq!(
            reloaded.get_process_info("echo").unwrap().status,
            ServerStatus::Stopped
        );
    }

    #[test]
    fn add_duplicate_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = ServerRegistry::new(dir.path().join("servers.json"));
        registry.load().unwrap();

        registry.add(stdio_config("echo")).unwrap();
        assert!(matches!(
            registry.add(stdio_config("echo")),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn remove_running_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = ServerRegistry::new(dir.path().join("servers.json"));
        registry.load().unwrap();
        registry.add(stdio_config("echo")).unwrap();

        registry
            .update_process_info("echo", ProcessUpdate::new().status(ServerStatus::Running))
            .unwrap();
        assert!(matches!(registry.remove("echo"), Err(Error::Conflict(_))));

        registry
            .update_process_info("echo", ProcessUpdate::new().status(ServerStatus::Stopped))
            .unwrap();
        registry.remove("echo").unwrap();
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn invalid_entries_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            json!({
                "servers": {
                    "good": {"package": "pkg", "transport": "stdio", "command": "cat"},
                    "bad": {"package": "pkg", "transport": "carrier-pigeon"},
                }
            })
            .to_string(),
        )
        .unwrap();

        let registry = ServerRegistry::new(&path);
        registry.load().unwrap();
        assert_eq!(registry.list_names(), vec!["good".to_string()]);
    }

    #[test]
    fn unparseable_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "{not json").unwrap();

        let registry = ServerRegistry::new(&path);
        assert!(matches!(registry.load(), Err(Error::Config(_))));
    }
}
