//! Proxy dispatch: the data path from an incoming JSON-RPC request to a
//! supervised stdio server.
//!
//! For a request targeting server S: consult S's circuit breaker, make sure
//! S is running (auto-starting when configured), forward the body over S's
//! stdio bridge, and record the outcome on the breaker.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::registry::{ServerRegistry, ServerStatus, ServerTransport};
use crate::resilience::CircuitBreakerRegistry;
use crate::supervisor::Supervisor;
use crate::types::{JsonRpcError, JsonRpcRequest};

pub struct Dispatcher {
    registry: Arc<ServerRegistry>,
    supervisor: Arc<Supervisor>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServerRegistry>,
        supervisor: Arc<Supervisor>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            breakers,
        }
    }

    /// Forward a JSON-RPC request to a server and return its response with
    /// the caller's id restored.
    ///
    /// Transport and bridge failures count against the server's circuit
    /// breaker; a JSON-RPC error payload does not, since the server
    /// answered.
    pub async fn dispatch(&self, server: &str, request: JsonRpcRequest) -> Result<Value> {
        let config = self
            .registry
            .get(server)
            .ok_or_else(|| Error::ServerNotFound(server.to_string()))?;

        if config.transport != ServerTransport::Stdio {
            return Err(Error::Conflict(format!(
                "Server {} does not use stdio transport",
                server
            )));
        }

        let breaker = self.breakers.get(server);
        breaker.check()?;

        self.ensure_running(server, config.auto_start).await?;

        let bridge = self.supervisor.get_bridge(server).ok_or_else(|| {
            Error::Conflict(format!("No bridge attached for server {}", server))
        })?;

        let client_id = request.id.clone();
        match bridge.send(&request.method, request.params).await {
            Ok(mut response) => {
                breaker.record_success();

                // Application-level errors still mean the server answered
                if let Some(payload) = response.get("error") {
                    if let Ok(err) = serde_json::from_value::<JsonRpcError>(payload.clone()) {
                        debug!(
                            "Server {} returned JSON-RPC error {}: {}",
                            server, err.code, err.message
                        );
                    }
                }

                // The bridge allocated its own request id; hand the
                // caller's back
                response["id"] = client_id.unwrap_or(Value::Null);
                Ok(response)
            },
            Err(e) => {
                breaker.record_failure();
                warn!("Dispatch to {} failed: {}", server, e);
                Err(e)
            },
        }
    }

    async fn ensure_running(&self, server: &str, auto_start: bool) -> Result<()> {
        let status = self
            .registry
            .get_process_info(server)
            .map(|info| info.status)
            .unwrap_or_default();

        if status == ServerStatus::Running {
            return Ok(());
        }

        if !auto_start {
            return Err(Error::Conflict(format!(
                "Server {} is not running",
                server
            )));
        }

        debug!("Auto-starting server {} for dispatch", server);
        self.supervisor.start_server(server).await
    }
}
