//! Stdio bridge for JSON-RPC communication with MCP servers.
//!
//! MCP servers speak newline-delimited JSON-RPC 2.0 over stdin/stdout. The
//! bridge serializes writes, correlates concurrent requests to responses by
//! id, and runs one background reader per process. Request ids are allocated
//! monotonically under the write lock, and the pending entry is registered
//! before the frame hits the pipe so a fast responder can never race the
//! waiter.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::types::PROTOCOL_VERSION;

/// Default deadline for a request's response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Writer {
    sink: Box<dyn AsyncWrite + Send + Unpin>,
    next_id: u64,
}

/// Bridges JSON-RPC requests onto a single stdio pair.
pub struct StdioBridge {
    name: String,
    writer: Mutex<Writer>,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioBridge {
    /// Create a bridge over a write/read pair (a child's stdin/stdout) and
    /// start the background reader.
    pub fn new<W, R>(name: impl Into<String>, stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let name = name.into();
        let pending: Arc<DashMap<u64, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            name.clone(),
            Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>,
            pending.clone(),
            cancel.clone(),
        ));
        debug!("[{}] Started stdio bridge reader", name);

        Self {
            name,
            writer: Mutex::new(Writer {
                sink: Box::new(stdin),
                next_id: 0,
            }),
            pending,
            closed: AtomicBool::new(false),
            cancel,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its response with the default timeout.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Send a request and wait for the matching response.
    ///
    /// On timeout the pending entry is removed and a late response with that
    /// id is silently dropped by the reader.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::BridgeClosed);
        }

        let (tx, rx) = oneshot::channel();
        let id;
        {
            let mut writer = self.writer.lock().await;
            writer.next_id += 1;
            id = writer.next_id;

            let mut request = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
            });
            if let Some(params) = params {
                request["params"] = params;
            }

            self.pending.insert(id, tx);
            if let Err(e) = write_frame(&mut writer.sink, &request).await {
                self.pending.remove(&id);
                return Err(e);
            }
        }
        debug!("[{}] Sent: {} (id={})", self.name, method, id);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The sender is dropped only when close() drains the map
            Ok(Err(_)) => Err(Error::BridgeClosed),
            Err(_) => {
                self.pending.remove(&id);
                warn!("[{}] Timeout waiting for response to {}", self.name, method);
                Err(Error::Timeout(method.to_string()))
            },
        }
    }

    /// Send a notification; no id, no response.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::BridgeClosed);
        }

        let mut notification = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut writer = self.writer.lock().await;
        write_frame(&mut writer.sink, &notification).await?;
        debug!("[{}] Sent notification: {}", self.name, method);
        Ok(())
    }

    /// Perform the MCP initialize handshake, returning the server's reported
    /// capabilities.
    pub async fn initialize(&self) -> Result<Value> {
        let response = self
            .send(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await?;

        if let Some(error) = response.get("error") {
            return Err(Error::Protocol(format!("Initialize failed: {}", error)));
        }

        self.send_notification("notifications/initialized", None).await?;
        Ok(response.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    /// List the tools the server exposes.
    pub async fn list_tools(&self) -> Result<Value> {
        let response = self.send("tools/list", Some(json!({}))).await?;
        if let Some(error) = response.get("error") {
            return Err(Error::Protocol(format!("tools/list failed: {}", error)));
        }
        Ok(response
            .get("result")
            .and_then(|r| r.get("tools"))
            .cloned()
            .unwrap_or_else(|| json!([])))
    }

    /// Call a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let response = self
            .send("tools/call", Some(json!({"name": name, "arguments": arguments})))
            .await?;
        if let Some(error) = response.get("error") {
            return Err(Error::Protocol(format!("tools/call failed: {}", error)));
        }
        Ok(response.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    /// Close the bridge: stop the reader and cancel every pending request.
    /// Waiters observe [`Error::BridgeClosed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }

        self.pending.clear();
        debug!("[{}] Closed stdio bridge", self.name);
    }
}

async fn write_frame(
    sink: &mut (dyn AsyncWrite + Send + Unpin),
    message: &Value,
) -> Result<()> {
    let frame = serde_json::to_vec(message)?;
    sink.write_all(&frame).await?;
    sink.write_all(b"\n").await?;
    sink.flush().await?;
    Ok(())
}

async fn read_loop(
    name: String,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[{}] Reader cancelled", name);
                break;
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let message: Value = match serde_json::from_str(trimmed) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("[{}] Invalid JSON from server: {}", name, e);
                            continue;
                        },
                    };

                    match message.get("id").and_then(Value::as_u64) {
                        Some(id) => match pending.remove(&id) {
                            Some((_, tx)) => {
                                let _ = tx.send(message);
                            },
                            None => {
                                debug!("[{}] Dropping response with unknown id {}", name, id);
                            },
                        },
                        None => {
                            debug!("[{}] Dropping notification or id-less message", name);
                        },
                    }
                },
                Ok(None) => {
                    if !cancel.is_cancelled() {
                        warn!("[{}] EOF on stdout, process may have died", name);
                    }
                    break;
                },
                Err(e) => {
                    error!("[{}] Reader error: {}", name, e);
                    break;
                },
            },
        }
    }

    // No more responses can arrive; waiters observe BridgeClosed instead of
    // hanging out their full timeout
    pending.clear();
}
