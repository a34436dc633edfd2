//! Error types for the MCP router

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

use crate::resilience::CircuitState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Failed to start server {name}: {message}")]
    SpawnFailure { name: String, message: String },

    #[error("Bridge is closed")]
    BridgeClosed,

    #[error("Timed out waiting for response to {0}")]
    Timeout(String),

    #[error("Circuit breaker '{name}' is {state}")]
    CircuitOpen {
        name: String,
        state: CircuitState,
        retry_after: Option<f64>,
    },

    #[error("Cannot connect to LLM daemon: {0}")]
    LlmConnection(String),

    #[error("LLM request timed out: {0}")]
    LlmTimeout(String),

    #[error("Model '{0}' not found")]
    LlmModelMissing(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Machine-readable error kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ServerNotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::SpawnFailure { .. } => "spawn_failure",
            Error::BridgeClosed => "bridge_closed",
            Error::Timeout(_) => "timeout",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::LlmConnection(_) => "llm_connection",
            Error::LlmTimeout(_) => "llm_timeout",
            Error::LlmModelMissing(_) => "llm_model_missing",
            Error::Llm(_) => "llm_error",
            Error::Config(_) => "config_invalid",
            Error::Protocol(_) => "protocol_error",
            Error::Server(_) => "server_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LlmConnection(_) | Error::LlmTimeout(_) | Error::Timeout(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Error::ServerNotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::CircuitOpen { .. } => 503,
            Error::LlmConnection(_) => 503,
            Error::Timeout(_) => 504,
            Error::LlmTimeout(_) => 504,
            Error::LlmModelMissing(_) => 404,
            Error::BridgeClosed => 502,
            Error::Config(_) => 400,
            Error::Json(_) => 400,
            _ => 500,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });

        if let Error::CircuitOpen { retry_after, .. } = &self {
            error["retry_after"] = json!(retry_after);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}
