//! Async client for a local Ollama-compatible LLM daemon.
//!
//! Used by the enhancement service for prompt rewriting. Connection and
//! timeout failures are retried with linear backoff; a missing model is
//! surfaced immediately.

use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for the LLM daemon client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    /// Per-attempt request timeout
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// A model known to the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Response from the generate endpoint. Durations are in nanoseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    pub model: String,
    pub response: String,
    #[serde(default = "default_done")]
    pub done: bool,
    pub total_duration: Option<u64>,
    pub load_duration: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<u64>,
}

fn default_done() -> bool {
    true
}

impl GenerateResponse {
    /// Tokens per second, when the daemon reported eval timing.
    pub fn tokens_per_second(&self) -> Option<f64> {
        match (self.eval_count, self.eval_duration) {
            (Some(count), Some(duration)) if duration > 0 => {
                Some(count as f64 / (duration as f64 / 1e9))
            },
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct GeneratePayload<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    #[serde(rename = "num_predict", skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Client for the LLM daemon HTTP API.
///
/// The underlying HTTP client is created lazily on first use and reused
/// until [`close`](Self::close).
pub struct LlmClient {
    config: LlmConfig,
    client: Mutex<Option<HttpClient>>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    async fn http(&self) -> Result<HttpClient> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(self.config.timeout)
            .build()
            .map_err(|e| Error::Llm(format!("Failed to build HTTP client: {}", e)))?;

        *guard = Some(client.clone());
        Ok(client)
    }

    /// Release the underlying HTTP client.
    pub async fn close(&self) {
        *self.client.lock().await = None;
    }

    /// Whether the daemon is up and answering. Never errors.
    pub async fn is_healthy(&self) -> bool {
        let Ok(client) = self.http().await else {
            return false;
        };

        match client
            .get(format!("{}/api/tags", self.config.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// List the models the daemon has available.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let client = self.http().await?;
        let response = client
            .get(format!("{}/api/tags", self.config.base_url))
            .send()
            .await
            .map_err(classify_request_error)?;

        let response = response.error_for_status().map_err(|e| Error::Llm(e.to_string()))?;
        let tags: TagsResponse = response.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        Ok(tags.models)
    }

    /// Whether a specific model is available.
    pub async fn has_model(&self, model: &str) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|m| m.name == model),
            Err(_) => false,
        }
    }

    /// Generate a completion, retrying connection and timeout failures with
    /// linear backoff. A missing model is never retried.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<GenerateResponse> {
        let payload = GeneratePayload {
            model,
            prompt,
            stream: false,
            system,
            options: GenerateOptions {
                temperature,
                num_predict: max_tokens,
            },
        };

        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            match self.try_generate(model, &payload).await {
                Ok(response) => return Ok(response),
                Err(e @ (Error::LlmConnection(_) | Error::LlmTimeout(_))) => {
                    warn!(
                        "LLM request failed (attempt {}): {}",
                        attempt + 1,
                        e
                    );
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }

            if attempt < self.config.max_retries {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Llm("Unknown error".to_string())))
    }

    async fn try_generate(
        &self,
        model: &str,
        payload: &GeneratePayload<'_>,
    ) -> Result<GenerateResponse> {
        let client = self.http().await?;
        let response = client
            .post(format!("{}/api/generate", self.config.base_url))
            .json(payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::LlmModelMissing(model.to_string()));
        }

        let response = response.error_for_status().map_err(|e| Error::Llm(e.to_string()))?;
        let generated: GenerateResponse =
            response.json().await.map_err(|e| Error::Llm(e.to_string()))?;

        debug!(
            model = %generated.model,
            tokens_per_second = ?generated.tokens_per_second(),
            "LLM generation complete"
        );
        Ok(generated)
    }
}

fn classify_request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::LlmTimeout(e.to_string())
    } else if e.is_connect() {
        Error::LlmConnection(e.to_string())
    } else {
        Error::Llm(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn health_and_model_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3.2:3b"}, {"name": "mistral:7b"}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(fast_config(server.uri()));
        assert!(client.is_healthy().await);

        let models = client.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert!(client.has_model("llama3.2:3b").await);
        assert!(!client.has_model("gpt-x").await);
    }

    #[tokio::test]
    async fn health_is_false_when_unreachable() {
        let client = LlmClient::new(fast_config("http://127.0.0.1:1".to_string()));
        assert!(!client.is_healthy().await);
    }

    #[tokio::test]
    async fn generate_returns_text_and_timing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama3.2:3b",
                "response": "Enhanced prompt text",
                "done": true,
                "eval_count": 50,
                "eval_duration": 1_000_000_000u64,
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(fast_config(server.uri()));
        let response = client
            .generate("llama3.2:3b", "hello", Some("be concise"), 0.3, Some(500))
            .await
            .unwrap();

        assert_eq!(response.response, "Enhanced prompt text");
        assert_eq!(response.tokens_per_second(), Some(50.0));
    }

    #[tokio::test]
    async fn missing_model_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(fast_config(server.uri()));
        let err = client
            .generate("missing-model", "hello", None, 0.7, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::LlmModelMissing(_)));
    }

    #[tokio::test]
    async fn connection_failure_retried_then_surfaced() {
        // Nothing listens on this port; every attempt is a connect error
        let client = LlmClient::new(fast_config("http://127.0.0.1:1".to_string()));

        let err = client.generate("llama3.2:3b", "hello", None, 0.7, None).await.unwrap_err();
        assert!(matches!(err, Error::LlmConnection(_)));
    }

    #[tokio::test]
    async fn server_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(fast_config(server.uri()));
        let err = client.generate("llama3.2:3b", "hello", None, 0.7, None).await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }
}
