//! Prompt enhancement service.
//!
//! Rewrites user prompts through a local LLM with an exact-match cache in
//! front and a circuit breaker around the daemon. Every failure path
//! degrades to returning the original prompt; enhancement is never allowed
//! to break a request.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{make_cache_key, Cache, MemoryCache};
use crate::error::Error;
use crate::llm::{LlmClient, LlmConfig};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

/// How to enhance prompts for a specific client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementRule {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
}

impl Default for EnhancementRule {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_model() -> String {
    "llama3.2:3b".to_string()
}

fn default_system_prompt() -> String {
    "Improve clarity and structure. Preserve intent. Return only the enhanced prompt.".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> Option<u32> {
    Some(500)
}

/// Result of a prompt enhancement operation. `enhanced == original` iff
/// enhancement was skipped or failed.
#[derive(Debug, Clone, Serialize)]
pub struct EnhancementResult {
    pub original: String,
    pub enhanced: String,
    pub model: Option<String>,
    pub cached: bool,
    pub enhanced_by_llm: bool,
    pub error: Option<String>,
}

impl EnhancementResult {
    fn unchanged(prompt: &str, error: Option<String>) -> Self {
        Self {
            original: prompt.to_string(),
            enhanced: prompt.to_string(),
            model: None,
            cached: false,
            enhanced_by_llm: false,
            error,
        }
    }

    pub fn was_enhanced(&self) -> bool {
        self.original != self.enhanced
    }
}

/// Construction settings for [`EnhancementService`].
pub struct EnhancementSettings {
    /// Path to the enhancement rules JSON file
    pub rules_path: Option<PathBuf>,
    pub llm: LlmConfig,
    pub breaker: CircuitBreakerConfig,
    pub cache_max_size: usize,
    pub cache_ttl: Duration,
}

impl Default for EnhancementSettings {
    fn default() -> Self {
        Self {
            rules_path: None,
            llm: LlmConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            cache_max_size: 500,
            cache_ttl: Duration::from_secs(7200),
        }
    }
}

/// Orchestrates resilient prompt enhancement: rules -> cache -> circuit
/// breaker -> LLM, caching successes and degrading to the original prompt
/// on any failure.
pub struct EnhancementService {
    rules_path: Option<PathBuf>,
    rules: RwLock<HashMap<String, EnhancementRule>>,
    llm: LlmClient,
    cache: Arc<dyn Cache<String>>,
    breaker: CircuitBreaker,
}

impl EnhancementService {
    pub fn new(settings: EnhancementSettings) -> Self {
        Self {
            rules_path: settings.rules_path,
            rules: RwLock::new(HashMap::new()),
            llm: LlmClient::new(settings.llm),
            cache: Arc::new(MemoryCache::new(
                settings.cache_max_size,
                settings.cache_ttl,
            )),
            breaker: CircuitBreaker::new("llm", settings.breaker),
        }
    }

    /// Load enhancement rules and probe LLM health.
    pub async fn initialize(&self) {
        match self.rules_path.clone() {
            Some(path) if path.exists() => self.load_rules(&path),
            _ => warn!("No enhancement rules file found, using defaults"),
        }

        if self.llm.is_healthy().await {
            info!("LLM daemon is healthy");
        } else {
            warn!("LLM daemon is not available, enhancement will be degraded");
        }
    }

    /// Rules file format: `{"default": {...}, "clients": {name: {...}}}`.
    /// Client rules are merged over the default; bad files are logged and
    /// leave the current rules in place.
    fn load_rules(&self, path: &Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to read enhancement rules: {}", e);
                return;
            },
        };

        let data: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                error!("Invalid JSON in enhancement rules: {}", e);
                return;
            },
        };

        let mut rules = HashMap::new();

        let default_rule: EnhancementRule = data
            .get("default")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let default_fields =
            serde_json::to_value(&default_rule).unwrap_or_else(|_| json!({}));
        rules.insert("default".to_string(), default_rule);

        if let Some(clients) = data.get("clients").and_then(|v| v.as_object()) {
            for (name, rule_value) in clients {
                let Some(overrides) = rule_value.as_object() else {
                    continue;
                };

                let mut merged = default_fields.as_object().cloned().unwrap_or_default();
                for (key, value) in overrides {
                    merged.insert(key.clone(), value.clone());
                }

                match serde_json::from_value::<EnhancementRule>(serde_json::Value::Object(merged))
                {
                    Ok(rule) => {
                        debug!("Loaded enhancement rule: {}", name);
                        rules.insert(name.clone(), rule);
                    },
                    Err(e) => error!("Invalid enhancement rule {}: {}", name, e),
                }
            }
        }

        info!("Loaded {} enhancement rules", rules.len());
        *self.rules.write() = rules;
    }

    /// The rule for a client, falling back to the default.
    pub fn get_rule(&self, client_name: Option<&str>) -> EnhancementRule {
        let rules = self.rules.read();
        if let Some(name) = client_name {
            if let Some(rule) = rules.get(name) {
                return rule.clone();
            }
        }
        rules.get("default").cloned().unwrap_or_default()
    }

    /// Enhance a prompt.
    ///
    /// Checks the client rule, the cache (unless bypassed), and the circuit
    /// breaker before calling the LLM. The result always carries the
    /// original prompt; on any failure `enhanced` equals `original` and
    /// `error` explains why.
    pub async fn enhance(
        &self,
        prompt: &str,
        client_name: Option<&str>,
        bypass_cache: bool,
    ) -> EnhancementResult {
        let rule = self.get_rule(client_name);

        if !rule.enabled {
            return EnhancementResult::unchanged(
                prompt,
                Some("Enhancement disabled for client".to_string()),
            );
        }

        let key = make_cache_key(prompt, client_name, Some(&rule.model));

        if !bypass_cache {
            if let Some(cached) = self.cache.get(&key).await {
                debug!("Cache hit for enhancement");
                return EnhancementResult {
                    original: prompt.to_string(),
                    enhanced: cached,
                    model: Some(rule.model),
                    cached: true,
                    enhanced_by_llm: false,
                    error: None,
                };
            }
        }

        if let Err(e) = self.breaker.check() {
            warn!("Circuit breaker open: {}", e);
            let message = match e {
                Error::CircuitOpen {
                    retry_after: Some(secs),
                    ..
                } => format!("LLM circuit breaker open, retry in {:.0}s", secs),
                _ => "LLM circuit breaker open".to_string(),
            };
            return EnhancementResult::unchanged(prompt, Some(message));
        }

        match self
            .llm
            .generate(
                &rule.model,
                prompt,
                Some(&rule.system_prompt),
                rule.temperature,
                rule.max_tokens,
            )
            .await
        {
            Ok(response) => {
                let enhanced = response.response.trim().to_string();
                self.breaker.record_success();
                self.cache.set(&key, enhanced.clone(), None).await;

                debug!("Enhanced prompt with {}", rule.model);
                EnhancementResult {
                    original: prompt.to_string(),
                    enhanced,
                    model: Some(rule.model),
                    cached: false,
                    enhanced_by_llm: true,
                    error: None,
                }
            },
            Err(e) => {
                self.breaker.record_failure();
                warn!("Prompt enhancement failed: {}", e);
                EnhancementResult::unchanged(prompt, Some(e.to_string()))
            },
        }
    }

    /// Cache, breaker, and LLM health in one payload.
    pub async fn get_stats(&self) -> serde_json::Value {
        json!({
            "cache": self.cache.stats().await,
            "circuit_breaker": self.breaker.stats(),
            "llm_healthy": self.llm.is_healthy().await,
        })
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
        info!("LLM circuit breaker reset");
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        info!("Enhancement cache cleared");
    }

    pub async fn close(&self) {
        self.llm.close().await;
    }
}
