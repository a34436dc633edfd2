//! Credential store collaborator for resolving keyring references at spawn
//! time. Resolved values are merged into the child environment and never
//! logged.

use std::collections::HashMap;
use tracing::{debug, error, warn};

use crate::registry::EnvValue;

/// External credential store. The OS keyring integration lives outside the
/// core; anything with `get(service, key)` can be injected.
pub trait CredentialStore: Send + Sync {
    fn get(&self, service: &str, key: &str) -> Option<String>;
}

/// Resolves nothing; keyring-referenced variables are omitted.
pub struct NullCredentials;

impl CredentialStore for NullCredentials {
    fn get(&self, _service: &str, _key: &str) -> Option<String> {
        None
    }
}

/// Development store reading `SERVICE_KEY`-style process environment
/// variables.
pub struct EnvCredentials;

impl CredentialStore for EnvCredentials {
    fn get(&self, service: &str, key: &str) -> Option<String> {
        let var = format!("{}_{}", service, key)
            .to_uppercase()
            .replace(['-', '.'], "_");
        std::env::var(var).ok()
    }
}

/// Resolve an env map, turning credential references into values through the
/// store.
///
/// Unresolved references are omitted so the child fails loudly on its own.
/// Keys starting with `_` are treated as config-file comments and skipped.
pub fn resolve_env(
    env: &HashMap<String, EnvValue>,
    store: &dyn CredentialStore,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    for (name, value) in env {
        if name.starts_with('_') {
            continue;
        }

        match value {
            EnvValue::Literal(literal) => {
                resolved.insert(name.clone(), literal.clone());
            },
            EnvValue::Credential {
                source,
                service,
                key,
            } => {
                if source != "keyring" {
                    warn!("Unknown credential source '{}' for {}", source, name);
                    continue;
                }

                match store.get(service, key) {
                    Some(secret) => {
                        debug!("Resolved credential for {}", name);
                        resolved.insert(name.clone(), secret);
                    },
                    None => {
                        error!(
                            "Failed to resolve credential {} (service={}, key={})",
                            name, service, key
                        );
                    },
                }
            },
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapCredentials(HashMap<(String, String), String>);

    impl CredentialStore for MapCredentials {
        fn get(&self, service: &str, key: &str) -> Option<String> {
            self.0.get(&(service.to_string(), key.to_string())).cloned()
        }
    }

    fn env_with_reference() -> HashMap<String, EnvValue> {
        HashMap::from([
            ("PLAIN".to_string(), EnvValue::Literal("value".to_string())),
            (
                "API_KEY".to_string(),
                EnvValue::Credential {
                    source: "keyring".to_string(),
                    service: "router".to_string(),
                    key: "api_key".to_string(),
                },
            ),
            (
                "_comment".to_string(),
                EnvValue::Literal("ignore me".to_string()),
            ),
        ])
    }

    #[test]
    fn resolves_references_and_skips_comments() {
        let store = MapCredentials(HashMap::from([(
            ("router".to_string(), "api_key".to_string()),
            "s3cret".to_string(),
        )]));

        let resolved = resolve_env(&env_with_reference(), &store);
        assert_eq!(resolved.get("PLAIN").map(String::as_str), Some("value"));
        assert_eq!(resolved.get("API_KEY").map(String::as_str), Some("s3cret"));
        assert!(!resolved.contains_key("_comment"));
    }

    #[test]
    fn unresolved_references_are_omitted() {
        let resolved = resolve_env(&env_with_reference(), &NullCredentials);
        assert_eq!(resolved.get("PLAIN").map(String::as_str), Some("value"));
        assert!(!resolved.contains_key("API_KEY"));
    }
}
