//! Plugin contract and registry.
//!
//! Action steps call `invoke(plugin, action, params)`. Plugin semantics are
//! entirely external; the runtime only stores the returned data verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Result of a plugin invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginResponse {
    pub data: Value,
    /// Free-form metadata; `tokens_used` is read for budget tracking
    pub metadata: Value,
}

impl PluginResponse {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            metadata: json!({}),
        }
    }

    pub fn with_metadata(data: Value, metadata: Value) -> Self {
        Self { data, metadata }
    }

    /// Tokens reported by the plugin, from `tokens_used` or `usage.total_tokens`.
    pub fn tokens_used(&self) -> Option<u64> {
        self.metadata
            .get("tokens_used")
            .and_then(Value::as_u64)
            .or_else(|| {
                self.metadata
                    .get("usage")
                    .and_then(|u| u.get("total_tokens"))
                    .and_then(Value::as_u64)
            })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("plugin '{plugin}' does not support action '{action}'")]
    UnsupportedAction { plugin: String, action: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

/// External plugin invoked by action steps.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name as used in compiled `action` steps.
    fn name(&self) -> &str;

    async fn invoke(&self, action: &str, params: &Value) -> Result<PluginResponse, PluginError>;

    /// Supported actions; empty means any.
    fn actions(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Registry of available plugins.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    fallback: Option<Arc<EchoPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that answers every plugin with an [`EchoPlugin`].
    pub fn dry_run(fixtures: HashMap<String, Value>) -> Self {
        Self {
            plugins: HashMap::new(),
            fallback: Some(Arc::new(EchoPlugin::with_fixtures(fixtures))),
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.plugins.contains_key(name) || self.fallback.is_some()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Invoke `plugin.action`.
    pub async fn invoke(
        &self,
        plugin: &str,
        action: &str,
        params: &Value,
    ) -> Result<PluginResponse, PluginError> {
        let Some(handler) = self.get(plugin) else {
            return match &self.fallback {
                Some(echo) => Ok(echo.respond(plugin, action, params)),
                None => Err(PluginError::UnknownPlugin(plugin.to_string())),
            };
        };

        let actions = handler.actions();
        if !actions.is_empty() && !actions.iter().any(|a| a == action) {
            return Err(PluginError::UnsupportedAction {
                plugin: plugin.to_string(),
                action: action.to_string(),
            });
        }

        handler.invoke(action, params).await
    }
}

/// Dry-run plugin.
///
/// Answers with fixture data keyed by `plugin.action` or `action`, or echoes
/// the call back with an empty `items` collection.
#[derive(Debug, Clone, Default)]
pub struct EchoPlugin {
    fixtures: HashMap<String, Value>,
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixtures(fixtures: HashMap<String, Value>) -> Self {
        Self { fixtures }
    }

    /// Answer a call addressed to `plugin`.
    pub fn respond(&self, plugin: &str, action: &str, params: &Value) -> PluginResponse {
        let fixture = self
            .fixtures
            .get(&format!("{}.{}", plugin, action))
            .or_else(|| self.fixtures.get(action));

        let data = match fixture {
            Some(data) => data.clone(),
            None => json!({
                "plugin": plugin,
                "action": action,
                "params": params,
                "items": [],
            }),
        };
        PluginResponse::with_metadata(data, json!({"dry_run": true, "tokens_used": 0}))
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, action: &str, params: &Value) -> Result<PluginResponse, PluginError> {
        Ok(self.respond("echo", action, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl Plugin for Fixed {
        fn name(&self) -> &str {
            "sheets"
        }

        async fn invoke(&self, _action: &str, _params: &Value) -> Result<PluginResponse, PluginError> {
            Ok(PluginResponse::new(json!({"values": [[1, 2]]})))
        }

        fn actions(&self) -> Vec<String> {
            vec!["read_range".to_string()]
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Fixed));

        let response = registry
            .invoke("sheets", "read_range", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.data["values"][0][1], 2);

        assert!(matches!(
            registry.invoke("sheets", "delete", &json!({})).await,
            Err(PluginError::UnsupportedAction { .. })
        ));
        assert!(matches!(
            registry.invoke("gmail", "send", &json!({})).await,
            Err(PluginError::UnknownPlugin(_))
        ));
    }

    #[tokio::test]
    async fn test_dry_run_uses_fixtures() {
        let mut fixtures = HashMap::new();
        fixtures.insert("gmail.search_emails".to_string(), json!({"emails": [{"id": 1}]}));
        let registry = PluginRegistry::dry_run(fixtures);

        let found = registry
            .invoke("gmail", "search_emails", &json!({}))
            .await
            .unwrap();
        assert_eq!(found.data, json!({"emails": [{"id": 1}]}));

        let echoed = registry
            .invoke("slack", "post", &json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(echoed.data["plugin"], "slack");
        assert_eq!(echoed.data["params"], json!({"text": "hi"}));
        assert_eq!(echoed.tokens_used(), Some(0));
    }

    #[test]
    fn test_tokens_used_from_usage_block() {
        let response = PluginResponse::with_metadata(
            json!(null),
            json!({"usage": {"total_tokens": 420}}),
        );
        assert_eq!(response.tokens_used(), Some(420));
    }
}
