use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Prefix used by the chutes provider for its always-visible model aliases.
pub const CHUTES_MODEL_PREFIX: &str = "chutes-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            owned_by: None,
            created: None,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owned_by = Some(owner.into());
        self
    }
}

/// Observer notified synchronously after successful registry mutations.
///
/// Hooks run outside the registry's write lock and may themselves call back
/// into the registry.
pub trait ModelRegistryHook: Send + Sync {
    fn on_models_registered(&self, provider: &str, client_id: &str, models: &[ModelInfo]);
    fn on_models_unregistered(&self, provider: &str, client_id: &str);
}

#[derive(Clone)]
struct ClientEntry {
    provider: String,
    models: Vec<ModelInfo>,
}

/// Concurrent clientID → advertised-models map.
#[derive(Default)]
pub struct ModelRegistry {
    entries: RwLock<HashMap<String, ClientEntry>>,
    hooks: RwLock<Vec<Arc<dyn ModelRegistryHook>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replaces the entry for `client_id`, then notifies hooks in
    /// registration order.
    pub fn register_client(&self, client_id: &str, provider: &str, models: Vec<ModelInfo>) {
        {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            entries.insert(
                client_id.to_string(),
                ClientEntry {
                    provider: provider.to_string(),
                    models: models.clone(),
                },
            );
        }
        for hook in self.hooks_snapshot() {
            hook.on_models_registered(provider, client_id, &models);
        }
    }

    pub fn unregister_client(&self, client_id: &str) {
        let removed = {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            entries.remove(client_id)
        };
        // Nothing was registered; there is no provider to report.
        let Some(entry) = removed else { return };
        for hook in self.hooks_snapshot() {
            hook.on_models_unregistered(&entry.provider, client_id);
        }
    }

    /// Snapshot copy; later registry mutations are not observable through it.
    pub fn get_models_for_client(&self, client_id: &str) -> Vec<ModelInfo> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(client_id)
            .map(|entry| entry.models.clone())
            .unwrap_or_default()
    }

    pub fn provider_for_client(&self, client_id: &str) -> Option<String> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(client_id)
            .map(|entry| entry.provider.clone())
    }

    /// All `(client_id, provider)` pairs currently advertising `model`.
    pub fn clients_for_model(&self, model: &str) -> Vec<(String, String)> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut out: Vec<(String, String)> = entries
            .iter()
            .filter(|(_, entry)| entry.models.iter().any(|m| m.id == model))
            .map(|(client_id, entry)| (client_id.clone(), entry.provider.clone()))
            .collect();
        out.sort();
        out
    }

    /// Full snapshot as `(client_id, provider, models)` rows.
    pub fn snapshot(&self) -> Vec<(String, String, Vec<ModelInfo>)> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut rows: Vec<(String, String, Vec<ModelInfo>)> = entries
            .iter()
            .map(|(client_id, entry)| {
                (client_id.clone(), entry.provider.clone(), entry.models.clone())
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Deduplicated model list across all clients, first advertisement wins.
    pub fn all_models(&self) -> Vec<ModelInfo> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (_, _, models) in self.snapshot() {
            for model in models {
                if seen.insert(model.id.clone()) {
                    out.push(model);
                }
            }
        }
        out
    }

    /// Idempotent: the same hook instance is only added once.
    pub fn add_hook(&self, hook: Arc<dyn ModelRegistryHook>) {
        let mut hooks = self.hooks.write().expect("registry lock poisoned");
        if hooks.iter().any(|existing| Arc::ptr_eq(existing, &hook)) {
            return;
        }
        hooks.push(hook);
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn ModelRegistryHook>> {
        self.hooks.read().expect("registry lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHook {
        events: Mutex<Vec<String>>,
    }

    impl ModelRegistryHook for RecordingHook {
        fn on_models_registered(&self, provider: &str, client_id: &str, models: &[ModelInfo]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("reg:{provider}:{client_id}:{}", models.len()));
        }

        fn on_models_unregistered(&self, provider: &str, client_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("unreg:{provider}:{client_id}"));
        }
    }

    #[test]
    fn register_replaces_and_notifies() {
        let reg = ModelRegistry::new();
        let hook = Arc::new(RecordingHook::default());
        reg.add_hook(hook.clone());
        reg.add_hook(hook.clone()); // idempotent

        reg.register_client("c1", "openai", vec![ModelInfo::new("gpt-4o")]);
        reg.register_client(
            "c1",
            "openai",
            vec![ModelInfo::new("gpt-4o"), ModelInfo::new("gpt-4o-mini")],
        );
        assert_eq!(reg.get_models_for_client("c1").len(), 2);

        reg.unregister_client("c1");
        assert!(reg.get_models_for_client("c1").is_empty());

        let events = hook.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["reg:openai:c1:1", "reg:openai:c1:2", "unreg:openai:c1"]
        );
    }

    #[test]
    fn unregister_of_unknown_client_is_silent() {
        let reg = ModelRegistry::new();
        let hook = Arc::new(RecordingHook::default());
        reg.add_hook(hook.clone());
        reg.unregister_client("ghost");
        assert!(hook.events.lock().unwrap().is_empty());
    }

    #[test]
    fn returned_models_are_a_snapshot() {
        let reg = ModelRegistry::new();
        reg.register_client("c1", "openai", vec![ModelInfo::new("gpt-4o")]);
        let mut snapshot = reg.get_models_for_client("c1");
        snapshot.push(ModelInfo::new("injected"));
        assert_eq!(reg.get_models_for_client("c1").len(), 1);
    }

    #[test]
    fn clients_for_model_spans_providers() {
        let reg = ModelRegistry::new();
        reg.register_client("openai-1", "openai", vec![ModelInfo::new("gpt-4o")]);
        reg.register_client(
            "chutes-1",
            "chutes",
            vec![ModelInfo::new("gpt-4o"), ModelInfo::new("chutes-gpt-4o")],
        );
        let clients = reg.clients_for_model("gpt-4o");
        assert_eq!(
            clients,
            vec![
                ("chutes-1".to_string(), "chutes".to_string()),
                ("openai-1".to_string(), "openai".to_string()),
            ]
        );
    }
}
