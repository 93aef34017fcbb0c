//! Registry hook applying chutes fallback priority with a debounce.
//!
//! Non-chutes registrations and unregistrations schedule a re-evaluation;
//! events inside the window coalesce into one run (single pending timer,
//! cancel-and-reschedule). Chutes registrations never trigger the hook: they
//! are the filter's target, not its input.

use std::sync::{Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use mproxy_provider_core::{ModelInfo, ModelRegistryHook};

use crate::service::Service;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

pub struct ChutesPriorityHook {
    service: Weak<Service>,
    debounce: Duration,
    runtime: tokio::runtime::Handle,
    pending: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChutesPriorityHook {
    /// Must be constructed inside a tokio runtime; the debounce timer runs on
    /// the captured handle.
    pub fn new(service: Weak<Service>, debounce: Duration) -> Self {
        Self {
            service,
            debounce,
            runtime: tokio::runtime::Handle::current(),
            pending: Mutex::new(None),
        }
    }

    fn schedule_reeval(&self) {
        let mut pending = self.pending.lock().expect("hook timer lock poisoned");
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let service = self.service.clone();
        let debounce = self.debounce;
        *pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(service) = service.upgrade() {
                service.apply_chutes_model_priority().await;
            }
        }));
        debug!("chutes priority: scheduled re-evaluation");
    }
}

impl ModelRegistryHook for ChutesPriorityHook {
    fn on_models_registered(&self, provider: &str, _client_id: &str, _models: &[ModelInfo]) {
        if provider.eq_ignore_ascii_case("chutes") {
            return;
        }
        self.schedule_reeval();
    }

    fn on_models_unregistered(&self, provider: &str, _client_id: &str) {
        // A removed provider may make chutes advertisements visible again.
        if provider.eq_ignore_ascii_case("chutes") {
            return;
        }
        self.schedule_reeval();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_common::Config;
    use mproxy_provider_core::{Auth, ATTR_PRIORITY, PRIORITY_FALLBACK};
    use std::sync::Arc;

    #[tokio::test]
    async fn debounced_hook_applies_filter_after_registrations() {
        let service = Service::new(Config::default(), None);
        service.install_priority_hook(Some(Duration::from_millis(20)));

        let chutes = Auth::new("chutes-1", "chutes").with_attr(ATTR_PRIORITY, PRIORITY_FALLBACK);
        service.manager.register(chutes).await.unwrap();
        service.registry.register_client(
            "chutes-1",
            "chutes",
            vec![ModelInfo::new("gpt-4o"), ModelInfo::new("chutes-gpt-4o")],
        );

        // A burst of non-chutes registrations coalesces into one re-eval.
        for i in 0..5 {
            service.registry.register_client(
                &format!("openai-{i}"),
                "openai",
                vec![ModelInfo::new("gpt-4o")],
            );
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        let after: Vec<String> = service
            .registry
            .get_models_for_client("chutes-1")
            .into_iter()
            .map(|model| model.id)
            .collect();
        assert_eq!(after, vec!["chutes-gpt-4o"]);
    }

    #[tokio::test]
    async fn chutes_registrations_do_not_schedule_reeval() {
        let service = Service::new(Config::default(), None);
        service.install_priority_hook(Some(Duration::from_millis(10)));

        // Only chutes traffic: the filter must never run, so a bare ID that
        // is also advertised by nobody else stays put.
        let chutes = Auth::new("chutes-1", "chutes").with_attr(ATTR_PRIORITY, PRIORITY_FALLBACK);
        service.manager.register(chutes).await.unwrap();
        service.registry.register_client(
            "chutes-1",
            "chutes",
            vec![ModelInfo::new("gpt-4o")],
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(service.registry.get_models_for_client("chutes-1").len(), 1);
    }
}
