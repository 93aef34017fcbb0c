//! Service wiring: auth manager + model registry + executors + file store,
//! plus the background refresh loop and the chutes fallback filter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use mproxy_common::Config;
use mproxy_provider_core::{
    Auth, AuthManager, ExecContext, ExecutorError, ExecutorResult, ModelRegistry,
    ProviderExecutor, ATTR_EXPIRES_AT, ATTR_PRIORITY, CHUTES_MODEL_PREFIX, PRIORITY_FALLBACK,
};
use mproxy_providers::FileAuthStore;

use crate::chutes_priority::{ChutesPriorityHook, DEFAULT_DEBOUNCE};

/// Refresh auths whose expiry falls within this window.
const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);
const REFRESH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Service {
    config: ArcSwap<Config>,
    pub manager: Arc<AuthManager>,
    pub registry: Arc<ModelRegistry>,
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
    store: Option<FileAuthStore>,
}

impl Service {
    pub fn new(config: Config, store: Option<FileAuthStore>) -> Arc<Self> {
        let executors = mproxy_providers::default_executors()
            .into_iter()
            .map(|executor| (executor.identifier().to_string(), executor))
            .collect();
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            manager: Arc::new(AuthManager::with_round_robin()),
            registry: Arc::new(ModelRegistry::new()),
            executors,
            store,
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn update_config(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    pub fn executor_for(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(provider).cloned()
    }

    /// Installs the fallback-priority hook on the registry. The hook holds a
    /// weak reference so the service can still be dropped.
    pub fn install_priority_hook(self: &Arc<Self>, debounce: Option<Duration>) {
        let hook = ChutesPriorityHook::new(
            Arc::downgrade(self),
            debounce.unwrap_or(DEFAULT_DEBOUNCE),
        );
        self.registry.add_hook(Arc::new(hook));
    }

    /// Registers an auth and advertises its executor's model catalog.
    pub async fn register_auth(&self, auth: Auth) -> ExecutorResult<()> {
        let Some(executor) = self.executor_for(&auth.provider) else {
            return Err(ExecutorError::InvalidConfig(format!(
                "unknown provider {:?} for auth {}",
                auth.provider, auth.id
            )));
        };
        let models = executor.default_models(&auth);
        let id = self.manager.register(auth.clone()).await?;
        if !models.is_empty() {
            self.registry.register_client(&id, &auth.provider, models);
        }
        Ok(())
    }

    pub async fn unregister_auth(&self, id: &str) {
        self.registry.unregister_client(id);
    }

    /// Seeds the manager (and registry) from the file store.
    pub async fn load_auths_from_store(&self) -> std::io::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let auths = store.list()?;
        let mut loaded = 0;
        for auth in auths {
            match self.register_auth(auth.clone()).await {
                Ok(()) => loaded += 1,
                Err(err) => warn!(auth_id = %auth.id, error = %err, "skipping auth record"),
            }
        }
        info!(count = loaded, "seeded auth records from store");
        Ok(loaded)
    }

    /// Provider-specific refresh for one auth; the manager's record is
    /// replaced atomically and the store is updated on success.
    pub async fn refresh_auth(&self, id: &str) -> ExecutorResult<Auth> {
        let auth = self
            .manager
            .get(id)
            .await
            .ok_or_else(|| ExecutorError::InvalidConfig(format!("unknown auth {id}")))?;
        let executor = self.executor_for(&auth.provider).ok_or_else(|| {
            ExecutorError::InvalidConfig(format!("unknown provider {:?}", auth.provider))
        })?;
        let ctx = ExecContext::new(self.config());
        match executor.refresh(&ctx, &auth).await {
            Ok(refreshed) => {
                self.manager.update(refreshed.clone()).await;
                self.manager.mark_refresh_result(id, true).await;
                if let Some(store) = &self.store {
                    if let Err(err) = store.save(&refreshed) {
                        warn!(auth_id = %id, error = %err, "persisting refreshed auth failed");
                    }
                }
                Ok(refreshed)
            }
            Err(err) => {
                self.manager.mark_refresh_result(id, false).await;
                Err(err)
            }
        }
    }

    /// Background loop refreshing auths that are about to expire.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for auth in service.manager.list().await {
                    if !expires_within(&auth, REFRESH_WINDOW) {
                        continue;
                    }
                    debug!(auth_id = %auth.id, "refreshing expiring auth");
                    if let Err(err) = service.refresh_auth(&auth.id).await {
                        warn!(auth_id = %auth.id, error = %err, "auth refresh failed");
                    }
                }
            }
        })
    }

    /// Hides chutes advertisements of bare model IDs that some non-chutes
    /// provider also advertises; prefixed `chutes-` aliases always survive.
    pub async fn apply_chutes_model_priority(&self) {
        let snapshot = self.registry.snapshot();
        let mut covered: HashSet<String> = HashSet::new();
        for (_, provider, models) in &snapshot {
            if provider.eq_ignore_ascii_case("chutes") {
                continue;
            }
            for model in models {
                covered.insert(model.id.clone());
            }
        }

        for auth in self.manager.auths_for_provider("chutes").await {
            if auth.attr(ATTR_PRIORITY) != Some(PRIORITY_FALLBACK) {
                continue;
            }
            let current = self.registry.get_models_for_client(&auth.id);
            if current.is_empty() {
                continue;
            }
            let filtered: Vec<_> = current
                .into_iter()
                .filter(|model| {
                    model.id.starts_with(CHUTES_MODEL_PREFIX) || !covered.contains(&model.id)
                })
                .collect();
            debug!(auth_id = %auth.id, kept = filtered.len(), "applied chutes model priority");
            self.registry
                .register_client(&auth.id, &auth.provider, filtered);
        }
    }
}

fn expires_within(auth: &Auth, window: Duration) -> bool {
    let Some(stamp) = auth.attr(ATTR_EXPIRES_AT) else {
        return false;
    };
    let Ok(expires_at) =
        time::OffsetDateTime::parse(stamp, &time::format_description::well_known::Rfc3339)
    else {
        return false;
    };
    let deadline = time::OffsetDateTime::now_utc() + window;
    expires_at <= deadline
}
