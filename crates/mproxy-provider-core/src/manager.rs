use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::{Auth, AuthStatus};
use crate::errors::{ExecutorError, ExecutorResult};

/// Consecutive refresh failures before an auth is disabled outright.
const DISABLE_AFTER_FAILURES: u32 = 3;

/// Picks one auth out of the eligible candidates for a request.
///
/// Must be side-effect-free beyond advancing internal cursors; the manager may
/// call it concurrently.
pub trait AuthSelector: Send + Sync {
    fn pick(&self, candidates: &[Auth], provider: &str, model: &str) -> Option<String>;
}

/// Default selector: rotates over the candidate list in registration order.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl AuthSelector for RoundRobinSelector {
    fn pick(&self, candidates: &[Auth], _provider: &str, _model: &str) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[idx].id.clone())
    }
}

/// In-memory authority over auth records. The file store only seeds and
/// persists; every runtime read goes through here.
pub struct AuthManager {
    auths: RwLock<HashMap<String, Auth>>,
    /// Registration order, for stable iteration under the round-robin cursor.
    order: RwLock<Vec<String>>,
    selector: Box<dyn AuthSelector>,
    refresh_failures: RwLock<HashMap<String, u32>>,
}

impl AuthManager {
    pub fn new(selector: Box<dyn AuthSelector>) -> Self {
        Self {
            auths: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            selector,
            refresh_failures: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_round_robin() -> Self {
        Self::new(Box::new(RoundRobinSelector::default()))
    }

    /// Stores (or replaces) an auth record and returns its id.
    pub async fn register(&self, auth: Auth) -> ExecutorResult<String> {
        if auth.id.trim().is_empty() {
            return Err(ExecutorError::InvalidConfig("auth id must not be empty".to_string()));
        }
        let id = auth.id.clone();
        let mut auths = self.auths.write().await;
        if auths.insert(id.clone(), auth).is_none() {
            self.order.write().await.push(id.clone());
        }
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<Auth> {
        self.auths.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Auth> {
        let auths = self.auths.read().await;
        let order = self.order.read().await;
        order.iter().filter_map(|id| auths.get(id).cloned()).collect()
    }

    pub async fn auths_for_provider(&self, provider: &str) -> Vec<Auth> {
        self.list()
            .await
            .into_iter()
            .filter(|auth| auth.provider.eq_ignore_ascii_case(provider))
            .collect()
    }

    /// Replaces the stored record wholesale (attribute updates land atomically).
    pub async fn update(&self, auth: Auth) {
        let mut auths = self.auths.write().await;
        if !auths.contains_key(&auth.id) {
            self.order.write().await.push(auth.id.clone());
        }
        auths.insert(auth.id.clone(), auth);
    }

    /// Selects one eligible auth for `(provider, model)` via the selector.
    ///
    /// Cooldowns whose deadline has passed are promoted back to active as a
    /// side effect, so expiry needs no background sweep.
    pub async fn select_for(&self, provider: &str, model: &str) -> ExecutorResult<Auth> {
        let now = SystemTime::now();
        self.expire_cooldowns(now).await;

        let candidates: Vec<Auth> = self
            .auths_for_provider(provider)
            .await
            .into_iter()
            .filter(|auth| auth.eligible_at(now))
            .collect();

        let chosen = self
            .selector
            .pick(&candidates, provider, model)
            .ok_or_else(|| ExecutorError::NoEligibleAuth {
                provider: provider.to_string(),
            })?;
        candidates
            .into_iter()
            .find(|auth| auth.id == chosen)
            .ok_or_else(|| ExecutorError::NoEligibleAuth {
                provider: provider.to_string(),
            })
    }

    pub async fn mark_cooldown(&self, id: &str, until: SystemTime) {
        let mut auths = self.auths.write().await;
        if let Some(auth) = auths.get_mut(id) {
            auth.status = AuthStatus::Cooldown;
            auth.cooldown_until = Some(until);
            debug!(auth_id = %id, "auth placed in cooldown");
        }
    }

    /// Records a refresh outcome. Failures do not evict; only a run of
    /// consecutive failures disables the record.
    pub async fn mark_refresh_result(&self, id: &str, ok: bool) {
        let mut failures = self.refresh_failures.write().await;
        if ok {
            failures.remove(id);
            let mut auths = self.auths.write().await;
            if let Some(auth) = auths.get_mut(id) {
                if auth.status == AuthStatus::Disabled {
                    auth.status = AuthStatus::Active;
                }
            }
            return;
        }
        let count = failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count >= DISABLE_AFTER_FAILURES {
            let mut auths = self.auths.write().await;
            if let Some(auth) = auths.get_mut(id) {
                auth.status = AuthStatus::Disabled;
                warn!(auth_id = %id, failures = *count, "auth disabled after repeated refresh failures");
            }
        }
    }

    async fn expire_cooldowns(&self, now: SystemTime) {
        let mut auths = self.auths.write().await;
        for auth in auths.values_mut() {
            if auth.status == AuthStatus::Cooldown
                && auth.cooldown_until.map(|until| until <= now).unwrap_or(true)
            {
                auth.status = AuthStatus::Active;
                auth.cooldown_until = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn auth(id: &str, provider: &str) -> Auth {
        Auth::new(id, provider)
    }

    #[tokio::test]
    async fn round_robin_rotates_over_active_auths() {
        let mgr = AuthManager::with_round_robin();
        mgr.register(auth("a", "codex")).await.unwrap();
        mgr.register(auth("b", "codex")).await.unwrap();

        let first = mgr.select_for("codex", "gpt-5").await.unwrap().id;
        let second = mgr.select_for("codex", "gpt-5").await.unwrap().id;
        let third = mgr.select_for("codex", "gpt-5").await.unwrap().id;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn selection_without_candidates_reports_no_eligible_auth() {
        let mgr = AuthManager::with_round_robin();
        mgr.register(auth("a", "codex")).await.unwrap();
        let err = mgr.select_for("gemini", "gemini-pro").await.unwrap_err();
        assert!(matches!(err, ExecutorError::NoEligibleAuth { .. }));
    }

    #[tokio::test]
    async fn cooldown_skips_until_expiry() {
        let mgr = AuthManager::with_round_robin();
        mgr.register(auth("a", "codex")).await.unwrap();
        mgr.register(auth("b", "codex")).await.unwrap();

        mgr.mark_cooldown("a", SystemTime::now() + Duration::from_secs(60))
            .await;
        for _ in 0..4 {
            let picked = mgr.select_for("codex", "gpt-5").await.unwrap();
            assert_eq!(picked.id, "b");
        }

        // An already-expired cooldown is promoted back at the next selection.
        mgr.mark_cooldown("a", SystemTime::now() - Duration::from_secs(1))
            .await;
        let ids: Vec<String> = {
            let mut seen = Vec::new();
            for _ in 0..4 {
                seen.push(mgr.select_for("codex", "gpt-5").await.unwrap().id);
            }
            seen
        };
        assert!(ids.iter().any(|id| id == "a"));
    }

    #[tokio::test]
    async fn repeated_refresh_failures_disable_the_record() {
        let mgr = AuthManager::with_round_robin();
        mgr.register(auth("a", "copilot")).await.unwrap();

        mgr.mark_refresh_result("a", false).await;
        mgr.mark_refresh_result("a", false).await;
        assert_eq!(mgr.get("a").await.unwrap().status, AuthStatus::Active);

        mgr.mark_refresh_result("a", false).await;
        assert_eq!(mgr.get("a").await.unwrap().status, AuthStatus::Disabled);

        // A later success restores the record.
        mgr.mark_refresh_result("a", true).await;
        assert_eq!(mgr.get("a").await.unwrap().status, AuthStatus::Active);
    }
}
