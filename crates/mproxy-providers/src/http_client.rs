//! Outbound HTTP client cache.
//!
//! Clients are memoized per effective proxy URL (`""` meaning "no proxy,
//! default transport") so upstream connections are reused across requests.
//! Cached clients carry no whole-request timeout; non-streaming callers apply
//! a per-request timeout instead, because a client-level timeout would also
//! clamp long-lived streaming bodies.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use mproxy_common::Config;
use mproxy_provider_core::{Auth, ExecutorError, ExecutorResult};

use crate::no_proxy::{host_of, no_proxy_patterns, should_bypass_proxy};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static CLIENT_CACHE: OnceLock<RwLock<HashMap<String, wreq::Client>>> = OnceLock::new();

fn cache() -> &'static RwLock<HashMap<String, wreq::Client>> {
    CLIENT_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Resolves the proxy URL that applies to a request for `service` targeting
/// `host`, in priority order: per-auth proxy, then the global proxy when the
/// service allowlist admits it. NO_PROXY patterns force a direct connection
/// either way.
pub fn effective_proxy(
    cfg: &Config,
    auth: Option<&Auth>,
    service: &str,
    host: Option<&str>,
) -> Option<String> {
    let candidate = auth
        .map(|auth| auth.proxy_url.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            cfg.proxy_url
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter(|_| cfg.proxy_enabled_for(service))
                .map(str::to_string)
        })?;

    if let Some(host) = host {
        if should_bypass_proxy(host, &no_proxy_patterns()) {
            return None;
        }
    }
    Some(candidate)
}

/// Returns the shared client for the request. `override_client` (the
/// request-context transport) wins over everything configured and is never
/// cached, since it may be request-specific.
pub fn client_for(
    cfg: &Config,
    auth: Option<&Auth>,
    service: &str,
    url: &str,
    override_client: Option<wreq::Client>,
) -> ExecutorResult<wreq::Client> {
    let host = host_of(url);
    let proxy = effective_proxy(cfg, auth, service, host.as_deref());
    if proxy.is_none() {
        if let Some(client) = override_client {
            return Ok(client);
        }
    }
    client_for_proxy(proxy.as_deref())
}

fn client_for_proxy(proxy: Option<&str>) -> ExecutorResult<wreq::Client> {
    let key = proxy.unwrap_or_default().to_string();
    {
        let guard = cache()
            .read()
            .map_err(|_| ExecutorError::other("http client cache lock failed"))?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
    }

    let client = build_client(proxy)?;
    let mut guard = cache()
        .write()
        .map_err(|_| ExecutorError::other("http client cache lock failed"))?;
    // A racing insert may have won; keep the first client so every caller
    // shares one transport per key.
    Ok(guard.entry(key).or_insert(client).clone())
}

fn build_client(proxy: Option<&str>) -> ExecutorResult<wreq::Client> {
    let mut builder = wreq::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(proxy_url) = proxy {
        let proxy = wreq::Proxy::all(proxy_url)
            .map_err(|err| ExecutorError::InvalidConfig(format!("proxy url: {err}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| ExecutorError::other(format!("build http client: {err}")))
}

#[cfg(test)]
pub(crate) fn cached_proxy_keys() -> Vec<String> {
    cache()
        .read()
        .map(|guard| guard.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn cfg_with_proxy(proxy: &str, services: &[&str]) -> Config {
        Config {
            proxy_url: Some(proxy.to_string()),
            proxy_services: services.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    #[test]
    fn auth_proxy_wins_over_config_proxy() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::remove_var("NO_PROXY");
        std::env::remove_var("no_proxy");

        let cfg = cfg_with_proxy("http://global.example:3128", &[]);
        let mut auth = Auth::new("a", "codex");
        auth.proxy_url = "socks5://per-auth.example:1080".to_string();
        assert_eq!(
            effective_proxy(&cfg, Some(&auth), "codex", Some("api.openai.com")).as_deref(),
            Some("socks5://per-auth.example:1080")
        );
    }

    #[test]
    fn allowlist_gates_the_config_proxy() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::remove_var("NO_PROXY");
        std::env::remove_var("no_proxy");

        let cfg = cfg_with_proxy("http://global.example:3128", &["copilot"]);
        assert_eq!(
            effective_proxy(&cfg, None, "copilot", Some("api.githubcopilot.com")).as_deref(),
            Some("http://global.example:3128")
        );
        assert_eq!(effective_proxy(&cfg, None, "gemini", None), None);
    }

    #[test]
    fn no_proxy_forces_direct_connection() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("NO_PROXY", "internal.example");

        let cfg = cfg_with_proxy("http://global.example:3128", &[]);
        assert_eq!(
            effective_proxy(&cfg, None, "codex", Some("svc.internal.example")),
            None
        );
        assert_eq!(
            effective_proxy(&cfg, None, "codex", Some("api.openai.com")).as_deref(),
            Some("http://global.example:3128")
        );

        std::env::remove_var("NO_PROXY");
    }

    #[test]
    fn same_key_reuses_one_client() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::remove_var("NO_PROXY");
        std::env::remove_var("no_proxy");

        let cfg = Config::default();
        let first = client_for(&cfg, None, "codex", "https://api.openai.com/v1", None).unwrap();
        let second = client_for(&cfg, None, "codex", "https://api.openai.com/v1", None).unwrap();
        // wreq clients are handles around a shared inner transport; cloning
        // the cached entry means both calls observe the same one.
        drop((first, second));
        let keys = cached_proxy_keys();
        assert_eq!(keys.iter().filter(|key| key.is_empty()).count(), 1);
    }

    #[test]
    fn override_client_is_used_and_never_cached() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::remove_var("NO_PROXY");
        std::env::remove_var("no_proxy");

        let cfg = Config::default();
        let custom = wreq::Client::builder().build().unwrap();
        let before = cached_proxy_keys().len();
        let _ = client_for(
            &cfg,
            None,
            "codex",
            "https://api.openai.com/v1",
            Some(custom),
        )
        .unwrap();
        assert_eq!(cached_proxy_keys().len(), before);
    }
}
