//! Inbound API-key authentication.

use axum::http::HeaderMap;

use mproxy_common::{api_key_digest, Config};
use tracing::debug;

/// Checks the inbound bearer (or `x-api-key`) against the configured list.
/// An empty key list leaves the surface open, for local single-user runs.
pub fn authorize(config: &Config, headers: &HeaderMap) -> Result<(), ()> {
    if config.api_keys.is_empty() {
        return Ok(());
    }
    let candidate = bearer_token(headers).or_else(|| header_value(headers, "x-api-key"));
    match candidate {
        Some(key) if config.accepts_api_key(key) => {
            debug!(key = %api_key_digest(key), "api key accepted");
            Ok(())
        }
        _ => Err(()),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = header_value(headers, "authorization")?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with_keys(keys: &[&str]) -> Config {
        Config {
            api_keys: keys.iter().map(|key| key.to_string()).collect(),
            ..Config::default()
        }
    }

    #[test]
    fn empty_key_list_is_open() {
        assert!(authorize(&Config::default(), &HeaderMap::new()).is_ok());
    }

    #[test]
    fn bearer_and_x_api_key_are_accepted() {
        let config = config_with_keys(&["sk-1"]);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-1"));
        assert!(authorize(&config, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-1"));
        assert!(authorize(&config, &headers).is_ok());
    }

    #[test]
    fn wrong_or_missing_keys_are_rejected() {
        let config = config_with_keys(&["sk-1"]);
        assert!(authorize(&config, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert!(authorize(&config, &headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic sk-1"));
        assert!(authorize(&config, &headers).is_err());
    }
}
