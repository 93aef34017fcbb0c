//! File-backed auth store: one JSON file per auth record.
//!
//! The store only seeds and persists; the in-memory auth manager is
//! authoritative at runtime. Writes are atomic (temp file in the same
//! directory, flush+sync, rename; remove-then-rename where rename cannot
//! overwrite) so a file watcher never observes a partial record.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mproxy_provider_core::{Auth, AuthStatus};

/// Attribute keys holding short-lived bearer material; kept in memory only.
const NON_PERSISTED_ATTRS: &[&str] = &["copilot_token"];

/// On-disk shape. `type` names the provider, matching the per-provider token
/// files the login flows write.
#[derive(Debug, Serialize, Deserialize)]
struct StoredAuth {
    #[serde(rename = "type")]
    provider: String,
    id: String,
    #[serde(default)]
    status: AuthStatus,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    proxy_url: String,
}

pub struct FileAuthStore {
    dir: PathBuf,
}

impl FileAuthStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads every `*.json` record under the store directory. Unreadable
    /// files are skipped with a warning rather than failing the boot.
    pub fn list(&self) -> std::io::Result<Vec<Auth>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(|err| err.to_string()).and_then(|raw| {
                serde_json::from_slice::<StoredAuth>(&raw).map_err(|err| err.to_string())
            }) {
                Ok(stored) => out.push(stored.into_auth()),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable auth file")
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub fn save(&self, auth: &Auth) -> std::io::Result<()> {
        let stored = StoredAuth::from_auth(auth);
        let mut data = serde_json::to_vec_pretty(&stored)
            .map_err(|err| std::io::Error::other(format!("encode auth record: {err}")))?;
        data.push(b'\n');
        let path = self.record_path(&auth.id);
        debug!(path = %path.display(), "saving auth record");
        atomic_write(&path, &data)
    }

    pub fn remove(&self, id: &str) -> std::io::Result<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        // Auth ids become file names; keep them path-safe.
        let safe: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl StoredAuth {
    fn from_auth(auth: &Auth) -> Self {
        let mut attributes = auth.attributes.clone();
        for key in NON_PERSISTED_ATTRS {
            attributes.remove(*key);
        }
        Self {
            provider: auth.provider.clone(),
            id: auth.id.clone(),
            status: auth.status,
            attributes,
            proxy_url: auth.proxy_url.clone(),
        }
    }

    fn into_auth(self) -> Auth {
        Auth {
            id: self.id,
            provider: self.provider,
            status: self.status,
            attributes: self.attributes,
            proxy_url: self.proxy_url,
            cooldown_until: None,
        }
    }
}

/// Writes via a temp file in the same directory so the rename stays on one
/// filesystem, syncing before the swap.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("atomic write: path has no parent"))?;
    fs::create_dir_all(dir)?;

    let suffix: u64 = rand::thread_rng().gen();
    let tmp_path = dir.join(format!(".tmp-{suffix:016x}"));
    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        // Windows rename refuses to overwrite; remove the destination first.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> FileAuthStore {
        let suffix: u64 = rand::thread_rng().gen();
        FileAuthStore::new(std::env::temp_dir().join(format!("mproxy-auth-test-{suffix:x}")))
    }

    #[test]
    fn save_and_list_round_trip() {
        let store = temp_store();
        let auth = Auth::new("copilot-1", "copilot")
            .with_attr("github_token", "gho_x")
            .with_attr("account_type", "business");
        store.save(&auth).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "copilot-1");
        assert_eq!(listed[0].provider, "copilot");
        assert_eq!(listed[0].attr("account_type"), Some("business"));

        fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn short_lived_tokens_are_not_persisted() {
        let store = temp_store();
        let auth = Auth::new("copilot-2", "copilot")
            .with_attr("github_token", "gho_x")
            .with_attr("copilot_token", "ephemeral");
        store.save(&auth).unwrap();

        let raw = fs::read_to_string(store.dir().join("copilot-2.json")).unwrap();
        assert!(!raw.contains("ephemeral"));
        assert!(raw.contains("gho_x"));
        assert!(raw.contains("\"type\": \"copilot\""));

        fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let store = temp_store();
        let path = store.dir().join("record.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp droppings left behind.
        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());

        fs::remove_dir_all(store.dir()).unwrap();
    }

    #[test]
    fn missing_directory_lists_empty() {
        let store = FileAuthStore::new("/nonexistent/mproxy-auth-dir");
        assert!(store.list().unwrap().is_empty());
    }
}
