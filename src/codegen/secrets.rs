//! Secret store - alias → value, read-mostly and refreshed on a timer
//!
//! Readers load the current map without locking; a refresh swaps in a new
//! map. A reader may see a value up to one tick stale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("failed to read secrets file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid secrets file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("secret store has no backing file")]
    NoSource,
}

pub struct SecretStore {
    values: ArcSwap<BTreeMap<String, String>>,
    source: Option<PathBuf>,
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore {
    pub fn new() -> Self {
        Self::from_map(BTreeMap::new())
    }

    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self {
            values: ArcSwap::from_pointee(values),
            source: None,
        }
    }

    /// Load `alias = "value"` pairs from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, SecretsError> {
        let path = path.into();
        let values = read_file(&path)?;
        Ok(Self {
            values: ArcSwap::from_pointee(values),
            source: Some(path),
        })
    }

    pub fn get(&self, alias: &str) -> Option<String> {
        self.values.load().get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.values.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.load().is_empty()
    }

    pub fn replace(&self, values: BTreeMap<String, String>) {
        self.values.store(Arc::new(values));
    }

    /// Re-read the backing file; returns the number of secrets
    pub fn reload(&self) -> Result<usize, SecretsError> {
        let path = self.source.as_ref().ok_or(SecretsError::NoSource)?;
        let values = read_file(path)?;
        let count = values.len();
        self.replace(values);
        Ok(count)
    }

    /// Reload every `interval` until `shutdown`; failures keep the old map
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.reload() {
                            tracing::warn!(error = %e, "Secret refresh failed");
                        }
                    }
                }
            }
        })
    }

    /// Replace quoted plaintext secret values with `lookup(alias)`
    ///
    /// Longer values are replaced first so one secret that contains another
    /// is not split.
    pub fn substitute(&self, source: &str, lookup: impl Fn(&str) -> String) -> String {
        let values = self.values.load();
        let mut pairs: Vec<(&String, &String)> = values.iter().filter(|(_, v)| !v.is_empty()).collect();
        pairs.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut out = source.to_string();
        for (alias, value) in pairs {
            let quoted = format!("{value:?}");
            if out.contains(&quoted) {
                tracing::debug!(alias = %alias, "Replacing plaintext secret");
                out = out.replace(&quoted, &lookup(alias));
            }
        }
        out
    }
}

fn read_file(path: &Path) -> Result<BTreeMap<String, String>, SecretsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SecretsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| SecretsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::from_map(BTreeMap::from([
            ("smtp".to_string(), "pass".to_string()),
            ("api".to_string(), "pass-long".to_string()),
            ("blank".to_string(), String::new()),
        ]))
    }

    #[test]
    fn test_substitute_quoted_values() {
        let src = r#"let a = "pass-long"; let b = "pass"; let c = "passive";"#;
        let out = store().substitute(src, |alias| format!("ctx.secret({alias:?})"));
        assert_eq!(
            out,
            r#"let a = ctx.secret("api"); let b = ctx.secret("smtp"); let c = "passive";"#
        );
    }

    #[test]
    fn test_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.toml");
        std::fs::write(&path, "mail = \"one\"\n").unwrap();
        let store = SecretStore::from_file(&path).unwrap();
        assert_eq!(store.get("mail").as_deref(), Some("one"));

        std::fs::write(&path, "mail = \"two\"\nsms = \"x\"\n").unwrap();
        assert_eq!(store.reload().unwrap(), 2);
        assert_eq!(store.get("mail").as_deref(), Some("two"));
        assert_eq!(store.aliases(), vec!["mail", "sms"]);
    }

    #[test]
    fn test_reload_without_file() {
        assert!(matches!(SecretStore::new().reload(), Err(SecretsError::NoSource)));
    }
}
