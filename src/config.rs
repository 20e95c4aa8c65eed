//! Server configuration and API key authentication.
//!
//! Environment variables:
//! - `MEALSYNC_PORT`: port to listen on (default: 8080)
//! - `MEALSYNC_DB`: SQLite database path (default: ~/.local/share/mealsync/sync.db)
//! - `MEALSYNC_CONFIG`: path to the API key file (default: ~/.config/mealsync/config.yaml)
//!
//! API key file format:
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "user1"
//!     household_id: "family1"
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// API key entry in the config file.
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    user_id: String,
    household_id: String,
}

/// Config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("MEALSYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let db_path = std::env::var("MEALSYNC_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mealsync")
                    .join("sync.db")
            });

        let config_path = std::env::var("MEALSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mealsync")
                    .join("config.yaml")
            });

        Self {
            port,
            db_path,
            config_path,
        }
    }
}

/// Authenticated caller, added to request extensions after auth.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub household_id: String,
}

/// API key store mapping key -> caller identity.
#[derive(Debug, Clone)]
pub struct ApiKeyStore {
    keys: HashMap<String, AuthUser>,
}

impl ApiKeyStore {
    /// Load API keys from the config file. A missing or malformed file
    /// yields an empty store; all authenticated requests will fail.
    pub fn load(config_path: &Path) -> Self {
        let keys = match std::fs::read_to_string(config_path) {
            Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
                Ok(config) => {
                    let mut map = HashMap::new();
                    for entry in config.api_keys {
                        map.insert(
                            entry.key,
                            AuthUser {
                                user_id: entry.user_id,
                                household_id: entry.household_id,
                            },
                        );
                    }
                    tracing::info!("Loaded {} API key(s)", map.len());
                    map
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                HashMap::new()
            }
        };

        Self { keys }
    }

    /// Validate an API key and return the associated caller.
    pub fn validate(&self, key: &str) -> Option<AuthUser> {
        self.keys.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_api_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
api_keys:
  - key: "secret-a"
    user_id: "user1"
    household_id: "family1"
  - key: "secret-b"
    user_id: "user2"
    household_id: "family1"
"#,
        )
        .unwrap();

        let store = ApiKeyStore::load(&path);
        let user = store.validate("secret-a").unwrap();
        assert_eq!(user.user_id, "user1");
        assert_eq!(user.household_id, "family1");
        assert!(store.validate("wrong").is_none());
    }

    #[test]
    fn test_missing_file_yields_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = ApiKeyStore::load(&dir.path().join("nope.yaml"));
        assert!(store.validate("anything").is_none());
    }
}
