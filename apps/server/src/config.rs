//! Server configuration: a JSON settings file plus env overrides.

use std::path::PathBuf;

use salla_mirror_core::errors::{Error, Result};
use salla_mirror_core::settings::SyncSettings;

pub const CONFIG_PATH_ENV: &str = "SALLA_MIRROR_CONFIG";
pub const API_URL_ENV: &str = "SALLA_API_URL";
pub const DATA_DIR_ENV: &str = "SALLA_MIRROR_DB";
pub const LISTEN_ENV: &str = "SALLA_MIRROR_LISTEN";

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub settings: SyncSettings,
    /// Directory holding the SQLite database.
    pub data_dir: String,
    pub listen_addr: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup`, which resolves env-style keys.
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = non_empty(lookup(CONFIG_PATH_ENV))
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config(format!("{} is not set", CONFIG_PATH_ENV)))?;
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            Error::Config(format!("cannot read {}: {}", path.display(), err))
        })?;
        let mut settings: SyncSettings = serde_json::from_str(&raw).map_err(|err| {
            Error::Config(format!("invalid settings in {}: {}", path.display(), err))
        })?;

        if let Some(url) = non_empty(lookup(API_URL_ENV)) {
            settings.api_base_url = url.trim_end_matches('/').to_string();
        }
        settings.validate()?;
        if settings.stores.is_empty() {
            return Err(Error::Config("no stores configured".to_string()));
        }

        Ok(Self {
            settings,
            data_dir: non_empty(lookup(DATA_DIR_ENV)).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            listen_addr: non_empty(lookup(LISTEN_ENV))
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_settings(body: &str) -> String {
        let dir = tempfile::tempdir().expect("tempdir").keep();
        let path = dir.join("settings.json");
        std::fs::write(&path, body).expect("write settings");
        path.to_string_lossy().to_string()
    }

    fn lookup(vars: HashMap<&'static str, String>) -> impl Fn(&str) -> Option<String> {
        move |key| vars.get(key).cloned()
    }

    const SETTINGS: &str = r#"{
        "stores": [{ "storeId": "s1", "accessToken": "tok", "webhookSecret": "sec" }],
        "batchSize": 25
    }"#;

    #[test]
    fn loads_file_and_applies_overrides() {
        let path = write_settings(SETTINGS);
        let config = ServerConfig::load(lookup(HashMap::from([
            (CONFIG_PATH_ENV, path),
            (API_URL_ENV, "http://mock.local/admin/v2/".to_string()),
            (LISTEN_ENV, "127.0.0.1:9000".to_string()),
        ])))
        .unwrap();

        assert_eq!(config.settings.batch_size, 25);
        assert_eq!(config.settings.api_base_url, "http://mock.local/admin/v2");
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.data_dir, DEFAULT_DATA_DIR);
    }

    #[test]
    fn missing_config_path_fails_fast() {
        let err = ServerConfig::load(lookup(HashMap::new())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn settings_without_stores_are_rejected() {
        let path = write_settings(r#"{ "stores": [] }"#);
        let err = ServerConfig::load(lookup(HashMap::from([(CONFIG_PATH_ENV, path)]))).unwrap_err();
        assert!(err.to_string().contains("no stores"));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let path = write_settings(
            r#"{ "stores": [{ "storeId": "s1", "accessToken": "t", "webhookSecret": "" }] }"#,
        );
        let err = ServerConfig::load(lookup(HashMap::from([(CONFIG_PATH_ENV, path)]))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
