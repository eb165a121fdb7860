//! Settings database operations

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::Settings;
use rusqlite::{params, OptionalExtension};

/// Settings database operations
pub struct SettingsDb;

impl SettingsDb {
    /// Load all settings from database, falling back to defaults per key
    pub fn load(db: &Database) -> Result<Settings> {
        let mut settings = Settings::default();

        db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            for row in rows {
                let (key, value) = row?;
                match key.as_str() {
                    "download_path" => {
                        settings.download_path = expand_home(value);
                    }
                    "daemon_rpc_url" => settings.daemon_rpc_url = value,
                    "daemon_secret" => {
                        settings.daemon_secret = Some(value).filter(|s| !s.is_empty());
                    }
                    "daemon_namespace" => settings.daemon_namespace = value,
                    "search_provider_url" => settings.search_provider_url = value,
                    "poll_interval_secs" => {
                        settings.poll_interval_secs = value.parse().unwrap_or(5);
                    }
                    "rpc_timeout_ms" => {
                        settings.rpc_timeout_ms = value.parse().unwrap_or(3000);
                    }
                    "broad_result_limit" => {
                        settings.broad_result_limit = value.parse().unwrap_or(10);
                    }
                    "season_result_limit" => {
                        settings.season_result_limit = value.parse().unwrap_or(5);
                    }
                    "max_concurrent_downloads" => {
                        settings.max_concurrent_downloads = value.parse().unwrap_or(5);
                    }
                    "bt_enable_dht" => {
                        settings.bt_enable_dht = value == "true";
                    }
                    "bt_enable_pex" => {
                        settings.bt_enable_pex = value == "true";
                    }
                    "bt_enable_lpd" => {
                        settings.bt_enable_lpd = value == "true";
                    }
                    "bt_max_peers" => {
                        settings.bt_max_peers = value.parse().unwrap_or(55);
                    }
                    "bt_seed_ratio" => {
                        settings.bt_seed_ratio = value.parse().unwrap_or(1.0);
                    }
                    "delete_files_on_remove" => {
                        settings.delete_files_on_remove = value == "true";
                    }
                    other => log::debug!("Ignoring unknown setting {:?}", other),
                }
            }

            Ok(())
        })?;

        Ok(settings)
    }

    /// Save a single setting
    pub fn set(db: &Database, key: &str, value: &str) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Validate and store one setting
    ///
    /// Unknown keys and values that would not parse are rejected instead of
    /// being silently replaced by defaults on the next load.
    pub fn update(db: &Database, key: &str, value: &str) -> Result<()> {
        let valid = match key {
            "download_path" | "daemon_rpc_url" | "daemon_secret" | "daemon_namespace"
            | "search_provider_url" => true,
            "poll_interval_secs" | "rpc_timeout_ms" | "broad_result_limit" | "season_result_limit" => {
                value.parse::<u64>().is_ok()
            }
            "max_concurrent_downloads" | "bt_max_peers" => value.parse::<u32>().is_ok(),
            "bt_seed_ratio" => value.parse::<f64>().is_ok_and(|r| r >= 0.0),
            "bt_enable_dht" | "bt_enable_pex" | "bt_enable_lpd" | "delete_files_on_remove" => {
                matches!(value, "true" | "false")
            }
            other => {
                return Err(Error::Validation(format!("unknown setting {:?}", other)));
            }
        };
        if !valid {
            return Err(Error::Validation(format!("invalid value {:?} for {}", value, key)));
        }
        Self::set(db, key, value)
    }

    /// Save all settings
    pub fn save(db: &Database, settings: &Settings) -> Result<()> {
        for (key, value) in Self::entries(settings) {
            Self::set(db, key, &value)?;
        }
        Ok(())
    }

    /// Every setting as a stored key/value pair
    pub fn entries(settings: &Settings) -> Vec<(&'static str, String)> {
        vec![
            ("download_path", settings.download_path.clone()),
            ("daemon_rpc_url", settings.daemon_rpc_url.clone()),
            ("daemon_secret", settings.daemon_secret.clone().unwrap_or_default()),
            ("daemon_namespace", settings.daemon_namespace.clone()),
            ("search_provider_url", settings.search_provider_url.clone()),
            ("poll_interval_secs", settings.poll_interval_secs.to_string()),
            ("rpc_timeout_ms", settings.rpc_timeout_ms.to_string()),
            ("broad_result_limit", settings.broad_result_limit.to_string()),
            ("season_result_limit", settings.season_result_limit.to_string()),
            ("max_concurrent_downloads", settings.max_concurrent_downloads.to_string()),
            ("bt_enable_dht", bool_str(settings.bt_enable_dht).to_string()),
            ("bt_enable_pex", bool_str(settings.bt_enable_pex).to_string()),
            ("bt_enable_lpd", bool_str(settings.bt_enable_lpd).to_string()),
            ("bt_max_peers", settings.bt_max_peers.to_string()),
            ("bt_seed_ratio", settings.bt_seed_ratio.to_string()),
            ("delete_files_on_remove", bool_str(settings.delete_files_on_remove).to_string()),
        ]
    }

    /// Get a single setting value
    pub fn get(db: &Database, key: &str) -> Result<Option<String>> {
        db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(value: String) -> String {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    } else if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    value
}
