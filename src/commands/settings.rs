use crate::db::Database;
use crate::llm::{EndpointConfig, OpenAiClient, DEFAULT_MODEL};
use std::collections::BTreeMap;

pub const SETTING_KEYS: &[&str] = &["base_url", "api_key", "current_model"];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Per-invocation values that take precedence over stored settings.
#[derive(Debug, Clone, Default)]
pub struct EndpointOverrides {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

pub fn load_endpoint(
    db: &Database,
    overrides: EndpointOverrides,
) -> Result<EndpointConfig, SettingsError> {
    let stored = |key: &str| db.get_setting(key);
    Ok(EndpointConfig {
        base_url: match overrides.base_url {
            Some(v) => v,
            None => stored("base_url")?.unwrap_or_default(),
        },
        api_key: match overrides.api_key {
            Some(v) => v,
            None => stored("api_key")?.unwrap_or_default(),
        },
        model: match overrides.model {
            Some(v) => v,
            None => stored("current_model")?.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        },
    })
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "*".repeat(chars.len())
    }
}

/// Stored settings, with the credential masked for display.
pub fn get_settings(db: &Database) -> Result<BTreeMap<String, String>, SettingsError> {
    let mut map = BTreeMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key)? {
            let shown = if *key == "api_key" { mask(&value) } else { value };
            map.insert(key.to_string(), shown);
        }
    }
    Ok(map)
}

fn check_key(key: &str) -> Result<(), SettingsError> {
    if SETTING_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(SettingsError::UnknownKey(key.to_string()))
    }
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), SettingsError> {
    check_key(key)?;
    db.set_setting(key, value)?;
    tracing::info!(key, "setting updated");
    Ok(())
}

pub fn delete_setting(db: &Database, key: &str) -> Result<(), SettingsError> {
    check_key(key)?;
    db.delete_setting(key)?;
    Ok(())
}

pub async fn get_available_models(client: &OpenAiClient) -> Result<Vec<String>, crate::llm::LlmError> {
    client.list_models().await
}
