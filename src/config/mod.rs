//! Configuration management
//!
//! Loads the TOML configuration file and pours the `[global]` and
//! `[users.<name>]` tables into the property store, which is the
//! runtime lookup model everywhere else.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::properties::{PropertyLevel, PropertyStore, PropertyValue};
use crate::protocol::{DEFAULT_PIPE_DIR, DEFAULT_SCRATCH_DIR};

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory the Windows-style pipe namespace is mapped onto.
    #[serde(default = "default_pipe_dir")]
    pub pipe_dir: PathBuf,
    /// Scratch directory for session token files.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

fn default_pipe_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PIPE_DIR)
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SCRATCH_DIR)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pipe_dir: default_pipe_dir(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Global property scope
    #[serde(default)]
    pub global: BTreeMap<String, toml::Value>,
    /// Per-user property overrides
    #[serde(default)]
    pub users: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults: reconnect enabled, null backend module so a
    /// bare install comes up without extra services.
    pub fn default_config() -> Self {
        let mut global = BTreeMap::new();
        global.insert("session.reconnect".to_string(), toml::Value::Boolean(true));
        global.insert("module".to_string(), toml::Value::String("X11".into()));
        global.insert(
            "module.X11.modulename".to_string(),
            toml::Value::String("null".into()),
        );
        global.insert(
            "module.X11.uselauncher".to_string(),
            toml::Value::Boolean(false),
        );
        global.insert(
            "auth.greeter".to_string(),
            toml::Value::String("Qt".into()),
        );
        global.insert(
            "module.Qt.modulename".to_string(),
            toml::Value::String("null".into()),
        );
        global.insert(
            "module.Qt.uselauncher".to_string(),
            toml::Value::Boolean(false),
        );
        Self {
            manager: ManagerConfig::default(),
            global,
            users: BTreeMap::new(),
        }
    }

    /// Reject value types the property model cannot hold.
    pub fn validate(&self) -> Result<()> {
        for (path, value) in self
            .global
            .iter()
            .chain(self.users.values().flatten())
        {
            if convert(value).is_none() {
                bail!(
                    "property {} has unsupported type {}",
                    path,
                    value.type_str()
                );
            }
        }
        Ok(())
    }

    /// Populate the property store.
    pub fn apply_to(&self, store: &PropertyStore) {
        for (path, value) in &self.global {
            if let Some(value) = convert(value) {
                store.set(PropertyLevel::Global, path, value);
            }
        }
        for (user, properties) in &self.users {
            for (path, value) in properties {
                if let Some(value) = convert(value) {
                    store.set(PropertyLevel::User(user), path, value);
                }
            }
        }
    }
}

fn convert(value: &toml::Value) -> Option<PropertyValue> {
    match value {
        toml::Value::Boolean(v) => Some(PropertyValue::Bool(*v)),
        toml::Value::Integer(v) => Some(PropertyValue::Number(*v)),
        toml::Value::String(v) => Some(PropertyValue::Text(v.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_applies_scopes() {
        let config: Config = toml::from_str(
            r#"
            [manager]
            pipe_dir = "/run/wrd/.pipe"

            [global]
            "session.reconnect" = true
            "session.maxXRes" = 1920
            "module" = "X11"

            [users.alice]
            "session.singleSession" = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let store = PropertyStore::new();
        config.apply_to(&store);

        assert_eq!(store.get_bool(None, "session.reconnect"), Some(true));
        assert_eq!(store.get_number(None, "session.maxXRes"), Some(1920));
        assert_eq!(
            store.get_bool(Some("alice"), "session.singleSession"),
            Some(true)
        );
        assert_eq!(store.get_bool(Some("bob"), "session.singleSession"), None);
        assert_eq!(config.manager.pipe_dir, PathBuf::from("/run/wrd/.pipe"));
    }

    #[test]
    fn rejects_unsupported_value_types() {
        let config: Config = toml::from_str(
            r#"
            [global]
            "session.odd" = 1.5
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default_config();
        config.validate().unwrap();
        let store = PropertyStore::new();
        config.apply_to(&store);
        assert_eq!(
            store.get_string(None, "module.X11.modulename").as_deref(),
            Some("null")
        );
    }
}
