//! Tracing / logging initialisation for the CLI.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per crate: crate name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Defaults overridden by the environment:
    /// - `SESSIONLOG_LOG`: global level
    /// - `SESSIONLOG_LOG_COMPONENTS`: `crate=level` pairs, comma separated
    /// - `SESSIONLOG_LOG_JSON=1`: JSON output
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = lookup("SESSIONLOG_LOG") {
            config.level = level;
        }
        if let Some(raw) = lookup("SESSIONLOG_LOG_COMPONENTS") {
            config.components = raw
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(component, level)| (component.trim().to_string(), level.trim().to_string()))
                .filter(|(component, level)| !component.is_empty() && !level.is_empty())
                .collect();
        }
        config.json = matches!(lookup("SESSIONLOG_LOG_JSON").as_deref(), Some("1" | "true"));
        config
    }

    /// The `EnvFilter` directive string, e.g. `"warn,sessionlog_storage=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("warn"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_components() {
        let mut config = LogConfig::default();
        config.level = "info".into();
        config
            .components
            .insert("sessionlog-storage".into(), "debug".into());
        assert_eq!(config.directives(), "info,sessionlog_storage=debug");
    }

    #[test]
    fn components_come_from_env() {
        let config = LogConfig::from_lookup(|key| match key {
            "SESSIONLOG_LOG" => Some("info".into()),
            "SESSIONLOG_LOG_COMPONENTS" => {
                Some("sessionlog-storage=debug, sessionlog_core = trace,broken".into())
            }
            "SESSIONLOG_LOG_JSON" => Some("1".into()),
            _ => None,
        });
        assert_eq!(
            config.directives(),
            "info,sessionlog_storage=debug,sessionlog_core=trace"
        );
        assert!(config.json);

        let config = LogConfig::from_lookup(|_| None);
        assert_eq!(config.directives(), "warn");
        assert!(!config.json);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert_eq!(config.level, "warn");
        assert!(config.json);
    }
}
