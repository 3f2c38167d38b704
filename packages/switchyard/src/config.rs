use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::unit_of_work::IsolationLevel;

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Isolation for new transactions when the handler does not ask for one
    pub default_isolation: Option<IsolationLevel>,
    /// Convert handler panics into `System` errors
    pub catch_panics: bool,
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_isolation: None,
            catch_panics: true,
            log_filter: "info,switchyard=debug".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            default_isolation: lookup("SWITCHYARD_DEFAULT_ISOLATION")
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.parse::<IsolationLevel>())
                .transpose()
                .context("SWITCHYARD_DEFAULT_ISOLATION must be a valid isolation level")?,
            catch_panics: lookup("SWITCHYARD_CATCH_PANICS")
                .map(|v| parse_bool(&v))
                .transpose()
                .context("SWITCHYARD_CATCH_PANICS must be true or false")?
                .unwrap_or(defaults.catch_panics),
            log_filter: lookup("SWITCHYARD_LOG").unwrap_or(defaults.log_filter),
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RuntimeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(load(&[]).unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_reads_all_variables() {
        let config = load(&[
            ("SWITCHYARD_DEFAULT_ISOLATION", "serializable"),
            ("SWITCHYARD_CATCH_PANICS", "false"),
            ("SWITCHYARD_LOG", "warn"),
        ])
        .unwrap();

        assert_eq!(config.default_isolation, Some(IsolationLevel::Serializable));
        assert!(!config.catch_panics);
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn test_invalid_isolation_names_variable() {
        let err = load(&[("SWITCHYARD_DEFAULT_ISOLATION", "chaos")]).unwrap_err();
        assert!(err.to_string().contains("SWITCHYARD_DEFAULT_ISOLATION"));
    }

    #[test]
    fn test_invalid_bool_names_variable() {
        let err = load(&[("SWITCHYARD_CATCH_PANICS", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("SWITCHYARD_CATCH_PANICS"));
    }
}
