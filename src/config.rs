//! Configuration management module
//!
//! Layers, lowest first: built-in defaults, the YAML file, environment, CLI flags.

use std::path::{Path, PathBuf};

use cdp_adapter::CdpConfig;
use network_timeline::config::TimelineConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::FlowError;
use crate::flow::FlowConfig;
use crate::scenario::{DEFAULT_ORIGIN, DEFAULT_PROVIDER};

const ENV_WS_URL: &str = "FLOWPROBE_WS_URL";
const ENV_ORIGIN: &str = "FLOWPROBE_ORIGIN";
const ENV_PROVIDER: &str = "FLOWPROBE_PROVIDER";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cdp: CdpConfig,
    pub flow: FlowConfig,
    pub timeline: TimelineConfig,
    /// Scenario file; the built-in gateway chain is used when unset.
    pub scenario: Option<PathBuf>,
    pub origin: String,
    pub provider: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cdp: CdpConfig::default(),
            flow: FlowConfig::default(),
            timeline: TimelineConfig::default(),
            scenario: None,
            origin: DEFAULT_ORIGIN.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, FlowError> {
        serde_yaml::from_str(raw).map_err(|err| FlowError::Config(format!("parsing config: {err}")))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(url) = get(ENV_WS_URL) {
            debug!(target: "flowprobe::config", %url, "devtools endpoint from environment");
            self.cdp.websocket_url = Some(url);
        }
        if let Some(origin) = get(ENV_ORIGIN) {
            self.origin = origin;
        }
        if let Some(provider) = get(ENV_PROVIDER) {
            self.provider = provider;
        }
    }
}

/// Default config location: `<config dir>/flowprobe/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("flowprobe").join("config.yaml"))
}

/// Load configuration. An explicit path must exist; the default path is optional.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig, FlowError> {
    let (path, required) = match path {
        Some(path) => (Some(path.to_path_buf()), true),
        None => (default_config_path(), false),
    };

    let mut config = match path {
        Some(path) if required || path.exists() => {
            let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
                FlowError::Config(format!("reading {}: {err}", path.display()))
            })?;
            info!(target: "flowprobe::config", path = %path.display(), "loaded configuration");
            AppConfig::from_yaml(&raw)?
        }
        _ => {
            warn!(target: "flowprobe::config", "no configuration file found, using defaults");
            AppConfig::default()
        }
    };

    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml(
            r#"
origin: "http://localhost:8080/"
flow:
  settle_ms: 0
"#,
        )
        .expect("parse");
        assert_eq!(config.origin, "http://localhost:8080/");
        assert_eq!(config.flow.settle_ms, 0);
        assert_eq!(config.flow.navigation_timeout_ms, 30_000);
        assert_eq!(config.provider, DEFAULT_PROVIDER);
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            (ENV_WS_URL, "ws://chrome:9222/"),
            (ENV_ORIGIN, "  "),
            (ENV_PROVIDER, "http://op:9000/"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.cdp.websocket_url.as_deref(), Some("ws://chrome:9222/"));
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert_eq!(config.provider, "http://op:9000/");
    }

    #[tokio::test]
    async fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            load_config(Some(missing.as_path())).await,
            Err(FlowError::Config(_))
        ));
    }

    #[tokio::test]
    async fn loads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, "scenario: /tmp/chain.yaml\ncdp:\n  heartbeat_interval_ms: 1000\n")
            .await
            .expect("write");
        let config = load_config(Some(path.as_path())).await.expect("load");
        assert_eq!(config.scenario, Some(PathBuf::from("/tmp/chain.yaml")));
        assert_eq!(config.cdp.heartbeat_interval_ms, 1000);
    }
}
