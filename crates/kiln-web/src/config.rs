use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "kiln.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KilnConfig {
    pub form_endpoint: String,
    pub save_endpoint: String,
    pub unlock_endpoint: String,
    pub http_timeout_ms: u64,
    pub reverb: ReverbConfig,
    pub bridge: BridgeConfig,
    pub sync: SyncConfig,
}

/// Pusher-protocol websocket server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReverbConfig {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub app_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Registrations must pause this long before the init hook runs.
    pub quiet_period_ms: u64,
    pub script_ready_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// A `connected` event without a socket id is re-checked after this delay.
    pub recheck_delay_ms: u64,
    pub subscribe_delay_ms: u64,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self::minimal()
    }
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: None,
            app_key: "kiln".to_string(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 500,
            script_ready_delay_ms: 1000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recheck_delay_ms: 1000,
            subscribe_delay_ms: 500,
        }
    }
}

impl BridgeConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn script_ready_delay(&self) -> Duration {
        Duration::from_millis(self.script_ready_delay_ms)
    }
}

impl SyncConfig {
    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }

    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_delay_ms)
    }
}

impl ReverbConfig {
    pub fn is_secure(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("https") || self.scheme.eq_ignore_ascii_case("wss")
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    /// `ws://host:port/app/{key}?protocol=7&client=kiln&version=...`
    pub fn socket_url(&self) -> String {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/app/{}?protocol=7&client=kiln&version={}",
            self.host,
            self.effective_port(),
            self.app_key,
            env!("CARGO_PKG_VERSION")
        )
    }
}

impl KilnConfig {
    pub fn minimal() -> Self {
        Self {
            form_endpoint: "http://localhost:8000/api/form-versions".to_string(),
            save_endpoint: "http://localhost:8000/saveICMData".to_string(),
            unlock_endpoint: "http://localhost:8000/clearICMLockedFlag".to_string(),
            http_timeout_ms: 5000,
            reverb: ReverbConfig::default(),
            bridge: BridgeConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms.max(1))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads `path`, or `kiln.json` in the working directory when present,
    /// or falls back to [`KilnConfig::minimal`]; then applies `KILN_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    Self::from_file(&default_path)?
                } else {
                    debug!("no config file, using defaults");
                    Self::minimal()
                }
            }
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("KILN_FORM_ENDPOINT") {
            self.form_endpoint = v;
        }
        if let Some(v) = get("KILN_SAVE_ENDPOINT") {
            self.save_endpoint = v;
        }
        if let Some(v) = get("KILN_UNLOCK_ENDPOINT") {
            self.unlock_endpoint = v;
        }
        if let Some(v) = get("KILN_REVERB_SCHEME") {
            self.reverb.scheme = v;
        }
        if let Some(v) = get("KILN_REVERB_HOST") {
            self.reverb.host = v;
        }
        if let Some(v) = get("KILN_REVERB_PORT") {
            let port = v.trim().parse::<u16>().map_err(|_| ConfigError::Env {
                key: "KILN_REVERB_PORT",
                value: v.clone(),
            })?;
            self.reverb.port = Some(port);
        }
        if let Some(v) = get("KILN_REVERB_APP_KEY") {
            self.reverb.app_key = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_files_keep_defaults() {
        let config: KilnConfig =
            serde_json::from_str(r#"{"formEndpoint": "https://forms.example/api", "reverb": {"port": 8080}}"#)
                .expect("config");
        assert_eq!(config.form_endpoint, "https://forms.example/api");
        assert_eq!(config.reverb.port, Some(8080));
        assert_eq!(config.reverb.app_key, "kiln");
        assert_eq!(config.bridge.quiet_period_ms, 500);
        assert_eq!(config.sync.recheck_delay_ms, 1000);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KILN_SAVE_ENDPOINT", "https://save.example"),
            ("KILN_REVERB_SCHEME", "https"),
            ("KILN_REVERB_HOST", "ws.example"),
            ("KILN_UNLOCK_ENDPOINT", " "),
        ]);
        let mut config = KilnConfig::minimal();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .expect("env");
        assert_eq!(config.save_endpoint, "https://save.example");
        assert_eq!(config.unlock_endpoint, KilnConfig::minimal().unlock_endpoint);
        assert!(config.reverb.socket_url().starts_with("wss://ws.example:443/app/kiln?protocol=7"));
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut config = KilnConfig::minimal();
        let err = config
            .apply_env_from(|key| (key == "KILN_REVERB_PORT").then(|| "eighty".to_string()))
            .expect_err("bad port");
        assert!(matches!(err, ConfigError::Env { key: "KILN_REVERB_PORT", .. }));
    }
}
