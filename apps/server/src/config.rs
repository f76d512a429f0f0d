//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use auricast_core::{DesiredEngineState, EngineConfig, EngineTuning};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port the control API binds to.
    /// Override: `AURICAST_API_PORT`
    pub api_port: u16,

    /// Address receivers and the API bind to.
    pub bind_ip: IpAddr,

    /// UDP port for legacy Scream ingest; null disables it.
    /// Override: `AURICAST_SCREAM_PORT`
    pub scream_port: Option<u16>,

    /// UDP port for per-process Scream ingest; null disables it.
    pub per_process_port: Option<u16>,

    /// UDP port for RTP ingest; null disables it.
    pub rtp_port: Option<u16>,

    /// Listen for SAP announcements on the well-known port.
    pub sap_enabled: bool,

    /// Engine tuning (chunk size, buffer levels, timeshift retention).
    pub tuning: EngineTuning,

    /// Desired engine state applied at boot (sinks and source paths).
    /// The same document shape as `PUT /state`.
    pub initial_state: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: 47_800,
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            scream_port: Some(auricast_core::protocol_constants::DEFAULT_SCREAM_PORT),
            per_process_port: Some(auricast_core::protocol_constants::DEFAULT_PER_PROCESS_PORT),
            rtp_port: Some(auricast_core::protocol_constants::DEFAULT_RTP_PORT),
            sap_enabled: true,
            tuning: EngineTuning::default(),
            initial_state: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AURICAST_API_PORT") {
            if let Ok(port) = val.parse() {
                self.api_port = port;
            }
        }

        if let Ok(val) = std::env::var("AURICAST_SCREAM_PORT") {
            if let Ok(port) = val.parse() {
                self.scream_port = Some(port);
            }
        }
    }

    /// Loads the boot-time desired state, when configured.
    pub fn load_initial_state(&self) -> Result<Option<DesiredEngineState>> {
        let Some(path) = &self.initial_state else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read initial state: {}", path.display()))?;
        let state = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse initial state: {}", path.display()))?;
        Ok(Some(state))
    }

    /// Converts to auricast-core's engine configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            tuning: self.tuning.clone(),
            bind_ip: self.bind_ip,
            scream_port: self.scream_port,
            per_process_port: self.per_process_port,
            rtp_port: self.rtp_port,
            sap_enabled: self.sap_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_enable_all_receivers() {
        let config = ServerConfig::default();
        assert!(config.scream_port.is_some());
        assert!(config.per_process_port.is_some());
        assert!(config.rtp_port.is_some());
        assert!(config.sap_enabled);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "apiPort: 9000\nscreamPort: 5010\nrtpPort: null\ntuning:\n  timeshiftRetentionSecs: 60"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.scream_port, Some(5010));
        assert_eq!(config.rtp_port, None);
        assert_eq!(config.tuning.timeshift_retention_secs, 60);
        // Untouched keys keep defaults
        assert!(config.sap_enabled);
    }
}
