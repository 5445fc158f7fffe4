//! Configuration management for Looper Remote
//!
//! Handles loading, parsing and validation of the YAML configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

/// Engine to connect to and how to treat it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_host")]
    pub host: String,
    #[serde(default = "default_engine_port")]
    pub port: u16,
    /// Fail instead of spawning a local engine when none answers
    #[serde(default)]
    pub fail_on_not_found: bool,
    /// Send `/quit` on exit instead of just unsubscribing
    #[serde(default)]
    pub quit_on_exit: bool,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Local OSC endpoint the engine replies to
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Interface to bind; the default accepts replies on every interface
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Host put in the reply URL; derived from the route to the engine when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
}

/// How to start a local engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LauncherConfig {
    #[serde(default = "default_launcher_program")]
    pub program: String,
    /// Arguments; `{port}` is replaced by the engine port
    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: default_engine_host(),
            port: default_engine_port(),
            fail_on_not_found: false,
            quit_on_exit: false,
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: None,
            advertise_host: None,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_launcher_program(),
            args: default_launcher_args(),
            startup_delay_ms: default_startup_delay(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.engine.host.is_empty() {
            anyhow::bail!("engine.host cannot be empty");
        }
        if self.engine.port == 0 {
            anyhow::bail!("engine.port must be a fixed port (not 0)");
        }
        if self.engine.handshake_timeout_ms == 0 {
            anyhow::bail!("engine.handshake_timeout_ms must be positive");
        }
        if self.listen.host.is_empty() {
            anyhow::bail!("listen.host cannot be empty");
        }
        if self.listen.advertise_host.as_deref() == Some("") {
            anyhow::bail!("listen.advertise_host cannot be empty when set");
        }
        if self.launcher.program.is_empty() && !self.engine.fail_on_not_found {
            anyhow::bail!("launcher.program is required unless engine.fail_on_not_found is set");
        }
        Ok(())
    }
}

// Default value functions
fn default_engine_host() -> String { "127.0.0.1".to_string() }
fn default_engine_port() -> u16 { 10001 }
fn default_handshake_timeout() -> u64 { 700 }
fn default_listen_host() -> String { "0.0.0.0".to_string() }
fn default_launcher_program() -> String { "looper-engine".to_string() }
fn default_launcher_args() -> Vec<String> { vec!["--port".to_string(), "{port}".to_string()] }
fn default_startup_delay() -> u64 { 500 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_partial_config_fills_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("looper.yaml");

        std::fs::write(
            &config_path,
            r#"
engine:
  host: "studio.local"
  fail_on_not_found: true
listen:
  port: 9951
"#,
        )?;

        let config = AppConfig::load(&config_path).await?;
        assert_eq!(config.engine.host, "studio.local");
        assert_eq!(config.engine.port, 10001);
        assert!(config.engine.fail_on_not_found);
        assert!(!config.engine.quit_on_exit);
        assert_eq!(config.engine.handshake_timeout_ms, 700);
        assert_eq!(config.listen.port, Some(9951));
        assert_eq!(config.launcher.args, vec!["--port", "{port}"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = AppConfig::load_or_default(temp_dir.path().join("absent.yaml")).await?;
        assert_eq!(config.engine.host, "127.0.0.1");
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, None);
        assert_eq!(config.listen.advertise_host, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("bad.yaml");
        std::fs::write(&config_path, "engine:\n  port: 0\n")?;

        assert!(AppConfig::load(&config_path).await.is_err());
        Ok(())
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = serde_yaml::to_string(&AppConfig::default()).unwrap();
        let back: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.engine.port, 10001);
        assert!(back.validate().is_ok());
    }
}
