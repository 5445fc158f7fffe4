//! Local engine launching

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::LauncherConfig;

/// Placeholder in launcher arguments replaced by the engine port
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Capability to start an engine on this machine
///
/// Implementations return once the engine had a chance to come up; the
/// locator pings it right afterwards.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, port: u16) -> Result<()>;
}

/// Spawns the engine as a detached child process
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    startup_delay: Duration,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, startup_delay: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            startup_delay,
        }
    }

    pub fn from_config(config: &LauncherConfig) -> Self {
        Self::new(
            PathBuf::from(&config.program),
            config.args.clone(),
            Duration::from_millis(config.startup_delay_ms),
        )
    }

    /// Launcher arguments with the port substituted
    pub fn args_for(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

#[async_trait]
impl EngineLauncher for CommandLauncher {
    async fn launch(&self, port: u16) -> Result<()> {
        let args = self.args_for(port);
        info!("🚀 Launching engine: {} {}", self.program.display(), args.join(" "));

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("Failed to spawn engine '{}'", self.program.display()))?;

        debug!("Engine process started (pid {:?})", child.id());

        tokio::time::sleep(self.startup_delay).await;
        Ok(())
    }
}
