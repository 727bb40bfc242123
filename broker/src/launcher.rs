//! Application process launching
//!
//! The broker can spawn helper applications on demand. How a process is
//! actually started is hidden behind `ProcessLauncher`; the broker only
//! builds the argument list.

use async_trait::async_trait;
use tracing::info;

use fleetlink_shared::{LinkError, LinkResult};

/// Everything a launched application needs to find its way back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program to start
    pub app: String,
    /// Pre-registered id the process must claim via two-phase registration
    pub id: String,
    /// Broker endpoint as `ip:port`
    pub broker: String,
    /// Client id the new process answers to
    pub owner: String,
    pub extra_args: Vec<String>,
}

impl LaunchSpec {
    /// Full argument vector; identity flags come last so they win over
    /// anything a caller smuggled into `extra_args`
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.extra_args.clone();
        argv.push("--id".into());
        argv.push(self.id.clone());
        argv.push("--broker".into());
        argv.push(self.broker.clone());
        argv.push("--owner".into());
        argv.push(self.owner.clone());
        argv
    }
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> LinkResult<()>;
}

/// Spawns the application as a detached child process
pub struct SystemLauncher;

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> LinkResult<()> {
        let child = tokio::process::Command::new(&spec.app)
            .args(spec.argv())
            .spawn()
            .map_err(|e| LinkError::Invalid(format!("failed to launch {}: {e}", spec.app)))?;
        info!(app = %spec.app, id = %spec.id, pid = child.id(), "launched application");
        Ok(())
    }
}

/// Records launch requests instead of spawning anything
#[cfg(test)]
pub struct RecordingLauncher {
    pub launched: tokio::sync::Mutex<Vec<LaunchSpec>>,
}

#[cfg(test)]
impl RecordingLauncher {
    pub fn new() -> Self {
        Self {
            launched: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> LinkResult<()> {
        self.launched.lock().await.push(spec.clone());
        Ok(())
    }
}
