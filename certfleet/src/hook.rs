use tokio::process::Command;
use tracing::{error, info};

use crate::error::HookError;

/// Runs the operator's command after a certificate was stored.
#[derive(Debug, Clone, Default)]
pub struct HookDispatcher {
    command: Option<String>,
}

impl HookDispatcher {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Invoke the hook with `cert_name` as its only argument.
    ///
    /// Without a configured command this is a no-op.
    pub async fn notify(&self, cert_name: &str) -> Result<(), HookError> {
        let Some(command) = &self.command else {
            return Ok(());
        };
        info!(cert = %cert_name, "running renewed hook");
        let status = Command::new(command)
            .arg(cert_name)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| {
                error!(cert = %cert_name, "failed to run renewed hook: {source:?}");
                HookError::Spawn {
                    command: command.clone(),
                    source,
                }
            })?;
        if !status.success() {
            error!(cert = %cert_name, "renewed hook failed with status: {status}");
            return Err(HookError::Failed {
                command: command.clone(),
                status,
            });
        }
        Ok(())
    }
}
