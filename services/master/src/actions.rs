//! Machine control actions.
//!
//! A [`MachineAction`] is one side effect that powers a machine on or off:
//! run a local command (wake-on-LAN script, cloud CLI) or run a command on a
//! remote host over ssh. [`ActionMachineBackend`] pairs a start action with a
//! stop action to form a [`MachineBackend`].

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::latent::MachineBackend;

/// One side effect that powers a machine on or off.
#[async_trait]
pub trait MachineAction: Send + Sync {
    async fn perform(&self) -> anyhow::Result<()>;
}

/// Run a command on the master host. A non-zero exit status is an error.
pub struct LocalCommandAction {
    program: String,
    args: Vec<String>,
}

impl LocalCommandAction {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl MachineAction for LocalCommandAction {
    async fn perform(&self) -> anyhow::Result<()> {
        debug!(program = %self.program, "running local machine action");
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", self.program, status);
        }
        Ok(())
    }
}

/// Run a command on a remote host over ssh.
///
/// Uses `BatchMode=yes` so a missing key fails fast instead of prompting.
pub struct SshCommandAction {
    host: String,
    port: Option<u16>,
    identity: Option<String>,
    remote_command: Vec<String>,
}

impl SshCommandAction {
    pub fn new(host: impl Into<String>, remote_command: Vec<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            identity: None,
            remote_command,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(self.host.clone());
        args.extend(self.remote_command.iter().cloned());
        args
    }
}

#[async_trait]
impl MachineAction for SshCommandAction {
    async fn perform(&self) -> anyhow::Result<()> {
        debug!(host = %self.host, "running remote machine action");
        let status = Command::new("ssh")
            .args(self.build_args())
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("ssh to {} exited with {}", self.host, status);
        }
        Ok(())
    }
}

/// [`MachineBackend`] driven by a pair of actions.
pub struct ActionMachineBackend {
    start: Box<dyn MachineAction>,
    stop: Box<dyn MachineAction>,
}

impl ActionMachineBackend {
    pub fn new(start: Box<dyn MachineAction>, stop: Box<dyn MachineAction>) -> Self {
        Self { start, stop }
    }
}

#[async_trait]
impl MachineBackend for ActionMachineBackend {
    async fn start_machine(&self) -> anyhow::Result<bool> {
        self.start.perform().await?;
        Ok(true)
    }

    async fn stop_machine(&self) -> anyhow::Result<()> {
        self.stop.perform().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_command_success() {
        let action = LocalCommandAction::new("true", vec![]);
        action.perform().await.unwrap();
    }

    #[tokio::test]
    async fn local_command_nonzero_exit_is_an_error() {
        let action = LocalCommandAction::new("false", vec![]);
        assert!(action.perform().await.is_err());
    }

    #[tokio::test]
    async fn local_command_missing_binary_is_an_error() {
        let action = LocalCommandAction::new("/nonexistent/definitely-not-here", vec![]);
        assert!(action.perform().await.is_err());
    }

    #[test]
    fn ssh_args_include_batch_mode_and_options() {
        let action = SshCommandAction::new("build1.example.com", vec!["poweroff".into()])
            .port(2222)
            .identity("/etc/forge/id_ed25519");
        let args = action.build_args();
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-p",
                "2222",
                "-i",
                "/etc/forge/id_ed25519",
                "build1.example.com",
                "poweroff",
            ]
        );
    }

    #[tokio::test]
    async fn action_backend_maps_success_to_started() {
        let backend = ActionMachineBackend::new(
            Box::new(LocalCommandAction::new("true", vec![])),
            Box::new(LocalCommandAction::new("true", vec![])),
        );
        assert!(backend.start_machine().await.unwrap());
        backend.stop_machine().await.unwrap();
    }
}
