//! Provisioner that runs shell commands on the server over `ssh`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use imagesmith_core::build::{ConnectionInfo, ProvisionError, Provisioner};

/// Runs each configured command in order through the system `ssh` client.
pub struct SshProvisioner {
    program: String,
    commands: Vec<String>,
}

impl SshProvisioner {
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            program: "ssh".to_string(),
            commands,
        }
    }

    /// Use another client binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments for running `command` on the server.
    fn ssh_args(conn: &ConnectionInfo, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            conn.port.to_string(),
        ];
        if let Some(key) = &conn.private_key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", conn.username, conn.address));
        args.push(command.to_string());
        args
    }

    async fn run_remote(
        &self,
        conn: &ConnectionInfo,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        debug!("Running '{}' on {}", command, conn.address);
        let mut child = Command::new(&self.program);
        child
            .args(Self::ssh_args(conn, command))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            output = child.output() => output.map_err(|source| ProvisionError::Spawn {
                program: self.program.clone(),
                source,
            })?,
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Shell snippet deleting the line containing `public_key` from the
/// login user's authorized keys.
fn remove_key_command(public_key: &str) -> String {
    // the base64 body identifies the key and contains no shell metacharacters
    let body = public_key.split_whitespace().nth(1).unwrap_or(public_key);
    format!(
        "grep -vF '{body}' ~/.ssh/authorized_keys > ~/.ssh/authorized_keys.imagesmith; \
         mv ~/.ssh/authorized_keys.imagesmith ~/.ssh/authorized_keys && \
         chmod 600 ~/.ssh/authorized_keys"
    )
}

#[async_trait]
impl Provisioner for SshProvisioner {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn provision(
        &self,
        conn: &ConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        for (index, command) in self.commands.iter().enumerate() {
            info!(
                "Provisioning command {}/{}: {}",
                index + 1,
                self.commands.len(),
                command
            );
            self.run_remote(conn, command, cancel).await?;
        }
        Ok(())
    }

    async fn remove_temporary_key(
        &self,
        conn: &ConnectionInfo,
        public_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.run_remote(conn, &remove_key_command(public_key), cancel)
            .await
    }
}
