//! Mock provisioning collaborators.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::build::{
    ConnectionInfo, ProvisionError, Provisioner, SshKeyGenerator, SshKeyPair,
    TEMPORARY_KEY_COMMENT,
};
use crate::pipeline::PipelineError;

/// Provisioner that records what it was asked to do.
#[derive(Debug, Default, Clone)]
pub struct MockProvisioner {
    provisions: Arc<RwLock<Vec<ConnectionInfo>>>,
    key_removals: Arc<RwLock<Vec<String>>>,
    next_provision_error: Arc<RwLock<Option<String>>>,
    next_removal_error: Arc<RwLock<Option<String>>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded_provisions(&self) -> Vec<ConnectionInfo> {
        self.provisions.read().await.clone()
    }

    /// Public keys passed to `remove_temporary_key`.
    pub async fn recorded_key_removals(&self) -> Vec<String> {
        self.key_removals.read().await.clone()
    }

    /// Make the next `provision` call fail with `stderr`.
    pub async fn fail_next_provision(&self, stderr: &str) {
        *self.next_provision_error.write().await = Some(stderr.to_string());
    }

    pub async fn fail_next_key_removal(&self, stderr: &str) {
        *self.next_removal_error.write().await = Some(stderr.to_string());
    }
}

fn command_failed(command: &str, stderr: String) -> ProvisionError {
    ProvisionError::CommandFailed {
        command: command.to_string(),
        status: "exit status: 1".to_string(),
        stderr,
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn provision(
        &self,
        conn: &ConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        self.provisions.write().await.push(conn.clone());
        match self.next_provision_error.write().await.take() {
            Some(stderr) => Err(command_failed("provision", stderr)),
            None => Ok(()),
        }
    }

    async fn remove_temporary_key(
        &self,
        _conn: &ConnectionInfo,
        public_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        self.key_removals.write().await.push(public_key.to_string());
        match self.next_removal_error.write().await.take() {
            Some(stderr) => Err(command_failed("remove temporary key", stderr)),
            None => Ok(()),
        }
    }
}

/// Key generator that writes a fixed key pair instead of running
/// `ssh-keygen`.
#[derive(Debug, Clone)]
pub struct StaticKeyGenerator {
    pub public_key: String,
}

impl Default for StaticKeyGenerator {
    fn default() -> Self {
        Self {
            public_key: format!(
                "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQC7mock {}",
                TEMPORARY_KEY_COMMENT
            ),
        }
    }
}

#[async_trait]
impl SshKeyGenerator for StaticKeyGenerator {
    async fn generate(&self, dir: &Path) -> Result<SshKeyPair, PipelineError> {
        let private_key_path = dir.join("id_rsa");
        tokio::fs::write(&private_key_path, "mock private key\n").await?;
        tokio::fs::write(dir.join("id_rsa.pub"), format!("{}\n", self.public_key)).await?;
        Ok(SshKeyPair {
            public_key: self.public_key.clone(),
            private_key_path: Some(private_key_path),
            generated: true,
        })
    }
}
