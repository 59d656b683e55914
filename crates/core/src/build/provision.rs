use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::state::BuildState;
use crate::pipeline::{halt, require, PipelineError, StateBag, Step, StepAction};

/// How to reach the temporary server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Bare address.
    pub address: String,
    /// Address formatted for `host:port` use.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Command '{command}' failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provisioning cancelled")]
    Cancelled,
}

impl From<ProvisionError> for PipelineError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Provision(other.to_string()),
        }
    }
}

/// Customizes the temporary server.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    async fn provision(
        &self,
        conn: &ConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError>;

    /// Remove a generated public key from the server's authorized keys.
    async fn remove_temporary_key(
        &self,
        conn: &ConnectionInfo,
        public_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError>;
}

fn connection_info(
    state: &BuildState,
    username: &str,
    port: u16,
) -> Result<ConnectionInfo, PipelineError> {
    let address = require(&state.server_address, "server_address")?;
    let key = require(&state.ssh_key, "ssh_key")?;
    Ok(ConnectionInfo {
        address: address.address.clone(),
        host: address.host(),
        port,
        username: username.to_string(),
        private_key_path: key.private_key_path.clone(),
    })
}

/// Runs the provisioner against the server.
pub struct Provision {
    provisioner: Arc<dyn Provisioner>,
    username: String,
    port: u16,
}

impl Provision {
    pub fn new(provisioner: Arc<dyn Provisioner>, username: String, port: u16) -> Self {
        Self {
            provisioner,
            username,
            port,
        }
    }
}

#[async_trait]
impl Step<BuildState> for Provision {
    fn name(&self) -> &'static str {
        "provision"
    }

    async fn run(&self, state: &mut BuildState) -> StepAction {
        let conn = match connection_info(state, &self.username, self.port) {
            Ok(conn) => conn,
            Err(e) => return halt(state, e),
        };

        info!("Provisioning {} with {}", conn.address, self.provisioner.name());
        match self.provisioner.provision(&conn, state.cancellation()).await {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, e.into()),
        }
    }
}

/// Removes a generated key from the server before it is snapshotted.
pub struct CleanupTempKeys {
    provisioner: Arc<dyn Provisioner>,
    username: String,
    port: u16,
    enabled: bool,
}

impl CleanupTempKeys {
    /// `enabled` is false when there is no communicator to run it over.
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        username: String,
        port: u16,
        enabled: bool,
    ) -> Self {
        Self {
            provisioner,
            username,
            port,
            enabled,
        }
    }
}

#[async_trait]
impl Step<BuildState> for CleanupTempKeys {
    fn name(&self) -> &'static str {
        "cleanup_temp_keys"
    }

    async fn run(&self, state: &mut BuildState) -> StepAction {
        let generated = state.ssh_key.as_ref().map(|k| k.generated).unwrap_or(false);
        if !self.enabled || !generated {
            return StepAction::Continue;
        }

        let conn = match connection_info(state, &self.username, self.port) {
            Ok(conn) => conn,
            Err(e) => return halt(state, e),
        };
        let public_key = state
            .ssh_key
            .as_ref()
            .map(|k| k.public_key.clone())
            .unwrap_or_default();

        info!("Removing temporary SSH key from {}", conn.address);
        let removed = self
            .provisioner
            .remove_temporary_key(&conn, &public_key, state.cancellation())
            .await;
        match removed {
            Ok(()) => StepAction::Continue,
            Err(ProvisionError::Cancelled) => halt(state, PipelineError::Cancelled),
            Err(e) => {
                warn!("Failed to remove temporary SSH key: {}", e);
                StepAction::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{SelectedAddress, SshKeyPair};
    use crate::driver::{AccessClass, AddressFamily};
    use crate::testing::{MockDriver, MockProvisioner};

    fn ready_state(generated: bool) -> BuildState {
        let mut state = BuildState::new(Arc::new(MockDriver::new()), CancellationToken::new());
        state.server_address = Some(SelectedAddress {
            address: "2a04:3540::1".to_string(),
            family: AddressFamily::IPv6,
            access: AccessClass::Public,
        });
        state.ssh_key = Some(SshKeyPair {
            public_key: "ssh-rsa AAAA imagesmith-temporary-key".to_string(),
            private_key_path: Some("/tmp/key".into()),
            generated,
        });
        state
    }

    #[tokio::test]
    async fn test_provision_passes_connection_info() {
        let provisioner = Arc::new(MockProvisioner::new());
        let step = Provision::new(provisioner.clone(), "root".to_string(), 22);
        let mut state = ready_state(true);

        assert_eq!(step.run(&mut state).await, StepAction::Continue);
        let calls = provisioner.recorded_provisions().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].host, "[2a04:3540::1]");
        assert_eq!(calls[0].address, "2a04:3540::1");
        assert_eq!(calls[0].username, "root");
    }

    #[tokio::test]
    async fn test_provision_failure_halts() {
        let provisioner = Arc::new(MockProvisioner::new());
        provisioner.fail_next_provision("apt-get failed").await;
        let step = Provision::new(provisioner, "root".to_string(), 22);
        let mut state = ready_state(true);

        assert_eq!(step.run(&mut state).await, StepAction::Halt);
        assert!(matches!(state.error(), Some(PipelineError::Provision(_))));
    }

    #[tokio::test]
    async fn test_provision_without_address_halts() {
        let provisioner = Arc::new(MockProvisioner::new());
        let step = Provision::new(provisioner, "root".to_string(), 22);
        let mut state = BuildState::new(Arc::new(MockDriver::new()), CancellationToken::new());

        assert_eq!(step.run(&mut state).await, StepAction::Halt);
        assert!(matches!(
            state.error(),
            Some(PipelineError::MissingState("server_address"))
        ));
    }

    #[tokio::test]
    async fn test_temp_key_removed_only_when_generated() {
        let provisioner = Arc::new(MockProvisioner::new());
        let step = CleanupTempKeys::new(provisioner.clone(), "root".to_string(), 22, true);

        step.run(&mut ready_state(false)).await;
        assert!(provisioner.recorded_key_removals().await.is_empty());

        step.run(&mut ready_state(true)).await;
        assert_eq!(
            provisioner.recorded_key_removals().await,
            vec!["ssh-rsa AAAA imagesmith-temporary-key".to_string()]
        );
    }

    #[tokio::test]
    async fn test_temp_key_step_skipped_without_communicator() {
        let provisioner = Arc::new(MockProvisioner::new());
        let step = CleanupTempKeys::new(provisioner.clone(), "root".to_string(), 22, false);
        assert_eq!(step.run(&mut ready_state(true)).await, StepAction::Continue);
        assert!(provisioner.recorded_key_removals().await.is_empty());
    }
}
