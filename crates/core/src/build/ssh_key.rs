use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::state::BuildState;
use crate::pipeline::{halt, PipelineError, Step, StepAction};

/// Comment attached to generated keys, used to find them again on the
/// server.
pub const TEMPORARY_KEY_COMMENT: &str = "imagesmith-temporary-key";

/// Key pair used to log into the temporary server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    /// OpenSSH public key line.
    pub public_key: String,
    pub private_key_path: Option<PathBuf>,
    /// Generated for this run (as opposed to read from configured files).
    pub generated: bool,
}

/// Produces a fresh key pair inside `dir`.
#[async_trait]
pub trait SshKeyGenerator: Send + Sync {
    async fn generate(&self, dir: &Path) -> Result<SshKeyPair, PipelineError>;
}

/// Generates RSA keys with the system `ssh-keygen`.
#[derive(Debug, Clone)]
pub struct SshKeygen {
    pub program: String,
    pub bits: u32,
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self {
            program: "ssh-keygen".to_string(),
            bits: 3072,
        }
    }
}

#[async_trait]
impl SshKeyGenerator for SshKeygen {
    async fn generate(&self, dir: &Path) -> Result<SshKeyPair, PipelineError> {
        let private_key_path = dir.join("id_rsa");
        let output = Command::new(&self.program)
            .args(["-q", "-t", "rsa", "-b", &self.bits.to_string(), "-N", ""])
            .args(["-C", TEMPORARY_KEY_COMMENT, "-f"])
            .arg(&private_key_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PipelineError::SshKey(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(PipelineError::SshKey(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let public_key = tokio::fs::read_to_string(dir.join("id_rsa.pub")).await?;
        Ok(SshKeyPair {
            public_key: public_key.trim().to_string(),
            private_key_path: Some(private_key_path),
            generated: true,
        })
    }
}

/// Provides the key pair: configured files, or a generated temporary pair.
pub struct CreateSshKey {
    private_key_path: Option<PathBuf>,
    public_key_path: Option<PathBuf>,
    generator: Arc<dyn SshKeyGenerator>,
}

impl CreateSshKey {
    pub fn new(
        private_key_path: Option<PathBuf>,
        public_key_path: Option<PathBuf>,
        generator: Arc<dyn SshKeyGenerator>,
    ) -> Self {
        Self {
            private_key_path,
            public_key_path,
            generator,
        }
    }

    async fn configured_key(
        private_key_path: &Path,
        public_key_path: &Path,
    ) -> Result<SshKeyPair, PipelineError> {
        let public_key = tokio::fs::read_to_string(public_key_path)
            .await
            .map_err(|e| {
                PipelineError::SshKey(format!(
                    "failed to read public key {}: {}",
                    public_key_path.display(),
                    e
                ))
            })?;
        Ok(SshKeyPair {
            public_key: public_key.trim().to_string(),
            private_key_path: Some(private_key_path.to_path_buf()),
            generated: false,
        })
    }
}

#[async_trait]
impl Step<BuildState> for CreateSshKey {
    fn name(&self) -> &'static str {
        "create_ssh_key"
    }

    async fn run(&self, state: &mut BuildState) -> StepAction {
        if let (Some(private), Some(public)) = (&self.private_key_path, &self.public_key_path) {
            info!("Using SSH key {}", public.display());
            return match Self::configured_key(private, public).await {
                Ok(pair) => {
                    state.ssh_key = Some(pair);
                    StepAction::Continue
                }
                Err(e) => halt(state, e),
            };
        }

        let dir = std::env::temp_dir().join(format!("imagesmith-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return halt(state, e.into());
        }
        state.temp_key_dir = Some(dir.clone());

        info!("Creating temporary SSH key");
        match self.generator.generate(&dir).await {
            Ok(pair) => {
                debug!("Temporary SSH key written to {}", dir.display());
                state.ssh_key = Some(pair);
                StepAction::Continue
            }
            Err(e) => halt(state, e),
        }
    }

    async fn cleanup(&self, state: &mut BuildState) -> Result<(), PipelineError> {
        let Some(dir) = state.temp_key_dir.take() else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove temporary key directory {}: {}", dir.display(), e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StateBag;
    use crate::testing::{MockDriver, StaticKeyGenerator};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn state() -> BuildState {
        BuildState::new(Arc::new(MockDriver::new()), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_uses_configured_key_files() {
        let dir = TempDir::new().unwrap();
        let public = dir.path().join("id.pub");
        std::fs::write(&public, "ssh-ed25519 AAAAC3Nza user@host\n").unwrap();

        let step = CreateSshKey::new(
            Some(dir.path().join("id")),
            Some(public),
            Arc::new(StaticKeyGenerator::default()),
        );
        let mut state = state();
        assert_eq!(step.run(&mut state).await, StepAction::Continue);

        let pair = state.ssh_key.clone().unwrap();
        assert_eq!(pair.public_key, "ssh-ed25519 AAAAC3Nza user@host");
        assert!(!pair.generated);
        assert!(state.temp_key_dir.is_none());
        step.cleanup(&mut state).await.unwrap();
    }

    #[tokio::test]
    async fn test_generated_key_dir_removed_on_cleanup() {
        let step = CreateSshKey::new(None, None, Arc::new(StaticKeyGenerator::default()));
        let mut state = state();
        assert_eq!(step.run(&mut state).await, StepAction::Continue);

        let dir = state.temp_key_dir.clone().unwrap();
        assert!(dir.exists());
        assert!(state.ssh_key.as_ref().unwrap().generated);

        step.cleanup(&mut state).await.unwrap();
        assert!(!dir.exists());
        // second cleanup is a no-op
        step.cleanup(&mut state).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_public_key_halts() {
        let step = CreateSshKey::new(
            Some("/nonexistent/id".into()),
            Some("/nonexistent/id.pub".into()),
            Arc::new(StaticKeyGenerator::default()),
        );
        let mut state = state();
        assert_eq!(step.run(&mut state).await, StepAction::Halt);
        assert!(matches!(state.error(), Some(PipelineError::SshKey(_))));
    }

    #[tokio::test]
    async fn test_cleanup_without_run_is_noop() {
        let step = CreateSshKey::new(None, None, Arc::new(StaticKeyGenerator::default()));
        step.cleanup(&mut state()).await.unwrap();
    }
}
