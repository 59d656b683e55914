use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connect::Connect;
use super::provision::{CleanupTempKeys, Provision, Provisioner};
use super::server::CreateServer;
use super::ssh_key::{CreateSshKey, SshKeyGenerator, SshKeygen};
use super::state::BuildState;
use super::teardown::TeardownServer;
use super::template::CreateTemplate;
use crate::artifact::{Artifact, ArtifactKind};
use crate::config::{BuildConfig, Communicator};
use crate::driver::Driver;
use crate::pipeline::{PipelineError, PipelineFailure, Runner, Step};

/// Builds a template from a temporary server.
pub struct Builder {
    config: Arc<BuildConfig>,
    driver: Arc<dyn Driver>,
    provisioner: Arc<dyn Provisioner>,
    key_generator: Arc<dyn SshKeyGenerator>,
}

impl Builder {
    /// `config` is expected to have passed `validate_build_config`.
    pub fn new(
        config: BuildConfig,
        driver: Arc<dyn Driver>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            driver,
            provisioner,
            key_generator: Arc::new(SshKeygen::default()),
        }
    }

    pub fn with_key_generator(mut self, generator: Arc<dyn SshKeyGenerator>) -> Self {
        self.key_generator = generator;
        self
    }

    pub fn steps(&self) -> Vec<Box<dyn Step<BuildState>>> {
        let communicate = self.config.communicator != Communicator::None;
        let username = self.config.ssh_username.clone();
        let port = self.config.ssh_port;

        let mut steps: Vec<Box<dyn Step<BuildState>>> = vec![
            Box::new(CreateSshKey::new(
                self.config.ssh_private_key_path.clone(),
                self.config.ssh_public_key_path.clone(),
                self.key_generator.clone(),
            )),
            Box::new(CreateServer::new(self.config.clone())),
            Box::new(Connect::new(port, self.config.state_timeout(), communicate)),
        ];
        if communicate {
            steps.push(Box::new(Provision::new(
                self.provisioner.clone(),
                username.clone(),
                port,
            )));
        }
        steps.push(Box::new(CleanupTempKeys::new(
            self.provisioner.clone(),
            username,
            port,
            communicate,
        )));
        steps.push(Box::new(TeardownServer));
        steps.push(Box::new(CreateTemplate::new(self.config.clone())));
        steps
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<Artifact, PipelineFailure> {
        info!(
            "Building template in {} with {}",
            self.config.zone,
            self.driver.name()
        );

        let runner = Runner::new(self.steps());
        let mut state = BuildState::new(self.driver.clone(), cancel);
        let report = match runner.run(&mut state).await {
            Ok(report) => report,
            Err(mut failure) => {
                failure.retained_templates = std::mem::take(&mut state.templates);
                return Err(failure);
            }
        };
        if !report.cleanup_errors.is_empty() {
            warn!(
                "Build finished with {} cleanup error(s)",
                report.cleanup_errors.len()
            );
        }

        if state.templates.is_empty() {
            return Err(PipelineFailure::before_start(PipelineError::MissingState(
                "templates",
            )));
        }

        let mut artifact = Artifact::new(
            ArtifactKind::Build,
            std::mem::take(&mut state.templates),
            self.driver.clone(),
        );
        if let Some(prefix) = &self.config.template_prefix {
            artifact.insert_metadata("template_prefix", prefix.clone());
        }
        if let Some(name) = &self.config.template_name {
            artifact.insert_metadata("template_name", name.clone());
        }
        for (key, value) in std::mem::take(&mut state.metadata) {
            artifact.insert_metadata(&key, value);
        }
        Ok(artifact)
    }
}
