use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::state::BuildState;
use crate::config::BuildConfig;
use crate::pipeline::{
    cleanup_token, halt, require, timestamp, PipelineError, StateBag, Step, StepAction,
};

/// Templatizes the server's boot disk, cloning it first into every extra
/// zone. Clones run one after another.
///
/// Cleanup deletes the clones and any template that never came online;
/// the boot disk goes away with the server. Finished templates are kept.
pub struct CreateTemplate {
    config: Arc<BuildConfig>,
}

impl CreateTemplate {
    pub fn new(config: Arc<BuildConfig>) -> Self {
        Self { config }
    }

    async fn create(&self, state: &mut BuildState) -> Result<(), PipelineError> {
        let server_uuid = require(&state.server, "server")?.uuid.clone();
        let driver = state.driver.clone();
        let cancel = state.cancellation().clone();
        let stamp = timestamp();

        info!("Looking up boot storage of server {}", server_uuid);
        let boot = driver
            .get_server_storage(&server_uuid, &cancel)
            .await
            .map_err(|e| {
                PipelineError::driver(format!("failed to find storage of server {}", server_uuid), e)
            })?;

        let mut sources = vec![boot.uuid.clone()];
        let clone_title = format!("imagesmith-{}-cloned-disk1", stamp);
        for zone in &self.config.clone_zones {
            info!("Cloning storage '{}' to zone {}", boot.title, zone);
            let clone = match driver.clone_storage(&boot.uuid, zone, &clone_title, &cancel).await {
                Ok(clone) => clone,
                Err(e) => {
                    if let Some(clone) = e.created_storage() {
                        state.clone_storages.push(clone.clone());
                    }
                    return Err(PipelineError::driver(
                        format!("failed to clone storage to zone {}", zone),
                        e,
                    ));
                }
            };
            sources.push(clone.uuid.clone());
            state.clone_storages.push(clone);
        }

        let title = self.config.template_title(&stamp);
        for source in &sources {
            info!("Creating template '{}' from storage {}", title, source);
            let template = match driver.create_template(source, &title, &cancel).await {
                Ok(template) => template,
                Err(e) => {
                    if let Some(template) = e.created_storage() {
                        state.pending_templates.push(template.clone());
                    }
                    return Err(PipelineError::driver(
                        format!("failed to create template from {}", source),
                        e,
                    ));
                }
            };
            info!(
                "Template '{}' created in zone {} ({})",
                template.title, template.zone, template.uuid
            );
            state.templates.push(template);
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for CreateTemplate {
    fn name(&self) -> &'static str {
        "create_template"
    }

    async fn run(&self, state: &mut BuildState) -> StepAction {
        match self.create(state).await {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, e),
        }
    }

    async fn cleanup(&self, state: &mut BuildState) -> Result<(), PipelineError> {
        if state.error().is_some() {
            for template in &state.templates {
                warn!(
                    "Keeping template '{}' ({}) in {} created before the build failed",
                    template.title, template.uuid, template.zone
                );
            }
        }

        let cancel = cleanup_token();
        let mut first_error = None;
        for template in std::mem::take(&mut state.pending_templates) {
            info!("Deleting unfinished template '{}' ({})", template.title, template.uuid);
            if let Err(e) = state.driver.delete_template(&template.uuid, &cancel).await {
                if e.is_not_found() {
                    continue;
                }
                warn!("Failed to delete template {}: {}", template.uuid, e);
                first_error.get_or_insert(PipelineError::driver(
                    format!("failed to delete template {}", template.uuid),
                    e,
                ));
            }
        }
        for storage in std::mem::take(&mut state.clone_storages) {
            info!("Deleting cloned storage '{}' ({})", storage.title, storage.uuid);
            if let Err(e) = state.driver.delete_storage(&storage.uuid, &cancel).await {
                if e.is_not_found() {
                    continue;
                }
                warn!("Failed to delete storage {}: {}", storage.uuid, e);
                first_error.get_or_insert(PipelineError::driver(
                    format!("failed to delete storage {}", storage.uuid),
                    e,
                ));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
