use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::cleanup::remove_storages;
use super::image::ImageFile;
use super::state::ImportState;
use crate::config::ImportConfig;
use crate::pipeline::{halt, timestamp, PipelineError, StateBag, Step, StepAction};

/// Creates the empty disk the image is uploaded into, in the first zone.
pub struct CreateStorage {
    config: Arc<ImportConfig>,
    image: Arc<ImageFile>,
}

impl CreateStorage {
    pub fn new(config: Arc<ImportConfig>, image: Arc<ImageFile>) -> Self {
        Self { config, image }
    }
}

#[async_trait]
impl Step<ImportState> for CreateStorage {
    fn name(&self) -> &'static str {
        "create_storage"
    }

    async fn run(&self, state: &mut ImportState) -> StepAction {
        let Some(zone) = self.config.zones.first() else {
            return halt(state, PipelineError::MissingState("zones"));
        };
        let size = self.image.required_storage_size(self.config.storage_size);
        let title = format!("imagesmith-import-{}", timestamp());

        info!(
            "Creating {} GB storage '{}' in {} for {}",
            size,
            title,
            zone,
            self.image.file_name()
        );
        let driver = state.driver.clone();
        let created = driver
            .create_storage(&title, zone, size, &self.config.storage_tier, state.cancellation())
            .await;
        match created {
            Ok(storage) => {
                info!("Storage '{}' ({}) is online", storage.title, storage.uuid);
                state.storages.push(storage);
                StepAction::Continue
            }
            Err(e) => {
                if let Some(storage) = e.created_storage() {
                    state.storages.push(storage.clone());
                }
                halt(
                    state,
                    PipelineError::driver(format!("failed to create storage in {}", zone), e),
                )
            }
        }
    }

    async fn cleanup(&self, state: &mut ImportState) -> Result<(), PipelineError> {
        remove_storages(state).await
    }
}
