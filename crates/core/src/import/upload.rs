use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::cleanup::remove_storages;
use super::digest::DigestingReader;
use super::image::ImageFile;
use super::state::ImportState;
use crate::pipeline::{halt, PipelineError, StateBag, Step, StepAction};

/// Streams the image into the storage and verifies its checksum.
pub struct UploadImage {
    image: Arc<ImageFile>,
}

impl UploadImage {
    pub fn new(image: Arc<ImageFile>) -> Self {
        Self { image }
    }

    async fn upload(&self, state: &ImportState) -> Result<(), PipelineError> {
        let storage = state
            .storages
            .first()
            .ok_or(PipelineError::MissingState("storage"))?;
        let cancel = state.cancellation();

        let file = tokio::fs::File::open(&self.image.path).await?;
        let (reader, digest) = DigestingReader::new(file, self.image.content_type);

        info!(
            "Uploading {} ({}, {} bytes) to storage {}",
            self.image.file_name(),
            self.image.content_type,
            self.image.file_size,
            storage.uuid
        );
        let imported = state
            .driver
            .import_storage(&storage.uuid, self.image.content_type, Box::new(reader), cancel)
            .await
            .map_err(|e| {
                PipelineError::driver(format!("failed to import image to {}", storage.uuid), e)
            })?;
        let local = digest.finish()?;
        debug!(written_bytes = imported.written_bytes, "Import completed");

        // verify only once the storage is usable, so cleanup can delete it
        state
            .driver
            .wait_storage_online(&storage.uuid, cancel)
            .await
            .map_err(|e| {
                PipelineError::driver(format!("storage {} did not come online", storage.uuid), e)
            })?;

        if !imported.sha256sum.eq_ignore_ascii_case(&local) {
            return Err(PipelineError::ChecksumMismatch {
                expected: local,
                actual: imported.sha256sum,
            });
        }
        info!("Upload verified, sha256 {}", local);
        Ok(())
    }
}

#[async_trait]
impl Step<ImportState> for UploadImage {
    fn name(&self) -> &'static str {
        "upload_image"
    }

    async fn run(&self, state: &mut ImportState) -> StepAction {
        match self.upload(state).await {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, e),
        }
    }

    async fn cleanup(&self, state: &mut ImportState) -> Result<(), PipelineError> {
        remove_storages(state).await
    }
}
