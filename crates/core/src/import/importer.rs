use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::clone::CloneStorage;
use super::create_storage::CreateStorage;
use super::image::ImageFile;
use super::state::ImportState;
use super::template::CreateTemplate;
use super::upload::UploadImage;
use crate::artifact::{Artifact, ArtifactKind};
use crate::config::{ConfigError, ImportConfig};
use crate::driver::Driver;
use crate::pipeline::{PipelineError, PipelineFailure, Runner, Step};

/// Imports a local image file as a template in one or more zones.
pub struct Importer {
    config: Arc<ImportConfig>,
    driver: Arc<dyn Driver>,
}

impl Importer {
    /// `config` is expected to have passed `validate_import_config`.
    pub fn new(config: ImportConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            config: Arc::new(config),
            driver,
        }
    }

    /// Remote checks run before anything is created: every zone must be
    /// available and, unless replacing, the template name must be free.
    pub async fn preflight(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let available = self
            .driver
            .available_zones(cancel)
            .await
            .map_err(|e| PipelineError::driver("failed to list zones", e))?;

        let mut problems = Vec::new();
        if available.is_empty() {
            problems.push("no zones are available".to_string());
        } else {
            for zone in &self.config.zones {
                if !available.contains(zone) {
                    problems.push(format!("zone '{}' is not available", zone));
                }
            }
        }

        if !self.config.replace_existing {
            for zone in &self.config.zones {
                let existing = self
                    .driver
                    .get_template_by_name(&self.config.template_name, zone, cancel)
                    .await
                    .map_err(|e| PipelineError::driver("failed to look up templates", e))?;
                if let Some(template) = existing {
                    problems.push(format!(
                        "template '{}' already exists in {} ({}), set replace_existing to replace it",
                        template.title, zone, template.uuid
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems).into())
        }
    }

    fn steps(&self, image: Arc<ImageFile>) -> Vec<Box<dyn Step<ImportState>>> {
        vec![
            Box::new(CreateStorage::new(self.config.clone(), image.clone())),
            Box::new(UploadImage::new(image)),
            Box::new(CloneStorage::new(self.config.clone())),
            Box::new(CreateTemplate::new(self.config.clone())),
        ]
    }

    /// Inspect the image, run the preflight checks and the import steps.
    pub async fn run(
        &self,
        image_path: &Path,
        cancel: CancellationToken,
    ) -> Result<Artifact, PipelineFailure> {
        let image = Arc::new(
            ImageFile::inspect(image_path)
                .await
                .map_err(PipelineFailure::before_start)?,
        );
        self.preflight(&cancel)
            .await
            .map_err(PipelineFailure::before_start)?;

        info!(
            "Importing {} as '{}' into {}",
            image.file_name(),
            self.config.template_name,
            self.config.zones.join(", ")
        );

        let runner = Runner::new(self.steps(image.clone()));
        let mut state = ImportState::new(self.driver.clone(), cancel);
        if let Err(mut failure) = runner.run(&mut state).await {
            failure.retained_templates = std::mem::take(&mut state.templates);
            return Err(failure);
        }

        if state.templates.is_empty() {
            return Err(PipelineFailure::before_start(PipelineError::MissingState(
                "templates",
            )));
        }

        let mut artifact = Artifact::new(
            ArtifactKind::Import,
            std::mem::take(&mut state.templates),
            self.driver.clone(),
        );
        artifact.insert_metadata("template_name", self.config.template_name.clone());
        artifact.insert_metadata("size", image.required_storage_size(self.config.storage_size));
        artifact.insert_metadata("source_image", image.file_name());
        Ok(artifact)
    }
}
