use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::cleanup::{delete_storages, remove_storages};
use super::state::ImportState;
use crate::config::ImportConfig;
use crate::driver::{Driver, Storage};
use crate::pipeline::{cleanup_token, halt, timestamp, PipelineError, StateBag, Step, StepAction};

/// Templatizes every imported storage concurrently, one per zone.
///
/// With `replace_existing`, an existing template of the same name is
/// swapped out: create under `<name>-<timestamp>-tmp`, delete the old
/// template, rename the new one.
pub struct CreateTemplate {
    config: Arc<ImportConfig>,
}

impl CreateTemplate {
    pub fn new(config: Arc<ImportConfig>) -> Self {
        Self { config }
    }
}

struct ZoneOutcome {
    zone: String,
    template: Option<Storage>,
    /// The replaced template is gone, so `template` is the only copy.
    predecessor_deleted: bool,
    error: Option<PipelineError>,
}

impl ZoneOutcome {
    fn done(zone: String, template: Storage) -> Self {
        Self {
            zone,
            template: Some(template),
            predecessor_deleted: false,
            error: None,
        }
    }

    fn failed(zone: String, template: Option<Storage>, error: PipelineError) -> Self {
        Self {
            zone,
            template,
            predecessor_deleted: false,
            error: Some(error),
        }
    }
}

async fn create_zone_template(
    driver: Arc<dyn Driver>,
    storage: Storage,
    name: String,
    replace_existing: bool,
    stamp: String,
    cancel: CancellationToken,
) -> ZoneOutcome {
    let zone = storage.zone.clone();

    let existing = if replace_existing {
        match driver.get_template_by_name(&name, &zone, &cancel).await {
            Ok(found) => found,
            Err(e) => {
                let err = PipelineError::driver(format!("failed to look up template '{}'", name), e);
                return ZoneOutcome::failed(zone, None, err);
            }
        }
    } else {
        None
    };

    let title = match &existing {
        Some(_) => format!("{}-{}-tmp", name, stamp),
        None => name.clone(),
    };
    let template = match driver.create_template(&storage.uuid, &title, &cancel).await {
        Ok(template) => template,
        Err(e) => {
            let created = e.created_storage().cloned();
            let err = PipelineError::driver(
                format!("failed to create template from storage {}", storage.uuid),
                e,
            );
            return ZoneOutcome::failed(zone, created, err);
        }
    };
    info!("Template '{}' ({}) created in {}", template.title, template.uuid, zone);

    let Some(existing) = existing else {
        return ZoneOutcome::done(zone, template);
    };

    info!("Replacing template '{}' ({}) in {}", existing.title, existing.uuid, zone);
    if let Err(e) = driver.delete_template(&existing.uuid, &cancel).await {
        let err = PipelineError::driver(
            format!("failed to delete existing template {}", existing.uuid),
            e,
        );
        return ZoneOutcome::failed(zone, Some(template), err);
    }

    match driver.rename_storage(&template.uuid, &name, &cancel).await {
        Ok(renamed) => ZoneOutcome::done(zone, renamed),
        Err(e) => {
            let err = PipelineError::driver(
                format!("failed to rename template {} to '{}'", template.uuid, name),
                e,
            );
            ZoneOutcome {
                predecessor_deleted: true,
                ..ZoneOutcome::failed(zone, Some(template), err)
            }
        }
    }
}

#[async_trait]
impl Step<ImportState> for CreateTemplate {
    fn name(&self) -> &'static str {
        "create_template"
    }

    async fn run(&self, state: &mut ImportState) -> StepAction {
        if state.storages.is_empty() {
            return halt(state, PipelineError::MissingState("storages"));
        }

        let stamp = timestamp();
        let mut tasks = JoinSet::new();
        for storage in state.storages.clone() {
            tasks.spawn(create_zone_template(
                state.driver.clone(),
                storage,
                self.config.template_name.clone(),
                self.config.replace_existing,
                stamp.clone(),
                state.cancellation().clone(),
            ));
        }

        let total = state.storages.len();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    failures.push(format!("template task failed: {}", e));
                    continue;
                }
            };
            if let Some(template) = outcome.template {
                if outcome.predecessor_deleted {
                    state.preserved_templates.push(template.uuid.clone());
                }
                state.templates.push(template);
            }
            if let Some(e) = outcome.error {
                warn!("Template creation failed in {}: {}", outcome.zone, e);
                failures.push(format!("{}: {}", outcome.zone, e));
            }
        }

        if state.cancellation().is_cancelled() {
            return halt(state, PipelineError::Cancelled);
        }
        if !failures.is_empty() {
            return halt(
                state,
                PipelineError::PartialFailure {
                    operation: "template creation",
                    total,
                    failures,
                },
            );
        }

        // intermediate disks are no longer needed; failures are left for cleanup
        let driver = state.driver.clone();
        let storages = std::mem::take(&mut state.storages);
        for (storage, _) in delete_storages(driver.as_ref(), storages).await {
            state.storages.push(storage);
        }
        StepAction::Continue
    }

    async fn cleanup(&self, state: &mut ImportState) -> Result<(), PipelineError> {
        let mut failures = Vec::new();

        if state.error().is_some() && !state.templates.is_empty() {
            let driver = state.driver.clone();
            let cancel = cleanup_token();
            for template in std::mem::take(&mut state.templates) {
                if state.preserved_templates.contains(&template.uuid) {
                    warn!(
                        "Keeping template '{}' ({}) in {}: the template it replaces was already deleted",
                        template.title, template.uuid, template.zone
                    );
                    state.templates.push(template);
                    continue;
                }
                match driver.delete_template(&template.uuid, &cancel).await {
                    Ok(()) => info!("Deleted template '{}' ({})", template.title, template.uuid),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        failures.push(format!("template {}: {}", template.uuid, e));
                        state.templates.push(template);
                    }
                }
            }
        }

        if let Err(e) = remove_storages(state).await {
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::PartialFailure {
                operation: "template cleanup",
                total: failures.len(),
                failures,
            })
        }
    }
}
