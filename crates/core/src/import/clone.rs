use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::cleanup::remove_storages;
use super::state::ImportState;
use crate::config::ImportConfig;
use crate::pipeline::{halt, PipelineError, StateBag, Step, StepAction};

/// Clones the uploaded storage to every other zone concurrently.
///
/// All clones start from the first zone's storage. Every task is awaited
/// even after a failure; clones that succeeded are tracked for cleanup.
pub struct CloneStorage {
    config: Arc<ImportConfig>,
}

impl CloneStorage {
    pub fn new(config: Arc<ImportConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Step<ImportState> for CloneStorage {
    fn name(&self) -> &'static str {
        "clone_storage"
    }

    async fn run(&self, state: &mut ImportState) -> StepAction {
        let targets = self.config.zones.get(1..).unwrap_or_default();
        if targets.is_empty() {
            return StepAction::Continue;
        }
        let Some(source) = state.storages.first().cloned() else {
            return halt(state, PipelineError::MissingState("storage"));
        };

        let mut tasks = JoinSet::new();
        for zone in targets {
            let driver = state.driver.clone();
            let cancel = state.cancellation().clone();
            let source_uuid = source.uuid.clone();
            let zone = zone.clone();
            let title = format!("{}-{}", source.title, zone);
            info!("Cloning storage {} to {}", source_uuid, zone);
            tasks.spawn(async move {
                let result = driver
                    .clone_storage(&source_uuid, &zone, &title, &cancel)
                    .await;
                (zone, result)
            });
        }

        let total = targets.len();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((zone, Ok(storage))) => {
                    info!("Clone {} in {} is online", storage.uuid, zone);
                    state.storages.push(storage);
                }
                Ok((zone, Err(e))) => {
                    warn!("Failed to clone storage to {}: {}", zone, e);
                    if let Some(clone) = e.created_storage() {
                        state.storages.push(clone.clone());
                    }
                    failures.push(format!("{}: {}", zone, e));
                }
                Err(e) => failures.push(format!("clone task failed: {}", e)),
            }
        }

        if state.cancellation().is_cancelled() {
            return halt(state, PipelineError::Cancelled);
        }
        if !failures.is_empty() {
            return halt(
                state,
                PipelineError::PartialFailure {
                    operation: "clone",
                    total,
                    failures,
                },
            );
        }
        info!("Storage {} cloned to {} zones", source.uuid, total);
        StepAction::Continue
    }

    async fn cleanup(&self, state: &mut ImportState) -> Result<(), PipelineError> {
        remove_storages(state).await
    }
}
