use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::ImportState;
use crate::driver::{Driver, Storage};
use crate::pipeline::{cleanup_token, PipelineError};

/// Delete `storages`, skipping ones that no longer exist. Returns the
/// storages that could not be deleted together with the reason.
pub(crate) async fn delete_storages(
    driver: &dyn Driver,
    storages: Vec<Storage>,
) -> Vec<(Storage, PipelineError)> {
    let cancel = cleanup_token();
    let mut failed = Vec::new();

    for storage in storages {
        match delete_if_exists(driver, &storage.uuid, &cancel).await {
            Ok(true) => info!("Deleted storage '{}' ({})", storage.title, storage.uuid),
            Ok(false) => debug!("Storage {} already gone", storage.uuid),
            Err(e) => {
                warn!("Failed to delete storage {}: {}", storage.uuid, e);
                failed.push((storage, e));
            }
        }
    }
    failed
}

/// Cleanup entry point shared by the import steps: delete every tracked
/// storage once. Failures are reported, not retried.
pub(crate) async fn remove_storages(state: &mut ImportState) -> Result<(), PipelineError> {
    let storages = std::mem::take(&mut state.storages);
    if storages.is_empty() {
        return Ok(());
    }

    let total = storages.len();
    let driver = state.driver.clone();
    let failed = delete_storages(driver.as_ref(), storages).await;
    if failed.is_empty() {
        return Ok(());
    }

    Err(PipelineError::PartialFailure {
        operation: "storage cleanup",
        total,
        failures: failed
            .into_iter()
            .map(|(storage, e)| format!("{} ({}): {}", storage.uuid, storage.zone, e))
            .collect(),
    })
}

/// Returns `false` when the storage does not exist.
async fn delete_if_exists(
    driver: &dyn Driver,
    uuid: &str,
    cancel: &CancellationToken,
) -> Result<bool, PipelineError> {
    match driver.get_storage(Some(uuid), None, cancel).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => {
            return Err(PipelineError::driver(
                format!("failed to look up storage {}", uuid),
                e,
            ))
        }
    }
    driver
        .delete_storage(uuid, cancel)
        .await
        .map_err(|e| PipelineError::driver(format!("failed to delete storage {}", uuid), e))?;
    Ok(true)
}
