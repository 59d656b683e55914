use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::driver::{Driver, Storage};
use crate::pipeline::{PipelineError, StateBag};

/// Shared state of one import run.
pub struct ImportState {
    pub driver: Arc<dyn Driver>,
    cancel: CancellationToken,
    error: Option<PipelineError>,
    /// Storages that still need to be removed: the uploaded disk first,
    /// then its clones.
    pub storages: Vec<Storage>,
    /// Templates produced by this run.
    pub templates: Vec<Storage>,
    /// UUIDs of temporary-named templates whose predecessor was already
    /// deleted. They are never removed by cleanup.
    pub preserved_templates: Vec<String>,
}

impl ImportState {
    pub fn new(driver: Arc<dyn Driver>, cancel: CancellationToken) -> Self {
        Self {
            driver,
            cancel,
            error: None,
            storages: Vec::new(),
            templates: Vec::new(),
            preserved_templates: Vec::new(),
        }
    }
}

impl StateBag for ImportState {
    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    fn put_error(&mut self, error: PipelineError) {
        self.error.get_or_insert(error);
    }

    fn take_error(&mut self) -> Option<PipelineError> {
        self.error.take()
    }
}
