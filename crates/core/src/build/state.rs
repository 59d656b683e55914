use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::address::SelectedAddress;
use super::ssh_key::SshKeyPair;
use crate::driver::{Driver, Server, Storage};
use crate::pipeline::{PipelineError, StateBag};

/// Shared state of one build run. Every field starts empty and is filled
/// by the step that produces it.
pub struct BuildState {
    pub driver: Arc<dyn Driver>,
    cancel: CancellationToken,
    error: Option<PipelineError>,
    /// Directory holding a generated key pair.
    pub temp_key_dir: Option<PathBuf>,
    pub ssh_key: Option<SshKeyPair>,
    pub source_storage: Option<Storage>,
    /// The temporary server while it exists.
    pub server: Option<Server>,
    pub server_address: Option<SelectedAddress>,
    /// Clones made for extra zones, removed after templatizing.
    pub clone_storages: Vec<Storage>,
    pub templates: Vec<Storage>,
    /// Templates whose creation was accepted but never finished. Removed
    /// by cleanup.
    pub pending_templates: Vec<Storage>,
    /// Values exported through the artifact.
    pub metadata: BTreeMap<String, Value>,
}

impl BuildState {
    pub fn new(driver: Arc<dyn Driver>, cancel: CancellationToken) -> Self {
        Self {
            driver,
            cancel,
            error: None,
            temp_key_dir: None,
            ssh_key: None,
            source_storage: None,
            server: None,
            server_address: None,
            clone_storages: Vec::new(),
            templates: Vec::new(),
            pending_templates: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub(crate) fn record(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

impl StateBag for BuildState {
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
