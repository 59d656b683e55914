use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{
    ContentType, DriverError, ImportSource, Server, ServerSpec, ServerStorageDevice, Storage,
    StorageImport,
};

/// Server lifecycle. Each call returns once the remote transition is done.
#[async_trait]
pub trait ServerManager: Send + Sync {
    /// Create a server and wait until it is started.
    ///
    /// Retried once with the metadata service enabled when the platform
    /// rejects the request because metadata is required.
    async fn create_server(
        &self,
        spec: &ServerSpec,
        cancel: &CancellationToken,
    ) -> Result<Server, DriverError>;

    /// Stop a server and wait until it is stopped.
    async fn stop_server(&self, uuid: &str, cancel: &CancellationToken)
        -> Result<(), DriverError>;

    /// Delete a server together with its storages.
    async fn delete_server(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError>;

    /// The server's boot disk.
    async fn get_server_storage(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<ServerStorageDevice, DriverError>;
}

/// Storage lifecycle.
#[async_trait]
pub trait StorageManager: Send + Sync {
    /// Look a storage up by UUID, or else by case-insensitive title
    /// substring among templates (first match wins).
    async fn get_storage(
        &self,
        uuid: Option<&str>,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError>;

    async fn rename_storage(
        &self,
        uuid: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError>;

    /// Clone a storage into `zone` and wait until the clone is online.
    async fn clone_storage(
        &self,
        uuid: &str,
        zone: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError>;

    /// Create an empty disk and wait until it is online.
    async fn create_storage(
        &self,
        title: &str,
        zone: &str,
        size_gb: u32,
        tier: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError>;

    /// Stream `source` into a storage and wait for the import to finish.
    async fn import_storage(
        &self,
        uuid: &str,
        content_type: ContentType,
        source: ImportSource,
        cancel: &CancellationToken,
    ) -> Result<StorageImport, DriverError>;

    async fn wait_storage_online(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError>;

    async fn delete_storage(&self, uuid: &str, cancel: &CancellationToken)
        -> Result<(), DriverError>;
}

/// Template lifecycle.
#[async_trait]
pub trait TemplateManager: Send + Sync {
    /// Templatize a storage and wait until the template is online.
    async fn create_template(
        &self,
        storage_uuid: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError>;

    /// Template whose title equals `name` in `zone`, if any.
    async fn get_template_by_name(
        &self,
        name: &str,
        zone: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Storage>, DriverError>;

    async fn delete_template(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError>;
}

#[async_trait]
pub trait ZoneManager: Send + Sync {
    /// IDs of the zones available to the account.
    async fn available_zones(&self, cancel: &CancellationToken)
        -> Result<Vec<String>, DriverError>;
}

/// Everything the pipelines need from a cloud backend.
pub trait Driver: ServerManager + StorageManager + TemplateManager + ZoneManager {
    /// Backend name for logging.
    fn name(&self) -> &str;
}
