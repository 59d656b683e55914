//! In-memory cloud platform.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::driver::{
    cancellable, create_server_with_metadata_retry, AccessClass, AddressFamily, ContentType,
    Created, Driver, DriverError, ImportSource, IpAddress, Server, ServerManager, ServerSpec, ServerState,
    ServerStorageDevice, Storage, StorageImport, StorageManager, StorageState, StorageType,
    TemplateManager, ZoneManager, METADATA_DISABLED_CODE,
};
use crate::import::digest_bytes;

/// Driver operation, used to record calls and target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateServer,
    StopServer,
    DeleteServer,
    GetServerStorage,
    GetStorage,
    RenameStorage,
    CloneStorage,
    CreateStorage,
    ImportStorage,
    WaitStorageOnline,
    DeleteStorage,
    CreateTemplate,
    GetTemplateByName,
    DeleteTemplate,
    AvailableZones,
}

/// A driver call seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub operation: Operation,
    /// UUID, title or name the call was about.
    pub target: String,
    pub zone: Option<String>,
}

/// What an injected failure returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedError {
    Rejected { code: String, message: String },
    Timeout,
    NotFound,
    Cancelled,
}

impl InjectedError {
    pub fn rejected(code: &str) -> Self {
        InjectedError::Rejected {
            code: code.to_string(),
            message: format!("injected {} failure", code),
        }
    }

    fn to_driver_error(&self, operation: Operation, target: &str) -> DriverError {
        match self {
            InjectedError::Rejected { code, message } => DriverError::rejected(code, message),
            InjectedError::Timeout => DriverError::Timeout {
                what: format!("{:?} of {}", operation, target),
                after: Duration::from_secs(0),
            },
            InjectedError::NotFound => DriverError::NotFound(target.to_string()),
            InjectedError::Cancelled => DriverError::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    operation: Operation,
    zone: Option<String>,
    error: InjectedError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug)]
struct Platform {
    zones: Vec<String>,
    storages: Vec<Storage>,
    servers: Vec<Server>,
    calls: Vec<DriverCall>,
    failures: Vec<InjectedFailure>,
    /// Failures raised after the resource was created.
    settle_failures: Vec<InjectedFailure>,
    corrupt_uploads: bool,
    checksum_override: Option<String>,
    metadata_required: bool,
    assigned_addresses: Option<Vec<IpAddress>>,
    latency: Duration,
    clone_jitter: Duration,
    next_address: u32,
}

impl Platform {
    fn storage(&self, uuid: &str) -> Option<&Storage> {
        self.storages.iter().find(|s| s.uuid == uuid)
    }

    fn storage_zone(&self, uuid: &str) -> Option<String> {
        self.storage(uuid).map(|s| s.zone.clone())
    }

    fn server_zone(&self, uuid: &str) -> Option<String> {
        self.servers
            .iter()
            .find(|s| s.uuid == uuid)
            .map(|s| s.zone.clone())
    }

    fn take_failure(&mut self, operation: Operation, zone: Option<&str>) -> Option<InjectedError> {
        take_matching(&mut self.failures, operation, zone)
    }

    fn take_settle_failure(
        &mut self,
        operation: Operation,
        zone: Option<&str>,
    ) -> Option<InjectedError> {
        take_matching(&mut self.settle_failures, operation, zone)
    }

    /// Fail with an injected post-create error, if one targets `operation`.
    fn settle(
        &mut self,
        operation: Operation,
        zone: Option<&str>,
        created: Created,
    ) -> Result<(), DriverError> {
        match self.take_settle_failure(operation, zone) {
            Some(error) => Err(DriverError::unsettled(
                created.clone(),
                error.to_driver_error(operation, created.uuid()),
            )),
            None => Ok(()),
        }
    }

    fn address_for(&mut self, access: AccessClass, family: AddressFamily) -> String {
        self.next_address += 1;
        let n = self.next_address;
        match (access, family) {
            (AccessClass::Public, AddressFamily::IPv4) => format!("94.237.0.{}", n),
            (AccessClass::Utility, AddressFamily::IPv4) => format!("10.4.0.{}", n),
            (AccessClass::Private, AddressFamily::IPv4) => format!("172.16.0.{}", n),
            (_, AddressFamily::IPv6) => format!("2a04:3540:1000::{:x}", n),
        }
    }
}

fn take_matching(
    failures: &mut Vec<InjectedFailure>,
    operation: Operation,
    zone: Option<&str>,
) -> Option<InjectedError> {
    let index = failures.iter().position(|f| {
        f.operation == operation
            && f.zone
                .as_deref()
                .map(|wanted| Some(wanted) == zone)
                .unwrap_or(true)
    })?;

    let failure = &mut failures[index];
    let error = failure.error.clone();
    if let Some(remaining) = failure.remaining.as_mut() {
        *remaining -= 1;
        if *remaining == 0 {
            failures.remove(index);
        }
    }
    Some(error)
}

fn new_storage(title: &str, zone: &str, size: u32, tier: &str, kind: StorageType) -> Storage {
    Storage {
        uuid: uuid::Uuid::new_v4().to_string(),
        title: title.to_string(),
        size,
        tier: tier.to_string(),
        zone: zone.to_string(),
        state: StorageState::Online,
        kind,
        created: Some(Utc::now()),
    }
}

/// Flip the first byte of the written content: the raw data itself, or
/// the first decompressed byte of a gzip stream.
fn corrupt_first_payload_byte(data: &mut Vec<u8>, content_type: ContentType) {
    use std::io::{Read, Write};

    match content_type {
        ContentType::OctetStream => {
            if let Some(byte) = data.first_mut() {
                *byte ^= 0xff;
            }
        }
        ContentType::Gzip => {
            let mut plain = Vec::new();
            if flate2::read::MultiGzDecoder::new(&data[..])
                .read_to_end(&mut plain)
                .is_err()
            {
                return;
            }
            if let Some(byte) = plain.first_mut() {
                *byte ^= 0xff;
            }
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            if encoder.write_all(&plain).is_ok() {
                if let Ok(encoded) = encoder.finish() {
                    *data = encoded;
                }
            }
        }
    }
}

/// In-memory implementation of every driver capability.
///
/// Storages live in one insertion-ordered list, servers in another. Each
/// call is recorded, may be delayed by the configured latency (clones also
/// get a per-clone jitter), honors cancellation, and can be made to fail
/// per operation and zone.
///
/// # Example
///
/// ```rust,ignore
/// use imagesmith_core::testing::{MockDriver, InjectedError, Operation};
///
/// let driver = MockDriver::new();
/// let source = driver.add_template("Ubuntu Server 24.04", "fi-hel1").await;
/// driver
///     .fail_on(Operation::CloneStorage, Some("de-fra1"), InjectedError::rejected("QUOTA_EXCEEDED"))
///     .await;
/// ```
#[derive(Debug, Clone)]
pub struct MockDriver {
    platform: Arc<RwLock<Platform>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Platform with a handful of zones and nothing else.
    pub fn new() -> Self {
        Self {
            platform: Arc::new(RwLock::new(Platform {
                zones: ["fi-hel1", "fi-hel2", "de-fra1", "nl-ams1", "uk-lon1"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                storages: Vec::new(),
                servers: Vec::new(),
                calls: Vec::new(),
                failures: Vec::new(),
                settle_failures: Vec::new(),
                corrupt_uploads: false,
                checksum_override: None,
                metadata_required: false,
                assigned_addresses: None,
                latency: Duration::ZERO,
                clone_jitter: Duration::ZERO,
                next_address: 0,
            })),
        }
    }

    pub async fn set_zones(&self, zones: &[&str]) {
        self.platform.write().await.zones = zones.iter().map(|z| z.to_string()).collect();
    }

    pub async fn add_storage(&self, storage: Storage) -> Storage {
        self.platform.write().await.storages.push(storage.clone());
        storage
    }

    /// Seed an online template.
    pub async fn add_template(&self, title: &str, zone: &str) -> Storage {
        self.add_storage(new_storage(title, zone, 10, "maxiops", StorageType::Template))
            .await
    }

    /// Seed an online disk.
    pub async fn add_disk(&self, title: &str, zone: &str) -> Storage {
        self.add_storage(new_storage(title, zone, 10, "maxiops", StorageType::Disk))
            .await
    }

    pub async fn storages(&self) -> Vec<Storage> {
        self.platform.read().await.storages.clone()
    }

    pub async fn templates(&self) -> Vec<Storage> {
        self.storages()
            .await
            .into_iter()
            .filter(Storage::is_template)
            .collect()
    }

    pub async fn servers(&self) -> Vec<Server> {
        self.platform.read().await.servers.clone()
    }

    pub async fn calls(&self) -> Vec<DriverCall> {
        self.platform.read().await.calls.clone()
    }

    pub async fn calls_for(&self, operation: Operation) -> Vec<DriverCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect()
    }

    /// Fail every `operation` call (in `zone`, if given).
    pub async fn fail_on(&self, operation: Operation, zone: Option<&str>, error: InjectedError) {
        self.inject(operation, zone, error, None).await;
    }

    /// Fail the next `operation` call (in `zone`, if given) only.
    pub async fn fail_once_on(
        &self,
        operation: Operation,
        zone: Option<&str>,
        error: InjectedError,
    ) {
        self.inject(operation, zone, error, Some(1)).await;
    }

    async fn inject(
        &self,
        operation: Operation,
        zone: Option<&str>,
        error: InjectedError,
        remaining: Option<usize>,
    ) {
        self.platform.write().await.failures.push(InjectedFailure {
            operation,
            zone: zone.map(str::to_string),
            error,
            remaining,
        });
    }

    /// Let every `operation` call (in `zone`, if given) create its
    /// resource and then fail as if waiting for it had failed. Applies to
    /// `CreateServer`, `CloneStorage`, `CreateStorage` and `CreateTemplate`.
    pub async fn fail_after_create(
        &self,
        operation: Operation,
        zone: Option<&str>,
        error: InjectedError,
    ) {
        self.platform.write().await.settle_failures.push(InjectedFailure {
            operation,
            zone: zone.map(str::to_string),
            error,
            remaining: None,
        });
    }

    pub async fn clear_failures(&self) {
        let mut platform = self.platform.write().await;
        platform.failures.clear();
        platform.settle_failures.clear();
    }

    /// Flip one byte of every received upload before it is written.
    pub async fn corrupt_uploads(&self) {
        self.platform.write().await.corrupt_uploads = true;
    }

    /// Report this checksum from every import instead of the real one.
    pub async fn set_checksum_override(&self, checksum: &str) {
        self.platform.write().await.checksum_override = Some(checksum.to_string());
    }

    /// Reject server creation unless the metadata service is enabled.
    pub async fn require_metadata(&self) {
        self.platform.write().await.metadata_required = true;
    }

    /// Addresses given to every new server instead of generated ones.
    pub async fn set_assigned_addresses(&self, addresses: Vec<IpAddress>) {
        self.platform.write().await.assigned_addresses = Some(addresses);
    }

    /// Delay applied to every call.
    pub async fn set_latency(&self, latency: Duration) {
        self.platform.write().await.latency = latency;
    }

    /// Upper bound of the extra delay given to each clone.
    pub async fn set_clone_jitter(&self, jitter: Duration) {
        self.platform.write().await.clone_jitter = jitter;
    }

    /// Record the call, wait out the latency and apply injected failures.
    async fn enter(
        &self,
        operation: Operation,
        target: &str,
        zone: Option<&str>,
        extra_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let latency = {
            let mut platform = self.platform.write().await;
            platform.calls.push(DriverCall {
                operation,
                target: target.to_string(),
                zone: zone.map(str::to_string),
            });
            platform.latency
        };

        cancellable(cancel, async {
            let delay = latency + extra_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        })
        .await?;

        let failure = self.platform.write().await.take_failure(operation, zone);
        match failure {
            Some(error) => Err(error.to_driver_error(operation, target)),
            None => Ok(()),
        }
    }

    async fn storage_zone(&self, uuid: &str) -> Option<String> {
        self.platform.read().await.storage_zone(uuid)
    }

    async fn find_storage(&self, uuid: &str) -> Result<Storage, DriverError> {
        self.platform
            .read()
            .await
            .storage(uuid)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("storage {}", uuid)))
    }

    async fn create_server_once(
        &self,
        spec: ServerSpec,
        cancel: &CancellationToken,
    ) -> Result<Server, DriverError> {
        self.enter(
            Operation::CreateServer,
            &spec.title,
            Some(spec.zone.as_str()),
            Duration::ZERO,
            cancel,
        )
            .await?;

        let mut platform = self.platform.write().await;
        if platform.metadata_required && !spec.metadata {
            return Err(DriverError::rejected(
                METADATA_DISABLED_CODE,
                "the selected template requires the metadata service",
            ));
        }
        if platform.storage(&spec.source_storage).is_none() {
            return Err(DriverError::NotFound(format!(
                "storage {}",
                spec.source_storage
            )));
        }

        let disk = new_storage(
            &format!("{}-disk1", spec.title),
            &spec.zone,
            spec.storage_size,
            &spec.storage_tier,
            StorageType::Disk,
        );
        let ip_addresses = match platform.assigned_addresses.clone() {
            Some(addresses) => addresses,
            None => {
                let mut addresses = Vec::new();
                for iface in &spec.networking {
                    for ip in &iface.ip_addresses {
                        let address = match &ip.address {
                            Some(literal) => literal.clone(),
                            None => platform.address_for(iface.access, ip.family),
                        };
                        addresses.push(IpAddress {
                            access: iface.access,
                            family: ip.family,
                            address,
                        });
                    }
                }
                addresses
            }
        };

        let server = Server {
            uuid: uuid::Uuid::new_v4().to_string(),
            title: spec.title.clone(),
            plan: spec.plan.clone(),
            zone: spec.zone.clone(),
            state: ServerState::Started,
            ip_addresses,
            storage_devices: vec![ServerStorageDevice {
                uuid: disk.uuid.clone(),
                title: disk.title.clone(),
                size: disk.size,
                kind: StorageType::Disk,
            }],
        };
        platform.storages.push(disk);
        platform.servers.push(server.clone());
        platform.settle(
            Operation::CreateServer,
            Some(spec.zone.as_str()),
            Created::Server(server.clone()),
        )?;
        Ok(server)
    }
}

#[async_trait]
impl ServerManager for MockDriver {
    async fn create_server(
        &self,
        spec: &ServerSpec,
        cancel: &CancellationToken,
    ) -> Result<Server, DriverError> {
        create_server_with_metadata_retry(spec, move |spec| self.create_server_once(spec, cancel))
            .await
    }

    async fn stop_server(&self, uuid: &str, cancel: &CancellationToken) -> Result<(), DriverError> {
        let zone = self.platform.read().await.server_zone(uuid);
        self.enter(Operation::StopServer, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        let mut platform = self.platform.write().await;
        let server = platform
            .servers
            .iter_mut()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| DriverError::NotFound(format!("server {}", uuid)))?;
        server.state = ServerState::Stopped;
        Ok(())
    }

    async fn delete_server(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let zone = self.platform.read().await.server_zone(uuid);
        self.enter(Operation::DeleteServer, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        let mut platform = self.platform.write().await;
        let index = platform
            .servers
            .iter()
            .position(|s| s.uuid == uuid)
            .ok_or_else(|| DriverError::NotFound(format!("server {}", uuid)))?;
        if platform.servers[index].state != ServerState::Stopped {
            return Err(DriverError::rejected(
                "SERVER_STATE_ILLEGAL",
                "the server must be stopped before it is deleted",
            ));
        }
        let server = platform.servers.remove(index);
        let attached: Vec<String> = server.storage_devices.iter().map(|d| d.uuid.clone()).collect();
        platform.storages.retain(|s| !attached.contains(&s.uuid));
        Ok(())
    }

    async fn get_server_storage(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<ServerStorageDevice, DriverError> {
        let zone = self.platform.read().await.server_zone(uuid);
        self.enter(Operation::GetServerStorage, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        let platform = self.platform.read().await;
        let server = platform
            .servers
            .iter()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| DriverError::NotFound(format!("server {}", uuid)))?;
        server
            .boot_storage()
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("boot storage of server {}", uuid)))
    }
}

#[async_trait]
impl StorageManager for MockDriver {
    async fn get_storage(
        &self,
        uuid: Option<&str>,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let target = uuid.or(name).unwrap_or_default();
        let zone = match uuid {
            Some(uuid) => self.storage_zone(uuid).await,
            None => None,
        };
        self.enter(Operation::GetStorage, target, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        if let Some(uuid) = uuid.filter(|u| !u.is_empty()) {
            return self.find_storage(uuid).await;
        }
        let needle = name.unwrap_or_default().to_lowercase();
        self.platform
            .read()
            .await
            .storages
            .iter()
            .find(|s| s.is_template() && s.title.to_lowercase().contains(&needle))
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("template matching '{}'", needle)))
    }

    async fn rename_storage(
        &self,
        uuid: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let zone = self.storage_zone(uuid).await;
        self.enter(Operation::RenameStorage, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        let mut platform = self.platform.write().await;
        let storage = platform
            .storages
            .iter_mut()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| DriverError::NotFound(format!("storage {}", uuid)))?;
        storage.title = title.to_string();
        Ok(storage.clone())
    }

    async fn clone_storage(
        &self,
        uuid: &str,
        zone: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let clone = {
            let source = self.find_storage(uuid).await;
            let tier = source.as_ref().map(|s| s.tier.clone()).unwrap_or_default();
            let size = source.as_ref().map(|s| s.size).unwrap_or_default();
            new_storage(title, zone, size, &tier, StorageType::Disk)
        };

        let jitter = {
            let bound = self.platform.read().await.clone_jitter.as_millis() as u64;
            if bound == 0 {
                Duration::ZERO
            } else {
                let seed = uuid::Uuid::parse_str(&clone.uuid)
                    .map(|u| u.as_bytes()[0] as u64)
                    .unwrap_or_default();
                Duration::from_millis(seed % bound)
            }
        };
        self.enter(Operation::CloneStorage, uuid, Some(zone), jitter, cancel)
            .await?;

        self.find_storage(uuid).await?;
        let mut platform = self.platform.write().await;
        if !platform.zones.iter().any(|z| z == zone) {
            return Err(DriverError::rejected(
                "ZONE_INVALID",
                format!("zone {} does not exist", zone),
            ));
        }
        platform.storages.push(clone.clone());
        platform.settle(Operation::CloneStorage, Some(zone), Created::Storage(clone.clone()))?;
        Ok(clone)
    }

    async fn create_storage(
        &self,
        title: &str,
        zone: &str,
        size_gb: u32,
        tier: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        self.enter(Operation::CreateStorage, title, Some(zone), Duration::ZERO, cancel)
            .await?;

        let storage = new_storage(title, zone, size_gb, tier, StorageType::Disk);
        let mut platform = self.platform.write().await;
        platform.storages.push(storage.clone());
        platform.settle(Operation::CreateStorage, Some(zone), Created::Storage(storage.clone()))?;
        Ok(storage)
    }

    async fn import_storage(
        &self,
        uuid: &str,
        content_type: ContentType,
        mut source: ImportSource,
        cancel: &CancellationToken,
    ) -> Result<StorageImport, DriverError> {
        let zone = self.storage_zone(uuid).await;
        self.enter(Operation::ImportStorage, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;
        self.find_storage(uuid).await?;

        let mut data = Vec::new();
        cancellable(cancel, async {
            source.read_to_end(&mut data).await?;
            Ok::<(), DriverError>(())
        })
        .await?;

        let platform = self.platform.read().await;
        if platform.corrupt_uploads {
            corrupt_first_payload_byte(&mut data, content_type);
        }
        let sha256sum = match platform.checksum_override.clone() {
            Some(checksum) => checksum,
            None => digest_bytes(&data, content_type)?,
        };
        Ok(StorageImport {
            sha256sum,
            written_bytes: data.len() as u64,
        })
    }

    async fn wait_storage_online(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let zone = self.storage_zone(uuid).await;
        self.enter(Operation::WaitStorageOnline, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;
        self.find_storage(uuid).await
    }

    async fn delete_storage(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let zone = self.storage_zone(uuid).await;
        self.enter(Operation::DeleteStorage, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        let mut platform = self.platform.write().await;
        let index = platform
            .storages
            .iter()
            .position(|s| s.uuid == uuid)
            .ok_or_else(|| DriverError::NotFound(format!("storage {}", uuid)))?;
        platform.storages.remove(index);
        Ok(())
    }
}

#[async_trait]
impl TemplateManager for MockDriver {
    async fn create_template(
        &self,
        storage_uuid: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let zone = self.storage_zone(storage_uuid).await;
        self.enter(Operation::CreateTemplate, storage_uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        let source = self.find_storage(storage_uuid).await?;
        let template = new_storage(
            title,
            &source.zone,
            source.size,
            &source.tier,
            StorageType::Template,
        );
        let mut platform = self.platform.write().await;
        platform.storages.push(template.clone());
        platform.settle(
            Operation::CreateTemplate,
            Some(source.zone.as_str()),
            Created::Storage(template.clone()),
        )?;
        Ok(template)
    }

    async fn get_template_by_name(
        &self,
        name: &str,
        zone: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Storage>, DriverError> {
        self.enter(Operation::GetTemplateByName, name, Some(zone), Duration::ZERO, cancel)
            .await?;

        Ok(self
            .platform
            .read()
            .await
            .storages
            .iter()
            .find(|s| s.is_template() && s.title == name && s.zone == zone)
            .cloned())
    }

    async fn delete_template(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let zone = self.storage_zone(uuid).await;
        self.enter(Operation::DeleteTemplate, uuid, zone.as_deref(), Duration::ZERO, cancel)
            .await?;

        let mut platform = self.platform.write().await;
        let index = platform
            .storages
            .iter()
            .position(|s| s.uuid == uuid && s.is_template())
            .ok_or_else(|| DriverError::NotFound(format!("template {}", uuid)))?;
        platform.storages.remove(index);
        Ok(())
    }
}

#[async_trait]
impl ZoneManager for MockDriver {
    async fn available_zones(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DriverError> {
        self.enter(Operation::AvailableZones, "zones", None, Duration::ZERO, cancel)
            .await?;
        Ok(self.platform.read().await.zones.clone())
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failure_targets_zone() {
        let driver = MockDriver::new();
        let source = driver.add_disk("disk", "fi-hel1").await;
        driver
            .fail_on(
                Operation::CloneStorage,
                Some("de-fra1"),
                InjectedError::rejected("QUOTA_EXCEEDED"),
            )
            .await;
        let cancel = CancellationToken::new();

        let ok = driver.clone_storage(&source.uuid, "fi-hel2", "c", &cancel).await;
        assert!(ok.is_ok());
        let err = driver
            .clone_storage(&source.uuid, "de-fra1", "c", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some("QUOTA_EXCEEDED"));
        assert_eq!(driver.calls_for(Operation::CloneStorage).await.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_once_clears_after_first_hit() {
        let driver = MockDriver::new();
        driver
            .fail_once_on(Operation::AvailableZones, None, InjectedError::Timeout)
            .await;
        let cancel = CancellationToken::new();

        assert!(driver.available_zones(&cancel).await.unwrap_err().is_timeout());
        assert_eq!(driver.available_zones(&cancel).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_metadata_required_is_retried() {
        let driver = MockDriver::new();
        driver.require_metadata().await;
        let source = driver.add_template("Debian", "fi-hel1").await;

        let spec = ServerSpec {
            title: "imagesmith-custom-test".to_string(),
            hostname: "custom".to_string(),
            zone: "fi-hel1".to_string(),
            plan: "1xCPU-2GB".to_string(),
            source_storage: source.uuid.clone(),
            storage_size: 25,
            storage_tier: "maxiops".to_string(),
            login_user: "root".to_string(),
            ssh_public_key: None,
            networking: Vec::new(),
            metadata: false,
        };
        let server = driver
            .create_server(&spec, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(server.state, ServerState::Started);
        assert_eq!(driver.calls_for(Operation::CreateServer).await.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_call_returns_cancelled() {
        let driver = MockDriver::new();
        driver.set_latency(Duration::from_secs(30)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = driver.available_zones(&cancel).await.unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
    }

    #[tokio::test]
    async fn test_name_lookup_is_case_insensitive_substring() {
        let driver = MockDriver::new();
        driver.add_disk("ubuntu scratch disk", "fi-hel1").await;
        let template = driver.add_template("Ubuntu Server 24.04 LTS", "fi-hel1").await;

        let found = driver
            .get_storage(None, Some("ubuntu server"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.uuid, template.uuid);
    }
}
