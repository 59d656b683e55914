//! Types shared by every driver backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The platform refused the request.
    #[error("API request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A desired state was not reached in time.
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unexpected API response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The create request was accepted but the resource never reached the
    /// requested state. `created` still exists on the platform.
    #[error("{source} (created {})", .created.uuid())]
    Unsettled {
        created: Box<Created>,
        #[source]
        source: Box<DriverError>,
    },
}

/// A resource whose create request the platform accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created {
    Server(Server),
    Storage(Storage),
}

impl Created {
    pub fn uuid(&self) -> &str {
        match self {
            Created::Server(server) => &server.uuid,
            Created::Storage(storage) => &storage.uuid,
        }
    }
}

impl DriverError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Platform error code, when the request was rejected.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            DriverError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Wrap the failure of the wait that followed a successful create.
    pub fn unsettled(created: Created, source: DriverError) -> Self {
        DriverError::Unsettled {
            created: Box::new(created),
            source: Box::new(source),
        }
    }

    /// Server left behind by a create whose wait failed.
    pub fn created_server(&self) -> Option<&Server> {
        match self {
            DriverError::Unsettled { created, .. } => match created.as_ref() {
                Created::Server(server) => Some(server),
                Created::Storage(_) => None,
            },
            _ => None,
        }
    }

    /// Storage left behind by a create whose wait failed.
    pub fn created_storage(&self) -> Option<&Storage> {
        match self {
            DriverError::Unsettled { created, .. } => match created.as_ref() {
                Created::Storage(storage) => Some(storage),
                Created::Server(_) => None,
            },
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            DriverError::Timeout { .. } => true,
            DriverError::Unsettled { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            DriverError::Cancelled => true,
            DriverError::Unsettled { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}

/// Network access class of an interface or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessClass {
    Public,
    Private,
    Utility,
}

impl AccessClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessClass::Public => "public",
            AccessClass::Private => "private",
            AccessClass::Utility => "utility",
        }
    }
}

impl fmt::Display for AccessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    #[default]
    IPv4,
    IPv6,
}

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::IPv4 => "IPv4",
            AddressFamily::IPv6 => "IPv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address assigned to a server by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub access: AccessClass,
    pub family: AddressFamily,
    pub address: String,
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Started,
    Stopped,
    /// Transitioning between states.
    Maintenance,
    Error,
    #[serde(other)]
    Unknown,
}

/// Storage lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageState {
    Online,
    Maintenance,
    Cloning,
    Backuping,
    Syncing,
    Error,
    #[serde(other)]
    Unknown,
}

/// Role of a storage resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Disk,
    Template,
    Cdrom,
    Backup,
    #[serde(other)]
    Unknown,
}

/// A storage resource: disk, clone or template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    pub uuid: String,
    pub title: String,
    /// Size in GB.
    pub size: u32,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub zone: String,
    pub state: StorageState,
    #[serde(rename = "type")]
    pub kind: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl Storage {
    pub fn is_template(&self) -> bool {
        self.kind == StorageType::Template
    }
}

/// A disk attached to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStorageDevice {
    pub uuid: String,
    pub title: String,
    pub size: u32,
    pub kind: StorageType,
}

/// A server resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub uuid: String,
    pub title: String,
    pub plan: String,
    pub zone: String,
    pub state: ServerState,
    pub ip_addresses: Vec<IpAddress>,
    pub storage_devices: Vec<ServerStorageDevice>,
}

impl Server {
    /// The boot disk, i.e. the first attached disk.
    pub fn boot_storage(&self) -> Option<&ServerStorageDevice> {
        self.storage_devices
            .iter()
            .find(|d| d.kind == StorageType::Disk)
    }
}

/// Requested address on an interface at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAddressRequest {
    pub family: AddressFamily,
    pub address: Option<String>,
}

/// Requested interface at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub access: AccessClass,
    pub ip_addresses: Vec<IpAddressRequest>,
    pub network: Option<String>,
}

/// Parameters for creating a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub title: String,
    pub hostname: String,
    pub zone: String,
    pub plan: String,
    /// Storage cloned into the boot disk.
    pub source_storage: String,
    pub storage_size: u32,
    pub storage_tier: String,
    pub login_user: String,
    pub ssh_public_key: Option<String>,
    pub networking: Vec<InterfaceRequest>,
    /// Enable the metadata service.
    pub metadata: bool,
}

/// Content type of an image stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    OctetStream,
    Gzip,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::OctetStream => "application/octet-stream",
            ContentType::Gzip => "application/gzip",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a completed storage import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageImport {
    /// SHA-256 of the written (decompressed) data, lowercase hex.
    pub sha256sum: String,
    pub written_bytes: u64,
}

/// Byte stream handed to an import.
pub type ImportSource = Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>;
