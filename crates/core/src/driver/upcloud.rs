//! UpCloud HTTP API (1.3) backend.

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::traits::{Driver, ServerManager, StorageManager, TemplateManager, ZoneManager};
use super::types::{
    ContentType, Created, DriverError, ImportSource, IpAddress, Server, ServerSpec, ServerState,
    ServerStorageDevice, Storage, StorageImport, StorageState, StorageType,
};
use super::wait::{cancellable, poll_until};
use super::create_server_with_metadata_retry;
use crate::config::{ApiConfig, Credentials};

/// Settings for [`UpCloudDriver`].
#[derive(Debug, Clone)]
pub struct UpCloudConfig {
    pub api_url: String,
    pub credentials: Credentials,
    /// Upper bound for every remote state transition.
    pub state_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl UpCloudConfig {
    pub fn new(api: &ApiConfig, credentials: Credentials, state_timeout: Duration) -> Self {
        Self {
            api_url: api.url.clone(),
            credentials,
            state_timeout,
            poll_interval: Duration::from_millis(api.poll_interval_ms),
            request_timeout: Duration::from_secs(api.request_timeout_secs),
        }
    }
}

/// Driver backed by the UpCloud REST API.
pub struct UpCloudDriver {
    client: Client,
    config: UpCloudConfig,
}

impl UpCloudDriver {
    pub fn new(config: UpCloudConfig) -> Result<Self, DriverError> {
        let client = Client::builder()
            .user_agent(concat!("imagesmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/1.3{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.credentials {
            Credentials::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Credentials::Token(token) => builder.bearer_auth(token),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(path))
            .timeout(self.config.request_timeout);
        self.authorize(builder)
    }

    async fn send(builder: RequestBuilder) -> Result<Response, DriverError> {
        let response = builder.send().await.map_err(|e| {
            DriverError::ConnectionFailed(format!("request failed: {}", e))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(parse_error(status, &body))
    }

    /// Send a request and decode the JSON response.
    async fn call<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, DriverError> {
        cancellable(cancel, async {
            let response = Self::send(builder).await?;
            response
                .json::<T>()
                .await
                .map_err(|e| DriverError::InvalidResponse(e.to_string()))
        })
        .await
    }

    /// Send a request whose response body is ignored.
    async fn call_empty(
        &self,
        builder: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        cancellable(cancel, async {
            Self::send(builder).await?;
            Ok(())
        })
        .await
    }

    async fn get_server(&self, uuid: &str, cancel: &CancellationToken) -> Result<Server, DriverError> {
        let envelope: ServerEnvelope = self
            .call(self.request(Method::GET, &format!("/server/{}", uuid)), cancel)
            .await?;
        Ok(envelope.server.into())
    }

    async fn get_storage_by_uuid(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let envelope: StorageEnvelope = self
            .call(self.request(Method::GET, &format!("/storage/{}", uuid)), cancel)
            .await?;
        Ok(envelope.storage)
    }

    async fn list_templates(&self, cancel: &CancellationToken) -> Result<Vec<Storage>, DriverError> {
        let envelope: StorageListEnvelope = self
            .call(self.request(Method::GET, "/storage/template"), cancel)
            .await?;
        Ok(envelope.storages.storage)
    }

    async fn wait_server<P>(
        &self,
        uuid: &str,
        what: &str,
        accept: P,
        cancel: &CancellationToken,
    ) -> Result<Server, DriverError>
    where
        P: Fn(ServerState) -> bool + Copy,
    {
        let what = format!("server {} {}", uuid, what);
        poll_until(
            &what,
            self.config.state_timeout,
            self.config.poll_interval,
            cancel,
            move || async move {
                let server = self.get_server(uuid, cancel).await?;
                Ok(accept(server.state).then_some(server))
            },
        )
        .await
    }

    async fn request_create_server(
        &self,
        spec: ServerSpec,
        cancel: &CancellationToken,
    ) -> Result<Server, DriverError> {
        let body = server_request_body(&spec);
        let envelope: ServerEnvelope = self
            .call(self.request(Method::POST, "/server").json(&body), cancel)
            .await?;
        Ok(envelope.server.into())
    }

    /// Wait for a just-created storage, keeping it in the error when the
    /// wait fails.
    async fn settle_storage(
        &self,
        created: Storage,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        self.wait_storage_online(&created.uuid, cancel)
            .await
            .map_err(|e| DriverError::unsettled(Created::Storage(created), e))
    }

    async fn import_status(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<ImportDetails, DriverError> {
        let envelope: ImportEnvelope = self
            .call(
                self.request(Method::GET, &format!("/storage/{}/import", uuid)),
                cancel,
            )
            .await?;
        Ok(envelope.storage_import)
    }
}

#[async_trait]
impl ServerManager for UpCloudDriver {
    async fn create_server(
        &self,
        spec: &ServerSpec,
        cancel: &CancellationToken,
    ) -> Result<Server, DriverError> {
        let created = create_server_with_metadata_retry(spec, move |spec| {
            self.request_create_server(spec, cancel)
        })
        .await?;
        info!(uuid = %created.uuid, title = %created.title, "Server created, waiting for it to start");
        self.wait_server(&created.uuid, "to start", |s| s == ServerState::Started, cancel)
            .await
            .map_err(|e| DriverError::unsettled(Created::Server(created.clone()), e))
    }

    async fn stop_server(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        let server = self
            .wait_server(uuid, "to leave maintenance", |s| s != ServerState::Maintenance, cancel)
            .await?;
        if server.state == ServerState::Stopped {
            debug!(uuid = %uuid, "Server already stopped");
            return Ok(());
        }

        let body = json!({"stop_server": {"stop_type": "soft", "timeout": "60"}});
        self.call_empty(
            self.request(Method::POST, &format!("/server/{}/stop", uuid))
                .json(&body),
            cancel,
        )
        .await?;
        self.wait_server(uuid, "to stop", |s| s == ServerState::Stopped, cancel)
            .await?;
        Ok(())
    }

    async fn delete_server(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.call_empty(
            self.request(Method::DELETE, &format!("/server/{}?storages=1", uuid)),
            cancel,
        )
        .await
    }

    async fn get_server_storage(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<ServerStorageDevice, DriverError> {
        let server = self.get_server(uuid, cancel).await?;
        server
            .boot_storage()
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("boot disk of server {}", uuid)))
    }
}

#[async_trait]
impl StorageManager for UpCloudDriver {
    async fn get_storage(
        &self,
        uuid: Option<&str>,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        if let Some(uuid) = uuid.filter(|u| !u.is_empty()) {
            return self.get_storage_by_uuid(uuid, cancel).await;
        }
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Err(DriverError::NotFound(
                "storage lookup needs a UUID or a name".to_string(),
            ));
        };
        let templates = self.list_templates(cancel).await?;
        find_by_title_substring(templates, name)
            .ok_or_else(|| DriverError::NotFound(format!("storage matching '{}'", name)))
    }

    async fn rename_storage(
        &self,
        uuid: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let body = json!({"storage": {"title": title}});
        let envelope: StorageEnvelope = self
            .call(
                self.request(Method::PUT, &format!("/storage/{}", uuid)).json(&body),
                cancel,
            )
            .await?;
        Ok(envelope.storage)
    }

    async fn clone_storage(
        &self,
        uuid: &str,
        zone: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let body = json!({"storage": {"zone": zone, "title": title}});
        let envelope: StorageEnvelope = self
            .call(
                self.request(Method::POST, &format!("/storage/{}/clone", uuid))
                    .json(&body),
                cancel,
            )
            .await?;
        self.settle_storage(envelope.storage, cancel).await
    }

    async fn create_storage(
        &self,
        title: &str,
        zone: &str,
        size_gb: u32,
        tier: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let body = json!({"storage": {
            "size": size_gb.to_string(),
            "tier": tier,
            "title": title,
            "zone": zone,
        }});
        let envelope: StorageEnvelope = self
            .call(self.request(Method::POST, "/storage").json(&body), cancel)
            .await?;
        self.settle_storage(envelope.storage, cancel).await
    }

    async fn import_storage(
        &self,
        uuid: &str,
        content_type: ContentType,
        source: ImportSource,
        cancel: &CancellationToken,
    ) -> Result<StorageImport, DriverError> {
        let body = json!({"storage_import": {"source": "direct_upload"}});
        let envelope: ImportEnvelope = self
            .call(
                self.request(Method::POST, &format!("/storage/{}/import", uuid))
                    .json(&body),
                cancel,
            )
            .await?;
        let upload_url = envelope.storage_import.direct_upload_url.ok_or_else(|| {
            DriverError::InvalidResponse("import response has no direct_upload_url".to_string())
        })?;

        debug!(uuid = %uuid, content_type = %content_type, "Streaming image to storage");
        let upload = self
            .authorize(self.client.put(&upload_url))
            .header(CONTENT_TYPE, content_type.as_str())
            .body(Body::wrap_stream(ReaderStream::new(source)));
        self.call_empty(upload, cancel).await?;

        let what = format!("storage {} import to complete", uuid);
        let details = poll_until(
            &what,
            self.config.state_timeout,
            self.config.poll_interval,
            cancel,
            move || async move {
                let status = self.import_status(uuid, cancel).await?;
                match status.state.as_str() {
                    "completed" => Ok(Some(status)),
                    "failed" | "cancelled" => Err(DriverError::rejected(
                        status.error_code.clone().unwrap_or_else(|| "IMPORT_FAILED".to_string()),
                        status
                            .error_message
                            .clone()
                            .unwrap_or_else(|| format!("import {}", status.state)),
                    )),
                    _ => Ok(None),
                }
            },
        )
        .await?;

        Ok(StorageImport {
            sha256sum: details.sha256sum.to_lowercase(),
            written_bytes: details.written_bytes,
        })
    }

    async fn wait_storage_online(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let what = format!("storage {} to become online", uuid);
        poll_until(
            &what,
            self.config.state_timeout,
            self.config.poll_interval,
            cancel,
            move || async move {
                let storage = self.get_storage_by_uuid(uuid, cancel).await?;
                match storage.state {
                    StorageState::Online => Ok(Some(storage)),
                    StorageState::Error => Err(DriverError::rejected(
                        "STORAGE_ERROR",
                        format!("storage {} entered error state", uuid),
                    )),
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    async fn delete_storage(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.call_empty(
            self.request(Method::DELETE, &format!("/storage/{}", uuid)),
            cancel,
        )
        .await
    }
}

#[async_trait]
impl TemplateManager for UpCloudDriver {
    async fn create_template(
        &self,
        storage_uuid: &str,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Storage, DriverError> {
        let body = json!({"storage": {"title": title}});
        let envelope: StorageEnvelope = self
            .call(
                self.request(Method::POST, &format!("/storage/{}/templatize", storage_uuid))
                    .json(&body),
                cancel,
            )
            .await?;
        self.settle_storage(envelope.storage, cancel).await
    }

    async fn get_template_by_name(
        &self,
        name: &str,
        zone: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Storage>, DriverError> {
        let templates = self.list_templates(cancel).await?;
        Ok(templates
            .into_iter()
            .find(|t| t.is_template() && t.title == name && t.zone == zone))
    }

    async fn delete_template(
        &self,
        uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriverError> {
        self.delete_storage(uuid, cancel).await
    }
}

#[async_trait]
impl ZoneManager for UpCloudDriver {
    async fn available_zones(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DriverError> {
        let envelope: ZoneEnvelope = self.call(self.request(Method::GET, "/zone"), cancel).await?;
        Ok(envelope.zones.zone.into_iter().map(|z| z.id).collect())
    }
}

impl Driver for UpCloudDriver {
    fn name(&self) -> &str {
        "upcloud"
    }
}

/// First template whose title contains `name`, ignoring case.
pub(crate) fn find_by_title_substring(storages: Vec<Storage>, name: &str) -> Option<Storage> {
    let needle = name.to_lowercase();
    storages
        .into_iter()
        .find(|s| s.kind == StorageType::Template && s.title.to_lowercase().contains(&needle))
}

fn server_request_body(spec: &ServerSpec) -> Value {
    let interfaces: Vec<Value> = spec
        .networking
        .iter()
        .enumerate()
        .map(|(idx, iface)| {
            let addresses: Vec<Value> = iface
                .ip_addresses
                .iter()
                .map(|ip| {
                    let mut address = json!({"family": ip.family.as_str()});
                    if let Some(literal) = &ip.address {
                        address["address"] = json!(literal);
                    }
                    address
                })
                .collect();
            let mut interface = json!({
                "index": idx + 1,
                "type": iface.access.as_str(),
                "ip_addresses": {"ip_address": addresses},
            });
            if let Some(network) = &iface.network {
                interface["network"] = json!(network);
            }
            interface
        })
        .collect();

    let mut login_user = json!({"username": spec.login_user, "create_password": "no"});
    if let Some(key) = &spec.ssh_public_key {
        login_user["ssh_keys"] = json!({"ssh_key": [key]});
    }

    json!({"server": {
        "zone": spec.zone,
        "title": spec.title,
        "hostname": spec.hostname,
        "plan": spec.plan,
        "metadata": if spec.metadata { "yes" } else { "no" },
        "password_delivery": "none",
        "login_user": login_user,
        "storage_devices": {"storage_device": [{
            "action": "clone",
            "storage": spec.source_storage,
            "title": format!("{}-disk1", spec.title),
            "size": spec.storage_size,
            "tier": spec.storage_tier,
        }]},
        "networking": {"interfaces": {"interface": interfaces}},
    }})
}

/// Map a non-success response into a driver error. Understands the legacy
/// `{"error": {...}}` body and problem+json with an `#ERROR_<CODE>` type.
fn parse_error(status: StatusCode, body: &str) -> DriverError {
    let (code, message) = if let Ok(legacy) = serde_json::from_str::<LegacyErrorBody>(body) {
        (legacy.error.error_code, legacy.error.error_message)
    } else if let Ok(problem) = serde_json::from_str::<ProblemBody>(body) {
        let code = problem
            .kind
            .rsplit_once("#ERROR_")
            .map(|(_, code)| code.to_string())
            .unwrap_or_else(|| status.as_u16().to_string());
        (code, problem.title)
    } else {
        (status.as_u16().to_string(), body.trim().to_string())
    };

    if status == StatusCode::NOT_FOUND {
        DriverError::NotFound(message)
    } else {
        DriverError::Rejected { code, message }
    }
}

#[derive(Deserialize)]
struct LegacyErrorBody {
    error: LegacyErrorDetail,
}

#[derive(Deserialize)]
struct LegacyErrorDetail {
    error_code: String,
    error_message: String,
}

#[derive(Deserialize)]
struct ProblemBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerDetails,
}

#[derive(Deserialize)]
struct ServerDetails {
    uuid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    plan: String,
    #[serde(default)]
    zone: String,
    state: ServerState,
    #[serde(default)]
    ip_addresses: IpAddressList,
    #[serde(default)]
    storage_devices: StorageDeviceList,
}

#[derive(Deserialize, Default)]
struct IpAddressList {
    #[serde(default)]
    ip_address: Vec<IpAddress>,
}

#[derive(Deserialize, Default)]
struct StorageDeviceList {
    #[serde(default)]
    storage_device: Vec<StorageDeviceDetails>,
}

#[derive(Deserialize)]
struct StorageDeviceDetails {
    storage: String,
    #[serde(default)]
    storage_title: String,
    #[serde(default)]
    storage_size: u32,
    #[serde(rename = "type")]
    kind: StorageType,
}

impl From<ServerDetails> for Server {
    fn from(details: ServerDetails) -> Self {
        Server {
            uuid: details.uuid,
            title: details.title,
            plan: details.plan,
            zone: details.zone,
            state: details.state,
            ip_addresses: details.ip_addresses.ip_address,
            storage_devices: details
                .storage_devices
                .storage_device
                .into_iter()
                .map(|d| ServerStorageDevice {
                    uuid: d.storage,
                    title: d.storage_title,
                    size: d.storage_size,
                    kind: d.kind,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct StorageEnvelope {
    storage: Storage,
}

#[derive(Deserialize)]
struct StorageListEnvelope {
    storages: StorageList,
}

#[derive(Deserialize)]
struct StorageList {
    #[serde(default)]
    storage: Vec<Storage>,
}

#[derive(Deserialize)]
struct ImportEnvelope {
    storage_import: ImportDetails,
}

#[derive(Deserialize)]
struct ImportDetails {
    state: String,
    #[serde(default)]
    sha256sum: String,
    #[serde(default)]
    direct_upload_url: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    written_bytes: u64,
}

#[derive(Deserialize)]
struct ZoneEnvelope {
    zones: ZoneList,
}

#[derive(Deserialize)]
struct ZoneList {
    #[serde(default)]
    zone: Vec<ZoneDetails>,
}

#[derive(Deserialize)]
struct ZoneDetails {
    id: String,
}
