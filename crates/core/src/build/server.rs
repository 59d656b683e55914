use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::address::select_address;
use super::state::BuildState;
use crate::config::BuildConfig;
use crate::driver::{sleep_cancellable, InterfaceRequest, IpAddressRequest, ServerSpec};
use crate::pipeline::{
    cleanup_token, halt, require, timestamp, PipelineError, StateBag, Step, StepAction,
};

pub const DEFAULT_PLAN: &str = "1xCPU-2GB";
pub const DEFAULT_HOSTNAME: &str = "custom";

/// Creates the temporary server from the source storage.
///
/// Cleanup stops and deletes the server together with its boot disk.
pub struct CreateServer {
    config: Arc<BuildConfig>,
}

impl CreateServer {
    pub fn new(config: Arc<BuildConfig>) -> Self {
        Self { config }
    }

    fn spec(&self, source_storage: &str, public_key: &str) -> ServerSpec {
        let networking = self
            .config
            .effective_interfaces()
            .into_iter()
            .map(|iface| InterfaceRequest {
                access: iface.access,
                ip_addresses: iface
                    .ip_addresses
                    .into_iter()
                    .map(|ip| IpAddressRequest {
                        family: ip.family,
                        address: ip.address,
                    })
                    .collect(),
                network: iface.network,
            })
            .collect();

        ServerSpec {
            title: format!("imagesmith-custom-{}", timestamp()),
            hostname: DEFAULT_HOSTNAME.to_string(),
            zone: self.config.zone.clone(),
            plan: DEFAULT_PLAN.to_string(),
            source_storage: source_storage.to_string(),
            storage_size: self.config.storage_size,
            storage_tier: self.config.storage_tier.clone(),
            login_user: self.config.ssh_username.clone(),
            ssh_public_key: Some(public_key.to_string()).filter(|k| !k.is_empty()),
            networking,
            metadata: false,
        }
    }

    async fn create(&self, state: &mut BuildState) -> Result<(), PipelineError> {
        let public_key = require(&state.ssh_key, "ssh_key")?.public_key.clone();
        let driver = state.driver.clone();
        let cancel = state.cancellation().clone();

        info!("Getting source storage");
        let storage = driver
            .get_storage(
                self.config.storage_uuid.as_deref(),
                self.config.storage_name.as_deref(),
                &cancel,
            )
            .await
            .map_err(|e| {
                PipelineError::driver(
                    format!(
                        "failed to get storage (uuid: {}, name: {})",
                        self.config.storage_uuid.as_deref().unwrap_or("-"),
                        self.config.storage_name.as_deref().unwrap_or("-")
                    ),
                    e,
                )
            })?;
        state.record("source_template_uuid", storage.uuid.clone());
        state.record("source_template_title", storage.title.clone());
        state.source_storage = Some(storage.clone());

        info!("Creating server based on storage '{}'", storage.title);
        let spec = self.spec(&storage.uuid, &public_key);
        let server = match driver.create_server(&spec, &cancel).await {
            Ok(server) => server,
            Err(e) => {
                if let Some(server) = e.created_server() {
                    warn!("Server '{}' ({}) was created but did not start", server.title, server.uuid);
                    state.server = Some(server.clone());
                }
                return Err(PipelineError::driver(
                    format!("failed to create server in zone {}", self.config.zone),
                    e,
                ));
            }
        };
        info!("Server '{}' created and in 'started' state", server.title);

        state.record("server_uuid", server.uuid.clone());
        state.record("server_title", server.title.clone());
        state.record("server_plan", server.plan.clone());
        let assigned = server.ip_addresses.clone();
        state.server = Some(server);

        let address = select_address(&self.config, &assigned)?;
        info!("Selected {} as server address", address);
        state.server_address = Some(address);

        let boot_wait = self.config.boot_wait();
        if !boot_wait.is_zero() {
            info!("Waiting {:?} for boot", boot_wait);
            sleep_cancellable(boot_wait, &cancel)
                .await
                .map_err(|e| PipelineError::driver("boot wait interrupted", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for CreateServer {
    fn name(&self) -> &'static str {
        "create_server"
    }

    async fn run(&self, state: &mut BuildState) -> StepAction {
        match self.create(state).await {
            Ok(()) => StepAction::Continue,
            Err(e) => halt(state, e),
        }
    }

    async fn cleanup(&self, state: &mut BuildState) -> Result<(), PipelineError> {
        let Some(server) = state.server.take() else {
            return Ok(());
        };
        let cancel = cleanup_token();

        info!("Stopping server '{}'", server.title);
        let stopped = state.driver.stop_server(&server.uuid, &cancel).await;
        if let Err(e) = &stopped {
            // the delete may still succeed, e.g. for a server that never started
            warn!("Failed to stop server {}: {}", server.uuid, e);
        }

        info!("Deleting server '{}'", server.title);
        if let Err(e) = state.driver.delete_server(&server.uuid, &cancel).await {
            let err = match stopped {
                Err(stop) => {
                    warn!("Failed to delete server {}: {}", server.uuid, e);
                    PipelineError::driver(format!("failed to stop server {}", server.uuid), stop)
                }
                Ok(()) => {
                    PipelineError::driver(format!("failed to delete server {}", server.uuid), e)
                }
            };
            state.server = Some(server);
            return Err(err);
        }
        Ok(())
    }
}
